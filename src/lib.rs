// Circulation Core - Library circulation domain service
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Library circulation core
//!
//! Loans, reservations, fines and payments for a lending library, backed by
//! SQLite. Members, membership types, items and copies are kept in simple
//! stores the circulation service reads from.
//!
//! # Modules
//! - [`circulation`] - the [`Circulation`] service and its operations
//! - [`storage`] - database handle, migrations, models and queries
//! - [`config`] - [`CirculationPolicy`] knobs
//! - [`events`] - notifications and audit records ([`EventSink`])
//! - [`clock`] - injectable time source
//! - [`error`] - [`CirculationError`] and its reported [`ErrorKind`]

pub mod circulation;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod storage;

pub use circulation::{Circulation, PaymentRequest};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::CirculationPolicy;
pub use error::{CirculationError, ErrorKind, Result};
pub use events::{AuditRecord, EventSink, MemorySink, NotificationEvent, TracingSink};
pub use logging::init_logging;
