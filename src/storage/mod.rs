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

//! Database storage and models
//!
//! This module handles all database operations using SQLite via sqlx.
//!
//! # Database Schema
//! - membership_types / members: who may borrow and under which limits
//! - items / copies: what can be borrowed
//! - transactions: loans (open while return_date is NULL)
//! - reservations: FIFO queue per item, with hold-shelf state
//! - fines / payments: money owed and received
//!
//! # Usage Example
//! ```no_run
//! use circulation_core::storage::{Database, queries, models::NewItem};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new("./circulation.db").await?;
//!
//! let mut conn = db.pool().acquire().await?;
//! let item_id = queries::insert_item(&mut conn, &NewItem::book("Dune".to_string()), chrono::Utc::now()).await?;
//! let copies = queries::list_item_copies(&mut conn, item_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod database;
pub mod members;
pub mod migrations;
pub mod models;
pub mod queries;

// Re-export commonly used types
pub use catalog::CatalogStore;
pub use database::{Database, DatabaseStats};
pub use members::MemberStore;
pub use models::{
    CopyStatus, Fine, FineStatus, FineType, Item, ItemCopy, ItemType, Member, MemberProfile,
    MembershipKind, MembershipType, NewCopy, NewFine, NewItem, NewMember, NewMembershipType,
    Payment, PaymentMethod, Reservation, ReservationStatus, Transaction, TransactionType,
};
