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

//! Circulation service
//!
//! Loans, reservations, fines and payments on top of the SQLite store.
//!
//! # Components
//! - Ledger (`ledger.rs`) - checkout, renew, checkin, lost copies
//! - Reservations (`reservations.rs`) - FIFO queue per item, hold shelf
//! - Fines (`fines.rs`) - overdue assessment, manual fines, waivers
//! - Payments (`payments.rs`) - applying money against fine balances
//! - Notices (`notices.rs`) - overdue and due-soon scans
//!
//! # Atomicity
//! Every mutating call is one database transaction: reads, status
//! compare-and-sets, inserts and any cascaded reservation promotion either
//! all commit or all roll back. Notifications and audit records are buffered
//! in an outbox and handed to the [`EventSink`] only after commit.
//!
//! # Usage Example
//! ```no_run
//! use circulation_core::{Circulation, CirculationPolicy, storage::Database};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new("./circulation.db").await?;
//! let circulation = Circulation::new(db, CirculationPolicy::default())?;
//!
//! let loan = circulation.checkout(1, 10, Some("desk-1")).await?;
//! let returned = circulation.checkin(loan.id, Some("desk-1")).await?;
//! assert!(!returned.is_open());
//! # Ok(())
//! # }
//! ```

mod fines;
mod ledger;
mod notices;
mod payments;
mod reservations;

pub use payments::PaymentRequest;

use crate::clock::{Clock, SystemClock};
use crate::config::CirculationPolicy;
use crate::error::{CirculationError, Result};
use crate::events::{AuditRecord, EventSink, Outbox, TracingSink};
use crate::storage::models::*;
use crate::storage::{queries, CatalogStore, Database, MemberStore};
use chrono::{Days, NaiveDate};
use sqlx::SqliteConnection;
use std::fmt;
use std::sync::Arc;

/// Circulation domain service
///
/// Cheap to clone; clones share the pool, clock and sink.
#[derive(Clone)]
pub struct Circulation {
    db: Database,
    policy: CirculationPolicy,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for Circulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circulation")
            .field("db", &self.db)
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Circulation {
    /// Create a service using the wall clock and logging sink
    ///
    /// # Errors
    /// Returns `ConfigurationError` if the policy is invalid
    pub fn new(db: Database, policy: CirculationPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            db,
            policy,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingSink),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn policy(&self) -> &CirculationPolicy {
        &self.policy
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Catalog store sharing this service's pool and clock
    pub fn catalog(&self) -> CatalogStore {
        CatalogStore::new(self.db.clone(), self.clock.clone())
    }

    /// Member store sharing this service's pool and clock
    pub fn members(&self) -> MemberStore {
        MemberStore::new(self.db.clone(), self.clock.clone())
    }

    // ========================================================================
    // READ HELPERS
    // ========================================================================

    pub async fn transaction(&self, id: i64) -> Result<Transaction> {
        let mut conn = self.db.pool().acquire().await?;
        load_transaction(&mut conn, id).await
    }

    pub async fn reservation(&self, id: i64) -> Result<Reservation> {
        let mut conn = self.db.pool().acquire().await?;
        load_reservation(&mut conn, id).await
    }

    pub async fn fine(&self, id: i64) -> Result<Fine> {
        let mut conn = self.db.pool().acquire().await?;
        load_fine(&mut conn, id).await
    }

    /// Member's loans that have not been returned
    pub async fn open_transactions_for_member(&self, member_id: i64) -> Result<Vec<Transaction>> {
        let mut conn = self.db.pool().acquire().await?;
        queries::list_open_transactions_for_member(&mut conn, member_id).await
    }

    /// Loan currently open on a copy, if any
    pub async fn open_loan_for_copy(&self, copy_id: i64) -> Result<Option<Transaction>> {
        let mut conn = self.db.pool().acquire().await?;
        queries::find_open_transaction_for_copy(&mut conn, copy_id).await
    }

    /// Every loan of a copy, newest first
    pub async fn copy_history(&self, copy_id: i64) -> Result<Vec<Transaction>> {
        let mut conn = self.db.pool().acquire().await?;
        queries::list_copy_history(&mut conn, copy_id).await
    }

    pub async fn member_fines(&self, member_id: i64) -> Result<Vec<Fine>> {
        let mut conn = self.db.pool().acquire().await?;
        queries::list_member_fines(&mut conn, member_id).await
    }

    pub async fn fines_for_transaction(&self, transaction_id: i64) -> Result<Vec<Fine>> {
        let mut conn = self.db.pool().acquire().await?;
        queries::list_fines_for_transaction(&mut conn, transaction_id).await
    }

    /// Total unpaid balance across a member's fines, in cents
    pub async fn outstanding_balance(&self, member_id: i64) -> Result<i64> {
        let mut conn = self.db.pool().acquire().await?;
        queries::outstanding_balance(&mut conn, member_id).await
    }

    /// Reservation queue for an item, in promotion order
    pub async fn pending_reservations(&self, item_id: i64) -> Result<Vec<Reservation>> {
        let mut conn = self.db.pool().acquire().await?;
        queries::list_pending_reservations(&mut conn, item_id).await
    }

    pub async fn payments_for_fine(&self, fine_id: i64) -> Result<Vec<Payment>> {
        let mut conn = self.db.pool().acquire().await?;
        queries::list_payments_for_fine(&mut conn, fine_id).await
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn audit_record(
        &self,
        action: &str,
        entity: &str,
        entity_id: i64,
        actor: Option<&str>,
        changes: serde_json::Value,
    ) -> AuditRecord {
        AuditRecord::new(action, entity, entity_id, actor, changes, self.clock.now())
    }

    /// Hand buffered events to the sink (call only after commit)
    fn publish(&self, outbox: Outbox) {
        outbox.publish(self.sink.as_ref());
    }
}

// ============================================================================
// LOOKUPS INSIDE A UNIT OF WORK
// ============================================================================

async fn load_profile(conn: &mut SqliteConnection, member_id: i64) -> Result<MemberProfile> {
    queries::find_member_profile(conn, member_id)
        .await?
        .ok_or_else(|| CirculationError::not_found("member", member_id))
}

async fn load_copy(conn: &mut SqliteConnection, copy_id: i64) -> Result<ItemCopy> {
    queries::find_copy(conn, copy_id)
        .await?
        .ok_or_else(|| CirculationError::not_found("copy", copy_id))
}

async fn load_transaction(conn: &mut SqliteConnection, id: i64) -> Result<Transaction> {
    queries::find_transaction(conn, id)
        .await?
        .ok_or_else(|| CirculationError::not_found("transaction", id))
}

async fn load_reservation(conn: &mut SqliteConnection, id: i64) -> Result<Reservation> {
    queries::find_reservation(conn, id)
        .await?
        .ok_or_else(|| CirculationError::not_found("reservation", id))
}

async fn load_fine(conn: &mut SqliteConnection, id: i64) -> Result<Fine> {
    queries::find_fine(conn, id)
        .await?
        .ok_or_else(|| CirculationError::not_found("fine", id))
}

/// `date + days`, refusing periods that run off the calendar
fn add_days(date: NaiveDate, days: i64) -> Result<NaiveDate> {
    u64::try_from(days)
        .ok()
        .and_then(|days| date.checked_add_days(Days::new(days)))
        .ok_or_else(|| {
            CirculationError::InvalidInput(format!("cannot add {} days to {}", days, date))
        })
}

/// A compare-and-set lost to a concurrent writer
fn lost_race(what: &str, id: i64) -> CirculationError {
    CirculationError::Retryable(format!("{} {} was changed concurrently", what, id))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for circulation tests

    use super::*;
    use crate::clock::FixedClock;
    use crate::events::MemorySink;

    pub(crate) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    pub(crate) struct Fixture {
        pub circulation: Circulation,
        pub clock: Arc<FixedClock>,
        pub sink: Arc<MemorySink>,
        pub membership: MembershipType,
    }

    impl Fixture {
        /// Library on 2025-06-01 with one standard membership type
        /// (5 books, 14 days, 2 renewals, 1.00/day)
        pub(crate) async fn new() -> Self {
            Self::with_policy(CirculationPolicy::default()).await
        }

        pub(crate) async fn with_policy(policy: CirculationPolicy) -> Self {
            let db = Database::new_in_memory().await.expect("Failed to create database");
            let clock = Arc::new(FixedClock::on_date(date(2025, 6, 1)));
            let sink = Arc::new(MemorySink::new());
            let circulation = Circulation::new(db, policy)
                .expect("Failed to create service")
                .with_clock(clock.clone())
                .with_sink(sink.clone());

            let membership = circulation
                .members()
                .add_membership_type(&NewMembershipType::new(
                    "STD".to_string(),
                    "Standard".to_string(),
                    MembershipKind::Public,
                ))
                .await
                .expect("Failed to add membership type");

            Self {
                circulation,
                clock,
                sink,
                membership,
            }
        }

        pub(crate) async fn member(&self, number: &str) -> Member {
            self.circulation
                .members()
                .add_member(&NewMember {
                    member_id: number.to_string(),
                    first_name: "Test".to_string(),
                    last_name: number.to_string(),
                    email: format!("{}@example.org", number.to_lowercase()),
                    phone: String::new(),
                    barcode: format!("MB-{}", number),
                    membership_type_id: self.membership.id,
                    registration_date: date(2025, 1, 1),
                    expiry_date: date(2026, 12, 31),
                })
                .await
                .expect("Failed to add member")
        }

        pub(crate) async fn item_with_copies(&self, title: &str, copies: usize) -> (Item, Vec<ItemCopy>) {
            let catalog = self.circulation.catalog();
            let item = catalog
                .add_item(&NewItem::book(title.to_string()))
                .await
                .expect("Failed to add item");

            let mut added = Vec::new();
            for n in 0..copies {
                let copy = catalog
                    .add_copy(&NewCopy {
                        item_id: item.id,
                        barcode: format!("{}-{}", title.replace(' ', "").to_uppercase(), n + 1),
                        location: "Stacks".to_string(),
                        price_cents: 2500,
                    })
                    .await
                    .expect("Failed to add copy");
                added.push(copy);
            }

            (item, added)
        }

        pub(crate) async fn copy_status(&self, copy_id: i64) -> CopyStatus {
            self.circulation
                .catalog()
                .get_copy(copy_id)
                .await
                .expect("Failed to load copy")
                .status
        }
    }
}
