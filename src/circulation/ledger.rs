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

//! Circulation ledger
//!
//! Owns loan transactions. A checkout opens a transaction and moves the copy
//! to `checked_out`; checkin closes it, hands the copy to the next reservation
//! (or back to the shelf) and assesses an overdue fine when the loan was late.

use super::{add_days, load_copy, load_profile, load_transaction, lost_race, Circulation};
use crate::error::{CirculationError, Result};
use crate::events::{NotificationEvent, Outbox};
use crate::storage::models::*;
use crate::storage::queries;
use serde_json::json;

impl Circulation {
    /// Lend a copy to a member
    ///
    /// # Errors
    /// - `MemberInvalid` - membership inactive or expired
    /// - `MemberAtLimit` - open loans already at `max_books`
    /// - `CopyUnavailable` - copy not on the shelf (or held for someone else)
    #[tracing::instrument(skip(self))]
    pub async fn checkout(
        &self,
        member_id: i64,
        copy_id: i64,
        staff: Option<&str>,
    ) -> Result<Transaction> {
        let now = self.clock.now();
        let today = self.clock.today();
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let profile = load_profile(&mut tx, member_id).await?;
        if !profile.can_borrow(today) {
            tracing::warn!(member = %profile.member.member_id, "checkout refused: membership not valid");
            return Err(CirculationError::MemberInvalid {
                member_id: profile.member.member_id,
            });
        }

        let open = queries::count_open_transactions(&mut tx, member_id).await?;
        if open >= profile.membership.max_books {
            tracing::warn!(member = %profile.member.member_id, open, "checkout refused: loan limit");
            return Err(CirculationError::MemberAtLimit {
                member_id: profile.member.member_id,
                max_books: profile.membership.max_books,
            });
        }

        let copy = load_copy(&mut tx, copy_id).await?;
        let fulfilled = match copy.status {
            CopyStatus::Available => {
                // Taking any copy of a reserved item satisfies the member's own reservation
                match queries::find_active_reservation(&mut tx, member_id, copy.item_id).await? {
                    Some(reservation) => {
                        self.fulfil_reservation(&mut tx, &reservation, today, staff, &mut outbox)
                            .await?;
                        if let Some(held_id) = reservation.held_copy_id.filter(|held| *held != copy.id) {
                            let held = load_copy(&mut tx, held_id).await?;
                            if held.status == CopyStatus::Reserved {
                                self.release_copy(&mut tx, &held, staff, &mut outbox).await?;
                            }
                        }
                        Some(reservation.id)
                    }
                    None => None,
                }
            }
            CopyStatus::Reserved => match queries::find_hold_for_copy(&mut tx, copy.id).await? {
                Some(hold) if hold.member_id == member_id => {
                    self.fulfil_reservation(&mut tx, &hold, today, staff, &mut outbox)
                        .await?;
                    Some(hold.id)
                }
                _ => return Err(copy_unavailable(&copy)),
            },
            _ => return Err(copy_unavailable(&copy)),
        };

        if !queries::transition_copy_status(&mut tx, copy.id, copy.status, CopyStatus::CheckedOut)
            .await?
        {
            return Err(copy_unavailable(&copy));
        }

        let due_date = add_days(today, profile.membership.loan_period_days)?;
        let transaction_id =
            match queries::insert_checkout(&mut tx, member_id, copy.id, now, due_date, staff).await {
                Ok(id) => id,
                Err(CirculationError::Database(sqlx::Error::Database(db_err)))
                    if db_err.is_unique_violation() =>
                {
                    // Copy status said available but a loan is still open on it
                    return Err(copy_unavailable(&copy));
                }
                Err(e) => return Err(e),
            };

        outbox.audit(self.audit_record(
            "checkout",
            "transaction",
            transaction_id,
            staff,
            json!({
                "member_id": member_id,
                "copy_id": copy.id,
                "due_date": due_date,
                "copy_status": [copy.status, CopyStatus::CheckedOut],
                "reservation_fulfilled": fulfilled,
            }),
        ));

        let transaction = load_transaction(&mut tx, transaction_id).await?;
        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(
            transaction_id,
            member = %profile.member.member_id,
            copy = %copy.barcode,
            %due_date,
            "checked out"
        );

        Ok(transaction)
    }

    /// Extend an open loan by one loan period
    ///
    /// # Errors
    /// - `TransactionClosed` - loan already returned
    /// - `RenewalLimitExceeded` - `renewed_count` already at `max_renewals`
    /// - `ItemReserved` - other members are queued for the item (when the
    ///   policy blocks renewals for reserved items)
    #[tracing::instrument(skip(self))]
    pub async fn renew(&self, transaction_id: i64, staff: Option<&str>) -> Result<Transaction> {
        let today = self.clock.today();
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let transaction = load_transaction(&mut tx, transaction_id).await?;
        if !transaction.is_open() {
            return Err(CirculationError::TransactionClosed { transaction_id });
        }

        let profile = load_profile(&mut tx, transaction.member_id).await?;
        if transaction.renewed_count >= profile.membership.max_renewals {
            tracing::warn!(transaction_id, "renewal refused: limit reached");
            return Err(CirculationError::RenewalLimitExceeded {
                transaction_id,
                max_renewals: profile.membership.max_renewals,
            });
        }

        if self.policy.block_renewal_when_reserved {
            let copy = load_copy(&mut tx, transaction.copy_id).await?;
            let waiting = queries::count_pending_reservations_excluding(
                &mut tx,
                copy.item_id,
                transaction.member_id,
            )
            .await?;
            if waiting > 0 {
                tracing::warn!(transaction_id, waiting, "renewal refused: item reserved");
                return Err(CirculationError::ItemReserved {
                    item_id: copy.item_id,
                    waiting,
                });
            }
        }

        let previous_due = transaction.due_date.unwrap_or(today);
        let new_due = add_days(previous_due, profile.membership.loan_period_days)?;
        if !queries::record_renewal(&mut tx, transaction_id, transaction.renewed_count, new_due)
            .await?
        {
            return Err(lost_race("transaction", transaction_id));
        }

        outbox.audit(self.audit_record(
            "renew",
            "transaction",
            transaction_id,
            staff,
            json!({
                "due_date": [transaction.due_date, new_due],
                "renewed_count": [transaction.renewed_count, transaction.renewed_count + 1],
            }),
        ));

        let renewed = load_transaction(&mut tx, transaction_id).await?;
        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(transaction_id, %new_due, renewed_count = renewed.renewed_count, "renewed");

        Ok(renewed)
    }

    /// Return a copy
    ///
    /// Closes the loan, promotes the next reservation for the item (the copy
    /// goes to the hold shelf instead of the open shelf) and issues an
    /// overdue fine if the loan was late, all in one unit of work.
    ///
    /// # Errors
    /// - `TransactionClosed` - loan already returned
    #[tracing::instrument(skip(self))]
    pub async fn checkin(&self, transaction_id: i64, staff: Option<&str>) -> Result<Transaction> {
        let today = self.clock.today();
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let transaction = load_transaction(&mut tx, transaction_id).await?;
        if !transaction.is_open() {
            return Err(CirculationError::TransactionClosed { transaction_id });
        }

        if !queries::close_transaction(&mut tx, transaction_id, today, None).await? {
            return Err(CirculationError::TransactionClosed { transaction_id });
        }

        let copy = load_copy(&mut tx, transaction.copy_id).await?;
        let promoted = if copy.status == CopyStatus::CheckedOut {
            self.release_copy(&mut tx, &copy, staff, &mut outbox).await?
        } else {
            tracing::warn!(copy = %copy.barcode, status = %copy.status, "checked in copy was not marked checked out");
            None
        };

        let fine = if transaction.is_overdue(today) {
            let profile = load_profile(&mut tx, transaction.member_id).await?;
            self.upsert_overdue_fine(&mut tx, &transaction, &profile.membership, today, staff, &mut outbox)
                .await?
        } else {
            None
        };

        let returned_to = match (&promoted, copy.status) {
            (Some(_), _) => CopyStatus::Reserved,
            (None, CopyStatus::CheckedOut) => CopyStatus::Available,
            (None, unchanged) => unchanged,
        };
        outbox.audit(self.audit_record(
            "checkin",
            "transaction",
            transaction_id,
            staff,
            json!({
                "return_date": today,
                "days_overdue": transaction.days_overdue(today),
                "copy_status": [copy.status, returned_to],
                "promoted_reservation": promoted.as_ref().map(|r| r.id),
                "fine_id": fine.as_ref().map(|f| f.id),
            }),
        ));

        let closed = load_transaction(&mut tx, transaction_id).await?;
        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(
            transaction_id,
            copy = %copy.barcode,
            held = promoted.is_some(),
            fined = fine.is_some(),
            "checked in"
        );

        Ok(closed)
    }

    /// Close a loan whose copy will not come back
    ///
    /// The copy is marked lost and a `lost` fine for its price is issued
    /// (none when the copy has no recorded price).
    #[tracing::instrument(skip(self))]
    pub async fn declare_lost(&self, transaction_id: i64, staff: Option<&str>) -> Result<Option<Fine>> {
        let now = self.clock.now();
        let today = self.clock.today();
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let transaction = load_transaction(&mut tx, transaction_id).await?;
        if !transaction.is_open() {
            return Err(CirculationError::TransactionClosed { transaction_id });
        }

        if !queries::close_transaction(&mut tx, transaction_id, today, Some("Declared lost")).await? {
            return Err(CirculationError::TransactionClosed { transaction_id });
        }

        let copy = load_copy(&mut tx, transaction.copy_id).await?;
        if !queries::transition_copy_status(&mut tx, copy.id, copy.status, CopyStatus::Lost).await? {
            return Err(lost_race("copy", copy.id));
        }

        let fine = if copy.price_cents > 0 {
            let fine_id = queries::insert_fine(
                &mut tx,
                &NewFine {
                    member_id: transaction.member_id,
                    transaction_id: Some(transaction_id),
                    fine_type: FineType::Lost,
                    amount_cents: copy.price_cents,
                    issue_date: today,
                    description: format!("Replacement cost for copy {}", copy.barcode),
                },
                now,
            )
            .await?;
            outbox.notify(NotificationEvent::FineIssued {
                member_id: transaction.member_id,
                fine_id,
                amount_cents: copy.price_cents,
            });
            Some(super::load_fine(&mut tx, fine_id).await?)
        } else {
            None
        };

        outbox.audit(self.audit_record(
            "declare_lost",
            "transaction",
            transaction_id,
            staff,
            json!({
                "return_date": today,
                "copy_status": [copy.status, CopyStatus::Lost],
                "fine_id": fine.as_ref().map(|f| f.id),
            }),
        ));

        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(transaction_id, copy = %copy.barcode, "copy declared lost");

        Ok(fine)
    }
}

fn copy_unavailable(copy: &ItemCopy) -> CirculationError {
    CirculationError::CopyUnavailable {
        barcode: copy.barcode.clone(),
        status: copy.status.to_string(),
    }
}
