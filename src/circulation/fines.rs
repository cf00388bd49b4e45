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

//! Fine engine
//!
//! Overdue fines are `days_overdue x fine_per_day`, capped by the policy. A
//! transaction carries at most one overdue fine: assessing again updates the
//! unsettled fine instead of issuing a second one. Fines are never deleted.

use super::{load_fine, load_profile, load_transaction, lost_race, Circulation};
use crate::error::{CirculationError, Result};
use crate::events::{NotificationEvent, Outbox};
use crate::storage::models::*;
use crate::storage::queries;
use chrono::NaiveDate;
use serde_json::json;
use sqlx::SqliteConnection;

impl Circulation {
    /// Assess (or re-assess) the overdue fine for an open loan
    ///
    /// # Errors
    /// - `TransactionClosed` - loan already returned (checkin assessed it)
    /// - `InvalidState` - loan is not overdue, or the membership charges nothing
    #[tracing::instrument(skip(self))]
    pub async fn assess_overdue(&self, transaction_id: i64, actor: Option<&str>) -> Result<Fine> {
        let today = self.clock.today();
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let transaction = load_transaction(&mut tx, transaction_id).await?;
        if !transaction.is_open() {
            return Err(CirculationError::TransactionClosed { transaction_id });
        }
        if !transaction.is_overdue(today) {
            return Err(CirculationError::InvalidState(format!(
                "transaction {} is not overdue",
                transaction_id
            )));
        }

        let profile = load_profile(&mut tx, transaction.member_id).await?;
        let fine = self
            .upsert_overdue_fine(&mut tx, &transaction, &profile.membership, today, actor, &mut outbox)
            .await?
            .ok_or_else(|| {
                CirculationError::InvalidState(format!(
                    "membership {} charges no overdue fines",
                    profile.membership.code
                ))
            })?;

        tx.commit().await?;
        self.publish(outbox);

        Ok(fine)
    }

    /// Issue a non-overdue fine (damage, membership fee, other charges)
    #[tracing::instrument(skip(self))]
    pub async fn issue_fine(
        &self,
        member_id: i64,
        fine_type: FineType,
        amount_cents: i64,
        description: &str,
        actor: Option<&str>,
    ) -> Result<Fine> {
        if amount_cents <= 0 {
            return Err(CirculationError::InvalidInput(
                "fine amount must be positive".to_string(),
            ));
        }
        if fine_type == FineType::Overdue {
            return Err(CirculationError::InvalidInput(
                "overdue fines are assessed from transactions".to_string(),
            ));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        load_profile(&mut tx, member_id).await?;

        let fine_id = queries::insert_fine(
            &mut tx,
            &NewFine {
                member_id,
                transaction_id: None,
                fine_type,
                amount_cents,
                issue_date: now.date_naive(),
                description: description.to_string(),
            },
            now,
        )
        .await?;

        outbox.notify(NotificationEvent::FineIssued {
            member_id,
            fine_id,
            amount_cents,
        });
        outbox.audit(self.audit_record(
            "issue",
            "fine",
            fine_id,
            actor,
            json!({ "fine_type": fine_type, "amount_cents": amount_cents }),
        ));

        let fine = load_fine(&mut tx, fine_id).await?;
        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(fine_id, member_id, %fine_type, amount = %format_cents(amount_cents), "fine issued");

        Ok(fine)
    }

    /// Forgive the remaining balance of a fine
    ///
    /// Waiving an already waived fine returns it unchanged.
    ///
    /// # Errors
    /// - `InvalidState` - fine is already paid
    #[tracing::instrument(skip(self))]
    pub async fn waive(&self, fine_id: i64, staff: &str) -> Result<Fine> {
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let fine = load_fine(&mut tx, fine_id).await?;
        match fine.status {
            FineStatus::Waived => return Ok(fine),
            FineStatus::Paid => {
                return Err(CirculationError::InvalidState(format!(
                    "fine {} is already paid",
                    fine_id
                )));
            }
            FineStatus::Unpaid | FineStatus::Partial => {}
        }

        let note = format!("Waived by {}", staff);
        if !queries::waive_fine(&mut tx, fine_id, &note).await? {
            return Err(lost_race("fine", fine_id));
        }

        outbox.audit(self.audit_record(
            "waive",
            "fine",
            fine_id,
            Some(staff),
            json!({
                "status": [fine.status, FineStatus::Waived],
                "forgiven_cents": fine.balance_cents(),
            }),
        ));

        let waived = load_fine(&mut tx, fine_id).await?;
        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(fine_id, staff, "fine waived");

        Ok(waived)
    }

    /// Create or update the overdue fine for a transaction
    ///
    /// A paid fine is reopened as `partial` when more late days accrue; a
    /// waived fine is left alone. Returns `None` when the computed amount is
    /// zero and no fine exists.
    pub(super) async fn upsert_overdue_fine(
        &self,
        conn: &mut SqliteConnection,
        transaction: &Transaction,
        membership: &MembershipType,
        today: NaiveDate,
        actor: Option<&str>,
        outbox: &mut Outbox,
    ) -> Result<Option<Fine>> {
        let days = transaction.days_overdue(today);
        let amount_cents = self
            .policy
            .cap_fine(days.saturating_mul(membership.fine_per_day_cents));

        match queries::find_overdue_fine_for_transaction(conn, transaction.id).await? {
            Some(existing) if existing.status == FineStatus::Waived => Ok(Some(existing)),
            Some(existing) if existing.amount_cents >= amount_cents && existing.status.is_settled() => {
                Ok(Some(existing))
            }
            Some(existing) if existing.amount_cents == amount_cents => Ok(Some(existing)),
            Some(existing) => {
                let new_amount = amount_cents.max(existing.amount_paid_cents);
                let status = FineStatus::from_amounts(new_amount, existing.amount_paid_cents);
                if !queries::update_fine_amount(conn, existing.id, new_amount, status).await? {
                    return Err(lost_race("fine", existing.id));
                }

                outbox.audit(self.audit_record(
                    "reassess",
                    "fine",
                    existing.id,
                    actor,
                    json!({
                        "amount_cents": [existing.amount_cents, new_amount],
                        "days_overdue": days,
                    }),
                ));

                Ok(Some(load_fine(conn, existing.id).await?))
            }
            None if amount_cents == 0 => Ok(None),
            None => {
                let fine_id = queries::insert_fine(
                    conn,
                    &NewFine {
                        member_id: transaction.member_id,
                        transaction_id: Some(transaction.id),
                        fine_type: FineType::Overdue,
                        amount_cents,
                        issue_date: today,
                        description: format!(
                            "{} day(s) overdue at {} per day",
                            days,
                            format_cents(membership.fine_per_day_cents)
                        ),
                    },
                    self.clock.now(),
                )
                .await?;

                outbox.notify(NotificationEvent::FineIssued {
                    member_id: transaction.member_id,
                    fine_id,
                    amount_cents,
                });
                outbox.audit(self.audit_record(
                    "issue",
                    "fine",
                    fine_id,
                    actor,
                    json!({
                        "fine_type": FineType::Overdue,
                        "transaction_id": transaction.id,
                        "amount_cents": amount_cents,
                        "days_overdue": days,
                    }),
                ));

                tracing::info!(
                    fine_id,
                    transaction_id = transaction.id,
                    days,
                    amount = %format_cents(amount_cents),
                    "overdue fine issued"
                );

                Ok(Some(load_fine(conn, fine_id).await?))
            }
        }
    }
}
