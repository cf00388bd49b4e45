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

//! Payment processor
//!
//! Applies money against a single fine. The fine's paid amount is updated
//! with a compare-and-set on its previous value, so two desks paying the same
//! fine cannot both apply against one balance.

use super::{load_fine, lost_race, Circulation};
use crate::error::{CirculationError, Result};
use crate::events::Outbox;
use crate::storage::models::*;
use crate::storage::queries::{self, PaymentRow};
use serde_json::json;

/// Money presented at the desk for one fine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub receipt_number: String,
    pub staff_user: Option<String>,
    pub external_reference: Option<String>,
    pub notes: String,
}

impl PaymentRequest {
    pub fn new(amount_cents: i64, method: PaymentMethod, receipt_number: impl Into<String>) -> Self {
        Self {
            amount_cents,
            method,
            receipt_number: receipt_number.into(),
            staff_user: None,
            external_reference: None,
            notes: String::new(),
        }
    }

    pub fn staff(mut self, staff_user: impl Into<String>) -> Self {
        self.staff_user = Some(staff_user.into());
        self
    }

    /// Card terminal or online gateway reference
    pub fn reference(mut self, external_reference: impl Into<String>) -> Self {
        self.external_reference = Some(external_reference.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

impl Circulation {
    /// New receipt number: `<prefix>-<YYYYMMDD>-<random>`
    ///
    /// Uniqueness is enforced by the store; on `DuplicateReceipt` generate a
    /// fresh number and retry.
    pub fn generate_receipt_number(&self) -> String {
        let random = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        format!(
            "{}-{}-{}",
            self.policy.receipt_prefix,
            self.clock.today().format("%Y%m%d"),
            &random[..12]
        )
    }

    /// Apply a payment against a fine
    ///
    /// A payment equal to the balance settles the fine (`paid`), a smaller
    /// one leaves it `partial`.
    ///
    /// # Errors
    /// - `InvalidInput` - amount is not positive or receipt number is blank
    /// - `InvalidState` - fine was waived
    /// - `OverpaymentNotAllowed` - amount exceeds the remaining balance
    /// - `DuplicateReceipt` - receipt number already used
    #[tracing::instrument(skip(self, request), fields(amount = request.amount_cents, receipt = %request.receipt_number))]
    pub async fn apply_payment(&self, fine_id: i64, request: &PaymentRequest) -> Result<Payment> {
        if request.amount_cents <= 0 {
            return Err(CirculationError::InvalidInput(
                "payment amount must be positive".to_string(),
            ));
        }
        if request.receipt_number.trim().is_empty() {
            return Err(CirculationError::InvalidInput(
                "receipt number cannot be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let fine = load_fine(&mut tx, fine_id).await?;
        if fine.status == FineStatus::Waived {
            return Err(CirculationError::InvalidState(format!(
                "fine {} was waived",
                fine_id
            )));
        }

        let balance = fine.balance_cents();
        if request.amount_cents > balance {
            tracing::warn!(fine_id, balance, "payment refused: overpayment");
            return Err(CirculationError::OverpaymentNotAllowed {
                fine_id,
                amount_cents: request.amount_cents,
                balance_cents: balance,
            });
        }

        let payment_id = queries::insert_payment(
            &mut tx,
            &PaymentRow {
                fine_id,
                member_id: fine.member_id,
                amount_cents: request.amount_cents,
                payment_method: request.method,
                payment_date: now,
                external_reference: request.external_reference.as_deref(),
                receipt_number: &request.receipt_number,
                staff_user: request.staff_user.as_deref(),
                notes: &request.notes,
            },
        )
        .await?;

        let new_paid = fine.amount_paid_cents + request.amount_cents;
        let status = FineStatus::from_amounts(fine.amount_cents, new_paid);
        if !queries::record_fine_payment(&mut tx, fine_id, fine.amount_paid_cents, new_paid, status)
            .await?
        {
            return Err(lost_race("fine", fine_id));
        }

        outbox.audit(self.audit_record(
            "pay",
            "fine",
            fine_id,
            request.staff_user.as_deref(),
            json!({
                "payment_id": payment_id,
                "receipt_number": request.receipt_number,
                "method": request.method,
                "amount_paid_cents": [fine.amount_paid_cents, new_paid],
                "status": [fine.status, status],
            }),
        ));

        let payment = queries::find_payment(&mut tx, payment_id)
            .await?
            .ok_or_else(|| CirculationError::not_found("payment", payment_id))?;
        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(
            fine_id,
            payment_id,
            amount = %format_cents(request.amount_cents),
            %status,
            "payment applied"
        );

        Ok(payment)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;

    async fn damage_fine(fx: &Fixture, number: &str, amount_cents: i64) -> Fine {
        let member = fx.member(number).await;
        fx.circulation
            .issue_fine(member.id, FineType::Damaged, amount_cents, "Torn pages", None)
            .await
            .expect("Failed to issue fine")
    }

    #[tokio::test]
    async fn test_partial_then_full_payment() {
        let fx = Fixture::new().await;
        let fine = damage_fine(&fx, "P-1", 500).await;

        let first = fx
            .circulation
            .apply_payment(fine.id, &PaymentRequest::new(200, PaymentMethod::Cash, "R-1").staff("desk"))
            .await
            .expect("Failed to apply payment");
        assert_eq!(first.amount_cents, 200);
        assert_eq!(first.member_id, fine.member_id);
        assert_eq!(first.staff_user.as_deref(), Some("desk"));

        let partial = fx.circulation.fine(fine.id).await.expect("fine");
        assert_eq!(partial.status, FineStatus::Partial);
        assert_eq!(partial.balance_cents(), 300);

        fx.circulation
            .apply_payment(fine.id, &PaymentRequest::new(300, PaymentMethod::Card, "R-2").reference("TERM-77"))
            .await
            .expect("Failed to apply payment");

        let paid = fx.circulation.fine(fine.id).await.expect("fine");
        assert_eq!(paid.status, FineStatus::Paid);
        assert_eq!(paid.balance_cents(), 0);
        assert_eq!(paid.amount_paid_cents, 500);

        let err = fx
            .circulation
            .apply_payment(fine.id, &PaymentRequest::new(1, PaymentMethod::Cash, "R-3"))
            .await
            .expect_err("Settled fine cannot take more money");
        assert!(matches!(
            err,
            CirculationError::OverpaymentNotAllowed { balance_cents: 0, .. }
        ));

        let payments = fx.circulation.payments_for_fine(fine.id).await.expect("payments");
        assert_eq!(payments.len(), 2);
        assert_eq!(payments.iter().map(|p| p.amount_cents).sum::<i64>(), paid.amount_cents);
    }

    #[tokio::test]
    async fn test_overpayment_leaves_fine_untouched() {
        let fx = Fixture::new().await;
        let fine = damage_fine(&fx, "P-2", 300).await;

        let err = fx
            .circulation
            .apply_payment(fine.id, &PaymentRequest::new(301, PaymentMethod::Cash, "R-10"))
            .await
            .expect_err("Overpayment must fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::OverpaymentNotAllowed);

        let unchanged = fx.circulation.fine(fine.id).await.expect("fine");
        assert_eq!(unchanged.status, FineStatus::Unpaid);
        assert!(fx.circulation.payments_for_fine(fine.id).await.expect("payments").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_receipt_rolls_back() {
        let fx = Fixture::new().await;
        let first = damage_fine(&fx, "P-3", 400).await;
        let second = damage_fine(&fx, "P-4", 400).await;

        fx.circulation
            .apply_payment(first.id, &PaymentRequest::new(100, PaymentMethod::Cash, "DUP-1"))
            .await
            .expect("Failed to apply payment");

        let err = fx
            .circulation
            .apply_payment(second.id, &PaymentRequest::new(100, PaymentMethod::Cash, "DUP-1"))
            .await
            .expect_err("Receipt numbers are unique");
        assert!(matches!(err, CirculationError::DuplicateReceipt(ref r) if r == "DUP-1"));

        let untouched = fx.circulation.fine(second.id).await.expect("fine");
        assert_eq!(untouched.amount_paid_cents, 0);
        assert_eq!(untouched.status, FineStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_waived_fine_rejects_payment() {
        let fx = Fixture::new().await;
        let fine = damage_fine(&fx, "P-5", 400).await;
        fx.circulation.waive(fine.id, "supervisor").await.expect("waive");

        let err = fx
            .circulation
            .apply_payment(fine.id, &PaymentRequest::new(100, PaymentMethod::Cash, "R-20"))
            .await
            .expect_err("Waived fine cannot be paid");
        assert!(matches!(err, CirculationError::InvalidState(_)));

        let err = fx
            .circulation
            .apply_payment(fine.id, &PaymentRequest::new(0, PaymentMethod::Cash, "R-21"))
            .await
            .expect_err("Zero payment is rejected");
        assert!(matches!(err, CirculationError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_generated_receipt_numbers() {
        let fx = Fixture::new().await;
        let first = fx.circulation.generate_receipt_number();
        let second = fx.circulation.generate_receipt_number();

        assert!(first.starts_with("RCPT-20250601-"));
        assert_eq!(first.len(), "RCPT-20250601-".len() + 12);
        assert_ne!(first, second);
    }
}
