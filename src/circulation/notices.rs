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

//! Overdue and due-soon notices
//!
//! A read-only scan over open loans. Delivery is the sink's business; the
//! scan only decides who should hear about what.

use super::{add_days, Circulation};
use crate::error::Result;
use crate::events::{NotificationEvent, Outbox};
use crate::storage::queries;

impl Circulation {
    /// Emit `overdue` for every late loan and `due_soon` for loans due within
    /// the policy window
    ///
    /// The events are both returned and handed to the sink.
    #[tracing::instrument(skip(self))]
    pub async fn scan_notices(&self) -> Result<Vec<NotificationEvent>> {
        let today = self.clock.today();
        let due_by = add_days(today, self.policy.due_soon_days)?;

        let mut conn = self.db.pool().acquire().await?;
        let loans = queries::list_open_transactions_due_by(&mut conn, due_by).await?;
        drop(conn);

        let mut outbox = Outbox::default();
        let mut events = Vec::with_capacity(loans.len());
        for loan in loans {
            let Some(due_date) = loan.due_date else { continue };
            let event = if loan.is_overdue(today) {
                NotificationEvent::Overdue {
                    member_id: loan.member_id,
                    transaction_id: loan.id,
                    days_overdue: loan.days_overdue(today),
                }
            } else {
                NotificationEvent::DueSoon {
                    member_id: loan.member_id,
                    transaction_id: loan.id,
                    due_date,
                }
            };
            outbox.notify(event.clone());
            events.push(event);
        }

        self.publish(outbox);

        tracing::info!(%today, notices = events.len(), "notice scan finished");

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{date, Fixture};
    use super::*;

    #[tokio::test]
    async fn test_scan_classifies_loans() {
        let fx = Fixture::new().await;
        let member = fx.member("N-1").await;
        let (_, copies) = fx.item_with_copies("Dracula", 3).await;

        // Due 2025-06-15
        let early = fx.circulation.checkout(member.id, copies[0].id, None).await.expect("checkout");
        fx.clock.advance_days(3);
        // Due 2025-06-18
        let later = fx.circulation.checkout(member.id, copies[1].id, None).await.expect("checkout");
        fx.clock.advance_days(10);
        // Due 2025-06-28, outside the window
        fx.circulation.checkout(member.id, copies[2].id, None).await.expect("checkout");

        // 2025-06-17: first loan two days late, second due tomorrow
        fx.clock.advance_days(3);
        fx.sink.take();

        let events = fx.circulation.scan_notices().await.expect("Failed to scan");
        assert_eq!(
            events,
            vec![
                NotificationEvent::Overdue {
                    member_id: member.id,
                    transaction_id: early.id,
                    days_overdue: 2,
                },
                NotificationEvent::DueSoon {
                    member_id: member.id,
                    transaction_id: later.id,
                    due_date: date(2025, 6, 18),
                },
            ]
        );
        assert_eq!(fx.sink.notifications(), events);
    }

    #[tokio::test]
    async fn test_returned_loans_are_skipped() {
        let fx = Fixture::new().await;
        let member = fx.member("N-2").await;
        let (_, copies) = fx.item_with_copies("Carmilla", 1).await;

        let loan = fx.circulation.checkout(member.id, copies[0].id, None).await.expect("checkout");
        fx.clock.advance_days(20);
        fx.circulation.checkin(loan.id, None).await.expect("checkin");

        assert!(fx.circulation.scan_notices().await.expect("scan").is_empty());
    }
}
