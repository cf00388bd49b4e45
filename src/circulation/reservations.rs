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

//! Reservation manager
//!
//! Members queue against an item, not a specific copy. When a copy frees up
//! the oldest pending reservation (reservation_date, then id) is promoted to
//! `available` and the copy is set aside on the hold shelf until the member
//! collects it or the hold lapses.

use super::{add_days, load_copy, load_profile, load_reservation, lost_race, Circulation};
use crate::error::{CirculationError, Result};
use crate::events::{NotificationEvent, Outbox};
use crate::storage::models::*;
use crate::storage::queries;
use chrono::NaiveDate;
use serde_json::json;
use sqlx::SqliteConnection;

impl Circulation {
    /// Queue a member for an item
    ///
    /// # Errors
    /// - `MemberInvalid` - membership inactive or expired
    /// - `AlreadyReserved` - member already has a pending or ready reservation
    #[tracing::instrument(skip(self))]
    pub async fn reserve(&self, member_id: i64, item_id: i64, actor: Option<&str>) -> Result<Reservation> {
        let now = self.clock.now();
        let today = self.clock.today();
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let profile = load_profile(&mut tx, member_id).await?;
        if !profile.can_borrow(today) {
            return Err(CirculationError::MemberInvalid {
                member_id: profile.member.member_id,
            });
        }

        if queries::find_item(&mut tx, item_id).await?.is_none() {
            return Err(CirculationError::not_found("item", item_id));
        }

        if let Some(existing) = queries::find_active_reservation(&mut tx, member_id, item_id).await? {
            return Err(CirculationError::AlreadyReserved {
                reservation_id: existing.id,
                item_id,
            });
        }

        let reservation_id = queries::insert_reservation(&mut tx, member_id, item_id, now).await?;
        outbox.audit(self.audit_record(
            "reserve",
            "reservation",
            reservation_id,
            actor,
            json!({ "member_id": member_id, "item_id": item_id, "status": ReservationStatus::Pending }),
        ));

        let reservation = load_reservation(&mut tx, reservation_id).await?;
        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(reservation_id, member = %profile.member.member_id, item_id, "reservation queued");

        Ok(reservation)
    }

    /// Offer a freed copy of an item to the reservation queue
    ///
    /// Picks the first copy of the item that is on the open shelf and, if
    /// anyone is waiting, promotes the oldest pending reservation and moves
    /// the copy to the hold shelf. Returns the promoted reservation.
    #[tracing::instrument(skip(self))]
    pub async fn on_copy_returned(&self, item_id: i64) -> Result<Option<Reservation>> {
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let Some(copy) = queries::find_available_copy(&mut tx, item_id).await? else {
            return Ok(None);
        };

        let promoted = self.release_copy(&mut tx, &copy, None, &mut outbox).await?;
        tx.commit().await?;
        self.publish(outbox);

        Ok(promoted)
    }

    /// Expire holds that were not collected in time
    ///
    /// Each lapsed hold becomes `expired` and its copy is offered to the next
    /// member in line (or returned to the shelf). Returns how many expired.
    #[tracing::instrument(skip(self))]
    pub async fn expire_stale(&self) -> Result<usize> {
        let today = self.clock.today();
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let lapsed = queries::list_lapsed_holds(&mut tx, today).await?;
        let mut expired = 0;

        for hold in lapsed {
            if !queries::transition_reservation(
                &mut tx,
                hold.id,
                ReservationStatus::Available,
                ReservationStatus::Expired,
            )
            .await?
            {
                continue;
            }
            expired += 1;

            outbox.audit(self.audit_record(
                "expire",
                "reservation",
                hold.id,
                None,
                json!({
                    "status": [ReservationStatus::Available, ReservationStatus::Expired],
                    "expiry_date": hold.expiry_date,
                }),
            ));

            if let Some(copy_id) = hold.held_copy_id {
                let copy = load_copy(&mut tx, copy_id).await?;
                if copy.status == CopyStatus::Reserved {
                    self.release_copy(&mut tx, &copy, None, &mut outbox).await?;
                }
            }
        }

        tx.commit().await?;
        self.publish(outbox);

        if expired > 0 {
            tracing::info!(expired, "expired lapsed holds");
        }

        Ok(expired)
    }

    /// Cancel a reservation
    ///
    /// Cancelling a reservation that is already cancelled, fulfilled or
    /// expired returns it unchanged. Cancelling a ready hold releases its
    /// copy to the next member in line.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, reservation_id: i64, actor: Option<&str>) -> Result<Reservation> {
        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let reservation = load_reservation(&mut tx, reservation_id).await?;
        if !reservation.status.is_active() {
            return Ok(reservation);
        }

        if !queries::transition_reservation(
            &mut tx,
            reservation_id,
            reservation.status,
            ReservationStatus::Cancelled,
        )
        .await?
        {
            return Err(lost_race("reservation", reservation_id));
        }

        outbox.audit(self.audit_record(
            "cancel",
            "reservation",
            reservation_id,
            actor,
            json!({ "status": [reservation.status, ReservationStatus::Cancelled] }),
        ));

        if reservation.status == ReservationStatus::Available {
            if let Some(copy_id) = reservation.held_copy_id {
                let copy = load_copy(&mut tx, copy_id).await?;
                if copy.status == CopyStatus::Reserved {
                    self.release_copy(&mut tx, &copy, actor, &mut outbox).await?;
                }
            }
        }

        let cancelled = load_reservation(&mut tx, reservation_id).await?;
        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(reservation_id, "reservation cancelled");

        Ok(cancelled)
    }

    /// Record that the member was told their hold is ready
    pub async fn mark_reservation_notified(&self, reservation_id: i64) -> Result<Reservation> {
        let mut tx = self.db.begin().await?;
        let reservation = load_reservation(&mut tx, reservation_id).await?;
        if reservation.status != ReservationStatus::Available {
            return Err(CirculationError::InvalidState(format!(
                "reservation {} is {}, not on the hold shelf",
                reservation_id, reservation.status
            )));
        }
        queries::mark_reservation_notified(&mut tx, reservation_id).await?;
        let updated = load_reservation(&mut tx, reservation_id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Staff status change that respects the reservation queue
    ///
    /// Moving a copy back to `available` (from repair, or found after being
    /// lost) offers it to the oldest pending reservation first, so it may
    /// end up on the hold shelf instead of the open shelf.
    ///
    /// # Errors
    /// - `InvalidState` - copy is on loan or held, or the target is a lending state
    #[tracing::instrument(skip(self))]
    pub async fn set_copy_status(
        &self,
        copy_id: i64,
        status: CopyStatus,
        actor: Option<&str>,
    ) -> Result<ItemCopy> {
        if matches!(status, CopyStatus::CheckedOut | CopyStatus::Reserved) {
            return Err(CirculationError::InvalidState(format!(
                "copy status '{}' is set by circulation only",
                status
            )));
        }

        let mut tx = self.db.begin().await?;
        let mut outbox = Outbox::default();

        let copy = load_copy(&mut tx, copy_id).await?;
        if matches!(copy.status, CopyStatus::CheckedOut | CopyStatus::Reserved) {
            return Err(CirculationError::InvalidState(format!(
                "copy {} is {}; check it in or release the hold first",
                copy.barcode, copy.status
            )));
        }

        let promoted = if status == CopyStatus::Available {
            self.release_copy(&mut tx, &copy, actor, &mut outbox).await?
        } else {
            if !queries::transition_copy_status(&mut tx, copy.id, copy.status, status).await? {
                return Err(lost_race("copy", copy.id));
            }
            None
        };

        let updated = load_copy(&mut tx, copy_id).await?;
        outbox.audit(self.audit_record(
            "set_status",
            "copy",
            copy_id,
            actor,
            json!({
                "status": [copy.status, updated.status],
                "promoted_reservation": promoted.as_ref().map(|r| r.id),
            }),
        ));

        tx.commit().await?;
        self.publish(outbox);

        tracing::info!(copy = %copy.barcode, from = %copy.status, to = %updated.status, "copy status changed");

        Ok(updated)
    }

    // ========================================================================
    // UNIT-OF-WORK HELPERS
    // ========================================================================

    /// Hand a copy to the reservation queue or put it back on the shelf
    ///
    /// `copy.status` is the status read earlier in the same unit of work.
    pub(super) async fn release_copy(
        &self,
        conn: &mut SqliteConnection,
        copy: &ItemCopy,
        actor: Option<&str>,
        outbox: &mut Outbox,
    ) -> Result<Option<Reservation>> {
        let today = self.clock.today();
        let promoted = self
            .promote_next(conn, copy.item_id, copy.id, today, actor, outbox)
            .await?;

        let target = if promoted.is_some() {
            CopyStatus::Reserved
        } else {
            CopyStatus::Available
        };
        if !queries::transition_copy_status(conn, copy.id, copy.status, target).await? {
            return Err(lost_race("copy", copy.id));
        }

        Ok(promoted)
    }

    /// Promote the head of an item's queue onto the hold shelf
    async fn promote_next(
        &self,
        conn: &mut SqliteConnection,
        item_id: i64,
        copy_id: i64,
        today: NaiveDate,
        actor: Option<&str>,
        outbox: &mut Outbox,
    ) -> Result<Option<Reservation>> {
        let Some(next) = queries::next_pending_reservation(conn, item_id).await? else {
            return Ok(None);
        };

        let expiry_date = add_days(today, self.policy.hold_period_days)?;
        if !queries::promote_reservation(conn, next.id, copy_id, today, expiry_date).await? {
            return Err(lost_race("reservation", next.id));
        }

        outbox.notify(NotificationEvent::ReservedAvailable {
            member_id: next.member_id,
            reservation_id: next.id,
            expiry_date,
        });
        outbox.audit(self.audit_record(
            "promote",
            "reservation",
            next.id,
            actor,
            json!({
                "status": [ReservationStatus::Pending, ReservationStatus::Available],
                "held_copy_id": copy_id,
                "expiry_date": expiry_date,
            }),
        ));

        tracing::debug!(reservation_id = next.id, item_id, copy_id, %expiry_date, "reservation promoted");

        Ok(Some(load_reservation(conn, next.id).await?))
    }

    /// Close a reservation because its member took a copy
    pub(super) async fn fulfil_reservation(
        &self,
        conn: &mut SqliteConnection,
        reservation: &Reservation,
        today: NaiveDate,
        actor: Option<&str>,
        outbox: &mut Outbox,
    ) -> Result<()> {
        if !queries::fulfil_reservation(conn, reservation.id, reservation.status, today).await? {
            return Err(lost_race("reservation", reservation.id));
        }

        outbox.audit(self.audit_record(
            "fulfil",
            "reservation",
            reservation.id,
            actor,
            json!({ "status": [reservation.status, ReservationStatus::Fulfilled] }),
        ));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{date, Fixture};
    use super::*;

    #[tokio::test]
    async fn test_reserve_rejects_duplicate() {
        let fx = Fixture::new().await;
        let member = fx.member("R-1").await;
        let (item, _) = fx.item_with_copies("Dune", 1).await;

        let reservation = fx
            .circulation
            .reserve(member.id, item.id, None)
            .await
            .expect("Failed to reserve");
        assert_eq!(reservation.status, ReservationStatus::Pending);

        let err = fx
            .circulation
            .reserve(member.id, item.id, None)
            .await
            .expect_err("Second reservation should fail");
        assert!(matches!(
            err,
            CirculationError::AlreadyReserved { reservation_id, .. } if reservation_id == reservation.id
        ));
    }

    #[tokio::test]
    async fn test_promotion_is_fifo_with_id_tiebreak() {
        let fx = Fixture::new().await;
        let borrower = fx.member("B-1").await;
        let first = fx.member("Q-1").await;
        let second = fx.member("Q-2").await;
        let (item, copies) = fx.item_with_copies("Neuromancer", 1).await;

        let loan = fx
            .circulation
            .checkout(borrower.id, copies[0].id, None)
            .await
            .expect("Failed to checkout");

        // Same clock instant for both: id decides
        let r1 = fx.circulation.reserve(first.id, item.id, None).await.expect("reserve r1");
        let r2 = fx.circulation.reserve(second.id, item.id, None).await.expect("reserve r2");
        assert_eq!(r1.reservation_date, r2.reservation_date);

        let queue = fx.circulation.pending_reservations(item.id).await.expect("queue");
        assert_eq!(queue.iter().map(|r| r.id).collect::<Vec<_>>(), vec![r1.id, r2.id]);

        fx.circulation.checkin(loan.id, None).await.expect("Failed to checkin");

        let promoted = fx.circulation.reservation(r1.id).await.expect("load r1");
        assert_eq!(promoted.status, ReservationStatus::Available);
        assert_eq!(promoted.held_copy_id, Some(copies[0].id));
        assert_eq!(promoted.available_date, Some(date(2025, 6, 1)));
        assert_eq!(promoted.expiry_date, Some(date(2025, 6, 4)));
        assert_eq!(fx.copy_status(copies[0].id).await, CopyStatus::Reserved);

        let still_waiting = fx.circulation.reservation(r2.id).await.expect("load r2");
        assert_eq!(still_waiting.status, ReservationStatus::Pending);

        assert!(fx.sink.notifications().contains(&NotificationEvent::ReservedAvailable {
            member_id: first.id,
            reservation_id: r1.id,
            expiry_date: date(2025, 6, 4),
        }));
    }

    #[tokio::test]
    async fn test_on_copy_returned_uses_shelf_copy() {
        let fx = Fixture::new().await;
        let member = fx.member("S-1").await;
        let (item, copies) = fx.item_with_copies("Snow Crash", 1).await;

        // Nobody waiting: nothing promoted, copy stays on the shelf
        assert!(fx.circulation.on_copy_returned(item.id).await.expect("promote").is_none());
        assert_eq!(fx.copy_status(copies[0].id).await, CopyStatus::Available);

        let reservation = fx.circulation.reserve(member.id, item.id, None).await.expect("reserve");
        let promoted = fx
            .circulation
            .on_copy_returned(item.id)
            .await
            .expect("promote")
            .expect("reservation should be promoted");
        assert_eq!(promoted.id, reservation.id);
        assert_eq!(fx.copy_status(copies[0].id).await, CopyStatus::Reserved);

        // No copy left on the shelf
        assert!(fx.circulation.on_copy_returned(item.id).await.expect("promote").is_none());
    }

    #[tokio::test]
    async fn test_expire_stale_cascades_to_next_member() {
        let fx = Fixture::new().await;
        let first = fx.member("E-1").await;
        let second = fx.member("E-2").await;
        let (item, copies) = fx.item_with_copies("Foundation", 1).await;

        let r1 = fx.circulation.reserve(first.id, item.id, None).await.expect("reserve r1");
        let r2 = fx.circulation.reserve(second.id, item.id, None).await.expect("reserve r2");
        fx.circulation.on_copy_returned(item.id).await.expect("promote");

        // Hold runs through 2025-06-04; nothing lapses on the last day
        fx.clock.advance_days(3);
        assert_eq!(fx.circulation.expire_stale().await.expect("expire"), 0);

        fx.clock.advance_days(1);
        assert_eq!(fx.circulation.expire_stale().await.expect("expire"), 1);

        let expired = fx.circulation.reservation(r1.id).await.expect("load r1");
        assert_eq!(expired.status, ReservationStatus::Expired);

        let next = fx.circulation.reservation(r2.id).await.expect("load r2");
        assert_eq!(next.status, ReservationStatus::Available);
        assert_eq!(next.held_copy_id, Some(copies[0].id));
        assert_eq!(next.expiry_date, Some(date(2025, 6, 8)));
        assert_eq!(fx.copy_status(copies[0].id).await, CopyStatus::Reserved);
    }

    #[tokio::test]
    async fn test_expire_stale_returns_copy_to_shelf_when_queue_empty() {
        let fx = Fixture::new().await;
        let member = fx.member("E-3").await;
        let (item, copies) = fx.item_with_copies("Hyperion", 1).await;

        fx.circulation.reserve(member.id, item.id, None).await.expect("reserve");
        fx.circulation.on_copy_returned(item.id).await.expect("promote");

        fx.clock.advance_days(10);
        assert_eq!(fx.circulation.expire_stale().await.expect("expire"), 1);
        assert_eq!(fx.copy_status(copies[0].id).await, CopyStatus::Available);
    }

    #[tokio::test]
    async fn test_cancel_transitions() {
        let fx = Fixture::new().await;
        let first = fx.member("C-1").await;
        let second = fx.member("C-2").await;
        let (item, copies) = fx.item_with_copies("Ubik", 1).await;

        let r1 = fx.circulation.reserve(first.id, item.id, None).await.expect("reserve r1");
        let r2 = fx.circulation.reserve(second.id, item.id, None).await.expect("reserve r2");
        fx.circulation.on_copy_returned(item.id).await.expect("promote");

        // Cancelling the ready hold passes the copy on
        let cancelled = fx.circulation.cancel(r1.id, Some("desk")).await.expect("cancel r1");
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);
        let next = fx.circulation.reservation(r2.id).await.expect("load r2");
        assert_eq!(next.status, ReservationStatus::Available);
        assert_eq!(next.held_copy_id, Some(copies[0].id));

        // Idempotent on an already cancelled reservation
        let again = fx.circulation.cancel(r1.id, None).await.expect("cancel again");
        assert_eq!(again.status, ReservationStatus::Cancelled);

        // Cancelling a fulfilled reservation leaves it fulfilled
        let loan = fx
            .circulation
            .checkout(second.id, copies[0].id, None)
            .await
            .expect("holder should collect the copy");
        let fulfilled = fx.circulation.cancel(r2.id, None).await.expect("cancel fulfilled");
        assert_eq!(fulfilled.status, ReservationStatus::Fulfilled);
        assert_eq!(fx.copy_status(copies[0].id).await, CopyStatus::CheckedOut);
        assert_eq!(
            fx.circulation.open_loan_for_copy(copies[0].id).await.expect("loan").map(|l| l.id),
            Some(loan.id)
        );
    }

    #[tokio::test]
    async fn test_cancel_expired_is_unchanged() {
        let fx = Fixture::new().await;
        let member = fx.member("C-3").await;
        let (item, copies) = fx.item_with_copies("Dune", 1).await;

        let reservation = fx.circulation.reserve(member.id, item.id, None).await.expect("reserve");
        fx.circulation.on_copy_returned(item.id).await.expect("promote");
        fx.clock.advance_days(4);
        assert_eq!(fx.circulation.expire_stale().await.expect("expire"), 1);

        let audits_before = fx.sink.audits().len();
        let unchanged = fx.circulation.cancel(reservation.id, None).await.expect("cancel expired");
        assert_eq!(unchanged.status, ReservationStatus::Expired);
        assert_eq!(fx.sink.audits().len(), audits_before);
        assert_eq!(fx.copy_status(copies[0].id).await, CopyStatus::Available);
    }

    #[tokio::test]
    async fn test_repaired_copy_goes_to_waiting_member() {
        let fx = Fixture::new().await;
        let member = fx.member("S-1").await;
        let (item, copies) = fx.item_with_copies("Kindred", 2).await;

        fx.circulation
            .set_copy_status(copies[0].id, CopyStatus::InRepair, Some("bindery"))
            .await
            .expect("send to repair");
        let reservation = fx.circulation.reserve(member.id, item.id, None).await.expect("reserve");

        let repaired = fx
            .circulation
            .set_copy_status(copies[0].id, CopyStatus::Available, Some("bindery"))
            .await
            .expect("back from repair");
        assert_eq!(repaired.status, CopyStatus::Reserved);

        let held = fx.circulation.reservation(reservation.id).await.expect("reservation");
        assert_eq!(held.status, ReservationStatus::Available);
        assert_eq!(held.held_copy_id, Some(copies[0].id));
        assert!(fx
            .sink
            .notifications()
            .iter()
            .any(|n| matches!(n, NotificationEvent::ReservedAvailable { reservation_id, .. } if *reservation_id == reservation.id)));

        // Nobody else waiting: the other copy goes straight to the shelf
        fx.circulation
            .set_copy_status(copies[1].id, CopyStatus::Damaged, None)
            .await
            .expect("mark damaged");
        let shelved = fx
            .circulation
            .set_copy_status(copies[1].id, CopyStatus::Available, None)
            .await
            .expect("back to shelf");
        assert_eq!(shelved.status, CopyStatus::Available);

        let err = fx
            .circulation
            .set_copy_status(copies[0].id, CopyStatus::Withdrawn, None)
            .await
            .expect_err("Held copy cannot be withdrawn");
        assert!(matches!(err, CirculationError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_mark_notified_requires_hold() {
        let fx = Fixture::new().await;
        let member = fx.member("N-1").await;
        let (item, _) = fx.item_with_copies("Solaris", 1).await;

        let reservation = fx.circulation.reserve(member.id, item.id, None).await.expect("reserve");
        let err = fx
            .circulation
            .mark_reservation_notified(reservation.id)
            .await
            .expect_err("Pending reservation has nothing to notify");
        assert!(matches!(err, CirculationError::InvalidState(_)));

        fx.circulation.on_copy_returned(item.id).await.expect("promote");
        let notified = fx
            .circulation
            .mark_reservation_notified(reservation.id)
            .await
            .expect("Failed to mark notified");
        assert!(notified.notified);
    }
}
