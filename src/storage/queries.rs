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

//! Database query functions
//!
//! Repository-style functions per table. Every function takes a
//! `&mut SqliteConnection` so callers can compose several of them inside one
//! `sqlx::Transaction` (pass `&mut *tx`) or run them on a pooled connection.
//!
//! # Query Patterns
//! - Status changes that race with other writers are compare-and-set
//!   (`WHERE status = ?`) and report whether they won
//! - Counts and sums are computed in SQL, never cached

use crate::error::{CirculationError, Result};
use crate::storage::models::*;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqliteConnection;

// ============================================================================
// MEMBERSHIP TYPE QUERIES
// ============================================================================

/// Insert a membership type, returning its id
pub async fn insert_membership_type(
    conn: &mut SqliteConnection,
    membership: &NewMembershipType,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO membership_types (
            code, name, kind, max_books, loan_period_days, max_renewals,
            annual_fee_cents, fine_per_day_cents
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&membership.code)
    .bind(&membership.name)
    .bind(membership.kind)
    .bind(membership.max_books)
    .bind(membership.loan_period_days)
    .bind(membership.max_renewals)
    .bind(membership.annual_fee_cents)
    .bind(membership.fine_per_day_cents)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_membership_type(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<MembershipType>> {
    let membership = sqlx::query_as::<_, MembershipType>("SELECT * FROM membership_types WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(membership)
}

// ============================================================================
// MEMBER QUERIES
// ============================================================================

/// Insert a member, returning its row id
pub async fn insert_member(conn: &mut SqliteConnection, member: &NewMember) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO members (
            member_id, first_name, last_name, email, phone, barcode,
            membership_type_id, registration_date, expiry_date
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&member.member_id)
    .bind(&member.first_name)
    .bind(&member.last_name)
    .bind(&member.email)
    .bind(&member.phone)
    .bind(&member.barcode)
    .bind(member.membership_type_id)
    .bind(member.registration_date)
    .bind(member.expiry_date)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_member(conn: &mut SqliteConnection, id: i64) -> Result<Option<Member>> {
    let member = sqlx::query_as::<_, Member>("SELECT * FROM members WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(member)
}

/// Find member by the number printed on their card
pub async fn find_member_by_number(
    conn: &mut SqliteConnection,
    member_id: &str,
) -> Result<Option<Member>> {
    let member = sqlx::query_as::<_, Member>("SELECT * FROM members WHERE member_id = ?")
        .bind(member_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(member)
}

/// Load a member together with their membership limits
pub async fn find_member_profile(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<MemberProfile>> {
    let Some(member) = find_member(conn, id).await? else {
        return Ok(None);
    };
    let membership = find_membership_type(conn, member.membership_type_id)
        .await?
        .ok_or_else(|| CirculationError::not_found("membership type", member.membership_type_id))?;

    Ok(Some(MemberProfile { member, membership }))
}

pub async fn set_member_active(conn: &mut SqliteConnection, id: i64, is_active: bool) -> Result<()> {
    sqlx::query("UPDATE members SET is_active = ? WHERE id = ?")
        .bind(is_active)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn set_membership_type_active(
    conn: &mut SqliteConnection,
    id: i64,
    is_active: bool,
) -> Result<()> {
    sqlx::query("UPDATE membership_types SET is_active = ? WHERE id = ?")
        .bind(is_active)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

// ============================================================================
// CATALOG QUERIES
// ============================================================================

pub async fn insert_item(
    conn: &mut SqliteConnection,
    item: &NewItem,
    created_at: DateTime<Utc>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO items (title, subtitle, item_type, isbn, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&item.title)
    .bind(&item.subtitle)
    .bind(item.item_type)
    .bind(&item.isbn)
    .bind(created_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_item(conn: &mut SqliteConnection, id: i64) -> Result<Option<Item>> {
    let item = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(item)
}

pub async fn insert_copy(conn: &mut SqliteConnection, copy: &NewCopy) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO copies (item_id, barcode, location, price_cents) VALUES (?, ?, ?, ?)",
    )
    .bind(copy.item_id)
    .bind(&copy.barcode)
    .bind(&copy.location)
    .bind(copy.price_cents)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_copy(conn: &mut SqliteConnection, id: i64) -> Result<Option<ItemCopy>> {
    let copy = sqlx::query_as::<_, ItemCopy>("SELECT * FROM copies WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(copy)
}

pub async fn find_copy_by_barcode(
    conn: &mut SqliteConnection,
    barcode: &str,
) -> Result<Option<ItemCopy>> {
    let copy = sqlx::query_as::<_, ItemCopy>("SELECT * FROM copies WHERE barcode = ?")
        .bind(barcode)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(copy)
}

/// List all copies of an item, oldest first
pub async fn list_item_copies(conn: &mut SqliteConnection, item_id: i64) -> Result<Vec<ItemCopy>> {
    let copies = sqlx::query_as::<_, ItemCopy>("SELECT * FROM copies WHERE item_id = ? ORDER BY id")
        .bind(item_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(copies)
}

/// First copy of an item that is on the shelf
pub async fn find_available_copy(
    conn: &mut SqliteConnection,
    item_id: i64,
) -> Result<Option<ItemCopy>> {
    let copy = sqlx::query_as::<_, ItemCopy>(
        "SELECT * FROM copies WHERE item_id = ? AND status = 'available' ORDER BY id LIMIT 1",
    )
    .bind(item_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(copy)
}

pub async fn count_available_copies(conn: &mut SqliteConnection, item_id: i64) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM copies WHERE item_id = ? AND status = 'available'")
            .bind(item_id)
            .fetch_one(&mut *conn)
            .await?;

    Ok(count)
}

/// Unconditionally set a copy's status (staff override)
pub async fn set_copy_status(conn: &mut SqliteConnection, id: i64, status: CopyStatus) -> Result<bool> {
    let result = sqlx::query("UPDATE copies SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Move a copy from `from` to `to`
///
/// Returns false when another writer changed the status first.
pub async fn transition_copy_status(
    conn: &mut SqliteConnection,
    id: i64,
    from: CopyStatus,
    to: CopyStatus,
) -> Result<bool> {
    let result = sqlx::query("UPDATE copies SET status = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

// ============================================================================
// TRANSACTION QUERIES
// ============================================================================

/// Open a checkout transaction, returning its id
pub async fn insert_checkout(
    conn: &mut SqliteConnection,
    member_id: i64,
    copy_id: i64,
    transaction_date: DateTime<Utc>,
    due_date: NaiveDate,
    staff_user: Option<&str>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO transactions (
            member_id, copy_id, transaction_type, transaction_date, due_date, staff_user
        ) VALUES (?, ?, 'checkout', ?, ?, ?)
        "#,
    )
    .bind(member_id)
    .bind(copy_id)
    .bind(transaction_date)
    .bind(due_date)
    .bind(staff_user)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_transaction(conn: &mut SqliteConnection, id: i64) -> Result<Option<Transaction>> {
    let transaction = sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(transaction)
}

pub async fn find_open_transaction_for_copy(
    conn: &mut SqliteConnection,
    copy_id: i64,
) -> Result<Option<Transaction>> {
    let transaction = sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions WHERE copy_id = ? AND return_date IS NULL",
    )
    .bind(copy_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(transaction)
}

pub async fn count_open_transactions(conn: &mut SqliteConnection, member_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transactions WHERE member_id = ? AND return_date IS NULL",
    )
    .bind(member_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

pub async fn list_open_transactions_for_member(
    conn: &mut SqliteConnection,
    member_id: i64,
) -> Result<Vec<Transaction>> {
    let transactions = sqlx::query_as::<_, Transaction>(
        r#"
        SELECT * FROM transactions
        WHERE member_id = ? AND return_date IS NULL
        ORDER BY due_date, id
        "#,
    )
    .bind(member_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(transactions)
}

/// Open loans due on or before `due_by`
pub async fn list_open_transactions_due_by(
    conn: &mut SqliteConnection,
    due_by: NaiveDate,
) -> Result<Vec<Transaction>> {
    let transactions = sqlx::query_as::<_, Transaction>(
        r#"
        SELECT * FROM transactions
        WHERE return_date IS NULL AND due_date IS NOT NULL AND due_date <= ?
        ORDER BY due_date, id
        "#,
    )
    .bind(due_by)
    .fetch_all(&mut *conn)
    .await?;

    Ok(transactions)
}

/// Full loan history of a copy, newest first
pub async fn list_copy_history(conn: &mut SqliteConnection, copy_id: i64) -> Result<Vec<Transaction>> {
    let transactions = sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions WHERE copy_id = ? ORDER BY transaction_date DESC, id DESC",
    )
    .bind(copy_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(transactions)
}

/// Record a renewal on an open transaction
///
/// Guarded on the previous renewal count; returns false if another renewal
/// or a checkin got there first.
pub async fn record_renewal(
    conn: &mut SqliteConnection,
    id: i64,
    expected_renewed_count: i64,
    new_due_date: NaiveDate,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET due_date = ?, renewed_count = renewed_count + 1
        WHERE id = ? AND renewed_count = ? AND return_date IS NULL
        "#,
    )
    .bind(new_due_date)
    .bind(id)
    .bind(expected_renewed_count)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Close an open transaction
///
/// Returns false if it was already closed.
pub async fn close_transaction(
    conn: &mut SqliteConnection,
    id: i64,
    return_date: NaiveDate,
    note: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET return_date = ?,
            notes = CASE WHEN ? IS NULL THEN notes
                         WHEN notes = '' THEN ?
                         ELSE notes || char(10) || ? END
        WHERE id = ? AND return_date IS NULL
        "#,
    )
    .bind(return_date)
    .bind(note)
    .bind(note)
    .bind(note)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

// ============================================================================
// RESERVATION QUERIES
// ============================================================================

pub async fn insert_reservation(
    conn: &mut SqliteConnection,
    member_id: i64,
    item_id: i64,
    reservation_date: DateTime<Utc>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO reservations (member_id, item_id, reservation_date) VALUES (?, ?, ?)",
    )
    .bind(member_id)
    .bind(item_id)
    .bind(reservation_date)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_reservation(conn: &mut SqliteConnection, id: i64) -> Result<Option<Reservation>> {
    let reservation = sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(reservation)
}

/// Member's pending or ready reservation for an item, if any
pub async fn find_active_reservation(
    conn: &mut SqliteConnection,
    member_id: i64,
    item_id: i64,
) -> Result<Option<Reservation>> {
    let reservation = sqlx::query_as::<_, Reservation>(
        r#"
        SELECT * FROM reservations
        WHERE member_id = ? AND item_id = ? AND status IN ('pending', 'available')
        ORDER BY id LIMIT 1
        "#,
    )
    .bind(member_id)
    .bind(item_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(reservation)
}

/// Ready reservation holding a specific copy
pub async fn find_hold_for_copy(
    conn: &mut SqliteConnection,
    copy_id: i64,
) -> Result<Option<Reservation>> {
    let reservation = sqlx::query_as::<_, Reservation>(
        "SELECT * FROM reservations WHERE held_copy_id = ? AND status = 'available' LIMIT 1",
    )
    .bind(copy_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(reservation)
}

/// Head of the FIFO queue for an item
pub async fn next_pending_reservation(
    conn: &mut SqliteConnection,
    item_id: i64,
) -> Result<Option<Reservation>> {
    let reservation = sqlx::query_as::<_, Reservation>(
        r#"
        SELECT * FROM reservations
        WHERE item_id = ? AND status = 'pending'
        ORDER BY reservation_date ASC, id ASC
        LIMIT 1
        "#,
    )
    .bind(item_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(reservation)
}

/// Pending queue for an item in promotion order
pub async fn list_pending_reservations(
    conn: &mut SqliteConnection,
    item_id: i64,
) -> Result<Vec<Reservation>> {
    let reservations = sqlx::query_as::<_, Reservation>(
        r#"
        SELECT * FROM reservations
        WHERE item_id = ? AND status = 'pending'
        ORDER BY reservation_date ASC, id ASC
        "#,
    )
    .bind(item_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(reservations)
}

/// Number of other members waiting for an item
pub async fn count_pending_reservations_excluding(
    conn: &mut SqliteConnection,
    item_id: i64,
    member_id: i64,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM reservations WHERE item_id = ? AND status = 'pending' AND member_id != ?",
    )
    .bind(item_id)
    .bind(member_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

/// Ready reservations whose hold period ended before `today`
pub async fn list_lapsed_holds(conn: &mut SqliteConnection, today: NaiveDate) -> Result<Vec<Reservation>> {
    let reservations = sqlx::query_as::<_, Reservation>(
        r#"
        SELECT * FROM reservations
        WHERE status = 'available' AND expiry_date IS NOT NULL AND expiry_date < ?
        ORDER BY expiry_date, id
        "#,
    )
    .bind(today)
    .fetch_all(&mut *conn)
    .await?;

    Ok(reservations)
}

/// Move a pending reservation to the hold shelf
pub async fn promote_reservation(
    conn: &mut SqliteConnection,
    id: i64,
    copy_id: i64,
    available_date: NaiveDate,
    expiry_date: NaiveDate,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE reservations
        SET status = 'available', held_copy_id = ?, available_date = ?, expiry_date = ?,
            notified = 0
        WHERE id = ? AND status = 'pending'
        "#,
    )
    .bind(copy_id)
    .bind(available_date)
    .bind(expiry_date)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Compare-and-set a reservation's status
pub async fn transition_reservation(
    conn: &mut SqliteConnection,
    id: i64,
    from: ReservationStatus,
    to: ReservationStatus,
) -> Result<bool> {
    let result = sqlx::query("UPDATE reservations SET status = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark a reservation fulfilled by a checkout
pub async fn fulfil_reservation(
    conn: &mut SqliteConnection,
    id: i64,
    from: ReservationStatus,
    fulfilled_date: NaiveDate,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE reservations SET status = 'fulfilled', fulfilled_date = ? WHERE id = ? AND status = ?",
    )
    .bind(fulfilled_date)
    .bind(id)
    .bind(from)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn mark_reservation_notified(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE reservations SET notified = 1 WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

// ============================================================================
// FINE QUERIES
// ============================================================================

pub async fn insert_fine(
    conn: &mut SqliteConnection,
    fine: &NewFine,
    created_at: DateTime<Utc>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO fines (
            member_id, transaction_id, fine_type, amount_cents, issue_date,
            description, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(fine.member_id)
    .bind(fine.transaction_id)
    .bind(fine.fine_type)
    .bind(fine.amount_cents)
    .bind(fine.issue_date)
    .bind(&fine.description)
    .bind(created_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_fine(conn: &mut SqliteConnection, id: i64) -> Result<Option<Fine>> {
    let fine = sqlx::query_as::<_, Fine>("SELECT * FROM fines WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(fine)
}

/// Overdue fine already attached to a transaction (at most one exists)
pub async fn find_overdue_fine_for_transaction(
    conn: &mut SqliteConnection,
    transaction_id: i64,
) -> Result<Option<Fine>> {
    let fine = sqlx::query_as::<_, Fine>(
        "SELECT * FROM fines WHERE transaction_id = ? AND fine_type = 'overdue' ORDER BY id LIMIT 1",
    )
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(fine)
}

pub async fn list_fines_for_transaction(
    conn: &mut SqliteConnection,
    transaction_id: i64,
) -> Result<Vec<Fine>> {
    let fines = sqlx::query_as::<_, Fine>("SELECT * FROM fines WHERE transaction_id = ? ORDER BY id")
        .bind(transaction_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(fines)
}

pub async fn list_member_fines(conn: &mut SqliteConnection, member_id: i64) -> Result<Vec<Fine>> {
    let fines = sqlx::query_as::<_, Fine>("SELECT * FROM fines WHERE member_id = ? ORDER BY issue_date, id")
        .bind(member_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(fines)
}

/// Sum of unpaid balances across a member's fines
pub async fn outstanding_balance(conn: &mut SqliteConnection, member_id: i64) -> Result<i64> {
    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(amount_cents - amount_paid_cents), 0) FROM fines
        WHERE member_id = ? AND status IN ('unpaid', 'partial')
        "#,
    )
    .bind(member_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(total)
}

/// Re-assess a fine's amount (reopens a paid fine, never touches a waived one)
pub async fn update_fine_amount(
    conn: &mut SqliteConnection,
    id: i64,
    amount_cents: i64,
    status: FineStatus,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE fines SET amount_cents = ?, status = ? WHERE id = ? AND status <> 'waived' AND amount_paid_cents <= ?",
    )
    .bind(amount_cents)
    .bind(status)
    .bind(id)
    .bind(amount_cents)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Record money received against a fine
///
/// Guarded on the previously read paid amount so two concurrent payments
/// cannot both apply against the same balance.
pub async fn record_fine_payment(
    conn: &mut SqliteConnection,
    id: i64,
    expected_paid_cents: i64,
    new_paid_cents: i64,
    status: FineStatus,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE fines SET amount_paid_cents = ?, status = ? WHERE id = ? AND amount_paid_cents = ?",
    )
    .bind(new_paid_cents)
    .bind(status)
    .bind(id)
    .bind(expected_paid_cents)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Waive an unsettled fine, appending a note
pub async fn waive_fine(conn: &mut SqliteConnection, id: i64, note: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE fines
        SET status = 'waived',
            notes = CASE WHEN notes = '' THEN ? ELSE notes || char(10) || ? END
        WHERE id = ? AND status IN ('unpaid', 'partial')
        "#,
    )
    .bind(note)
    .bind(note)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

// ============================================================================
// PAYMENT QUERIES
// ============================================================================

/// Data for recording a payment row
#[derive(Debug, Clone)]
pub struct PaymentRow<'a> {
    pub fine_id: i64,
    pub member_id: i64,
    pub amount_cents: i64,
    pub payment_method: PaymentMethod,
    pub payment_date: DateTime<Utc>,
    pub external_reference: Option<&'a str>,
    pub receipt_number: &'a str,
    pub staff_user: Option<&'a str>,
    pub notes: &'a str,
}

/// Insert a payment
///
/// A receipt number collision is reported as `DuplicateReceipt`.
pub async fn insert_payment(conn: &mut SqliteConnection, payment: &PaymentRow<'_>) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO payments (
            fine_id, member_id, amount_cents, payment_method, payment_date,
            external_reference, receipt_number, staff_user, notes
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(payment.fine_id)
    .bind(payment.member_id)
    .bind(payment.amount_cents)
    .bind(payment.payment_method)
    .bind(payment.payment_date)
    .bind(payment.external_reference)
    .bind(payment.receipt_number)
    .bind(payment.staff_user)
    .bind(payment.notes)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(db_err))
            if db_err.is_unique_violation() && db_err.message().contains("receipt_number") =>
        {
            Err(CirculationError::DuplicateReceipt(payment.receipt_number.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn find_payment(conn: &mut SqliteConnection, id: i64) -> Result<Option<Payment>> {
    let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(payment)
}

pub async fn list_payments_for_fine(conn: &mut SqliteConnection, fine_id: i64) -> Result<Vec<Payment>> {
    let payments = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE fine_id = ? ORDER BY id")
        .bind(fine_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(payments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    async fn seed(conn: &mut SqliteConnection) -> (i64, i64, i64) {
        let type_id = insert_membership_type(
            conn,
            &NewMembershipType::new("STD".to_string(), "Standard".to_string(), MembershipKind::Public),
        )
        .await
        .expect("Failed to insert membership type");

        let member_id = insert_member(
            conn,
            &NewMember {
                member_id: "M-100".to_string(),
                first_name: "Grace".to_string(),
                last_name: "Hopper".to_string(),
                email: "grace@example.org".to_string(),
                phone: String::new(),
                barcode: "MB-100".to_string(),
                membership_type_id: type_id,
                registration_date: date(2025, 1, 1),
                expiry_date: date(2026, 1, 1),
            },
        )
        .await
        .expect("Failed to insert member");

        let item_id = insert_item(conn, &NewItem::book("Compilers".to_string()), Utc::now())
            .await
            .expect("Failed to insert item");
        let copy_id = insert_copy(
            conn,
            &NewCopy {
                item_id,
                barcode: "C-1".to_string(),
                location: "Stacks A".to_string(),
                price_cents: 4500,
            },
        )
        .await
        .expect("Failed to insert copy");

        (member_id, item_id, copy_id)
    }

    #[tokio::test]
    async fn test_second_open_transaction_on_copy_rejected() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let mut conn = db.pool().acquire().await.expect("Failed to acquire connection");
        let (member_id, _, copy_id) = seed(&mut conn).await;

        insert_checkout(&mut conn, member_id, copy_id, Utc::now(), date(2025, 2, 1), None)
            .await
            .expect("First checkout should insert");

        let second =
            insert_checkout(&mut conn, member_id, copy_id, Utc::now(), date(2025, 2, 1), None).await;
        assert!(second.is_err(), "Partial unique index should reject a second open loan");
    }

    #[tokio::test]
    async fn test_copy_status_compare_and_set() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let mut conn = db.pool().acquire().await.expect("Failed to acquire connection");
        let (_, item_id, copy_id) = seed(&mut conn).await;

        assert_eq!(count_available_copies(&mut conn, item_id).await.expect("count"), 1);

        let won = transition_copy_status(&mut conn, copy_id, CopyStatus::Available, CopyStatus::CheckedOut)
            .await
            .expect("Failed to update copy");
        assert!(won);

        let lost = transition_copy_status(&mut conn, copy_id, CopyStatus::Available, CopyStatus::CheckedOut)
            .await
            .expect("Failed to update copy");
        assert!(!lost);
        assert_eq!(count_available_copies(&mut conn, item_id).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_receipt_detected() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let mut conn = db.pool().acquire().await.expect("Failed to acquire connection");
        let (member_id, _, _) = seed(&mut conn).await;

        let fine_id = insert_fine(
            &mut conn,
            &NewFine {
                member_id,
                transaction_id: None,
                fine_type: FineType::Other,
                amount_cents: 1000,
                issue_date: date(2025, 3, 1),
                description: "Card replacement".to_string(),
            },
            Utc::now(),
        )
        .await
        .expect("Failed to insert fine");

        let row = PaymentRow {
            fine_id,
            member_id,
            amount_cents: 100,
            payment_method: PaymentMethod::Cash,
            payment_date: Utc::now(),
            external_reference: None,
            receipt_number: "RCPT-1",
            staff_user: None,
            notes: "",
        };
        insert_payment(&mut conn, &row).await.expect("First payment should insert");

        let err = insert_payment(&mut conn, &row)
            .await
            .expect_err("Duplicate receipt should fail");
        assert!(matches!(err, CirculationError::DuplicateReceipt(ref r) if r == "RCPT-1"));
        let recorded = list_payments_for_fine(&mut conn, fine_id).await.expect("payments");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].amount_cents, 100);
    }

    #[tokio::test]
    async fn test_overpaid_fine_rejected_by_schema() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let mut conn = db.pool().acquire().await.expect("Failed to acquire connection");
        let (member_id, _, _) = seed(&mut conn).await;

        let fine_id = insert_fine(
            &mut conn,
            &NewFine {
                member_id,
                transaction_id: None,
                fine_type: FineType::Damaged,
                amount_cents: 500,
                issue_date: date(2025, 3, 1),
                description: String::new(),
            },
            Utc::now(),
        )
        .await
        .expect("Failed to insert fine");

        let result = record_fine_payment(&mut conn, fine_id, 0, 600, FineStatus::Paid).await;
        assert!(result.is_err(), "CHECK constraint should reject amount_paid > amount");
    }
}
