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

//! Database migrations
//!
//! This module handles database schema creation and migrations.
//!
//! # Migration Strategy
//! Migrations are plain SQL executed at runtime and tracked in `_migrations`,
//! so a database file can be created by any binary without sqlx-cli.
//!
//! # Store-level invariants
//! - One open transaction per copy (`idx_transactions_open_copy`)
//! - Unique receipt numbers, copy barcodes, member numbers/barcodes/emails
//! - `amount_paid_cents <= amount_cents` on fines

use crate::error::Result;
use sqlx::{Executor, SqlitePool};

/// Run all database migrations
///
/// Creates the schema and applies any pending migrations in order.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_migrations_table(pool).await?;

    run_migration(pool, 1, "initial_schema", create_initial_schema(pool)).await?;
    run_migration(pool, 2, "circulation_indexes", create_circulation_indexes(pool)).await?;

    Ok(())
}

/// Create migrations tracking table
async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    Ok(())
}

/// Run a single migration if it hasn't been applied yet
async fn run_migration(
    pool: &SqlitePool,
    id: i32,
    name: &str,
    migration_fn: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    let applied: Option<i32> = sqlx::query_scalar("SELECT id FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    if applied.is_some() {
        return Ok(());
    }

    migration_fn.await?;

    sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;

    tracing::debug!(migration = name, "applied migration");

    Ok(())
}

/// Create initial database schema
async fn create_initial_schema(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
-- ============================================================================
-- MEMBERS
-- ============================================================================

CREATE TABLE IF NOT EXISTS membership_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('student', 'faculty', 'public', 'corporate')),
    max_books INTEGER NOT NULL DEFAULT 5 CHECK (max_books >= 0),
    loan_period_days INTEGER NOT NULL DEFAULT 14 CHECK (loan_period_days > 0),
    max_renewals INTEGER NOT NULL DEFAULT 2 CHECK (max_renewals >= 0),
    annual_fee_cents INTEGER NOT NULL DEFAULT 0,
    fine_per_day_cents INTEGER NOT NULL DEFAULT 100 CHECK (fine_per_day_cents >= 0),
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS members (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    member_id TEXT NOT NULL UNIQUE,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    phone TEXT NOT NULL DEFAULT '',
    barcode TEXT NOT NULL UNIQUE,
    membership_type_id INTEGER NOT NULL,
    registration_date TEXT NOT NULL,  -- ISO 8601 date (YYYY-MM-DD)
    expiry_date TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    notes TEXT NOT NULL DEFAULT '',
    FOREIGN KEY (membership_type_id) REFERENCES membership_types(id) ON DELETE RESTRICT
);

-- ============================================================================
-- CATALOG
-- ============================================================================

CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    subtitle TEXT NOT NULL DEFAULT '',
    item_type TEXT NOT NULL DEFAULT 'book'
        CHECK (item_type IN ('book', 'ebook', 'journal', 'magazine')),
    isbn TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS copies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL,
    barcode TEXT NOT NULL UNIQUE,
    location TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'available'
        CHECK (status IN ('available', 'checked_out', 'reserved', 'damaged',
                          'lost', 'in_repair', 'withdrawn')),
    price_cents INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE RESTRICT
);

-- ============================================================================
-- CIRCULATION
-- ============================================================================

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    member_id INTEGER NOT NULL,
    copy_id INTEGER NOT NULL,
    transaction_type TEXT NOT NULL
        CHECK (transaction_type IN ('checkout', 'checkin', 'renew', 'reserve')),
    transaction_date TEXT NOT NULL,
    due_date TEXT,
    return_date TEXT,  -- NULL while the loan is open
    renewed_count INTEGER NOT NULL DEFAULT 0,
    staff_user TEXT,
    notes TEXT NOT NULL DEFAULT '',
    FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE RESTRICT,
    FOREIGN KEY (copy_id) REFERENCES copies(id) ON DELETE RESTRICT
);

CREATE TABLE IF NOT EXISTS reservations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    member_id INTEGER NOT NULL,
    item_id INTEGER NOT NULL,
    reservation_date TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'available', 'fulfilled', 'cancelled', 'expired')),
    held_copy_id INTEGER,
    available_date TEXT,
    expiry_date TEXT,
    fulfilled_date TEXT,
    notified INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE RESTRICT,
    FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE RESTRICT,
    FOREIGN KEY (held_copy_id) REFERENCES copies(id) ON DELETE SET NULL
);

-- Fines are never deleted; transaction_id is a lookup reference only
CREATE TABLE IF NOT EXISTS fines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    member_id INTEGER NOT NULL,
    transaction_id INTEGER,
    fine_type TEXT NOT NULL
        CHECK (fine_type IN ('overdue', 'lost', 'damaged', 'membership', 'other')),
    amount_cents INTEGER NOT NULL CHECK (amount_cents >= 0),
    amount_paid_cents INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'unpaid'
        CHECK (status IN ('unpaid', 'partial', 'paid', 'waived')),
    issue_date TEXT NOT NULL,
    due_date TEXT,
    description TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    CHECK (amount_paid_cents >= 0 AND amount_paid_cents <= amount_cents),
    FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE RESTRICT,
    FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS payments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fine_id INTEGER NOT NULL,
    member_id INTEGER NOT NULL,
    amount_cents INTEGER NOT NULL CHECK (amount_cents > 0),
    payment_method TEXT NOT NULL
        CHECK (payment_method IN ('cash', 'card', 'online', 'check', 'other')),
    payment_date TEXT NOT NULL,
    external_reference TEXT,
    receipt_number TEXT NOT NULL UNIQUE,
    staff_user TEXT,
    notes TEXT NOT NULL DEFAULT '',
    FOREIGN KEY (fine_id) REFERENCES fines(id) ON DELETE RESTRICT,
    FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE RESTRICT
);
        "#,
    )
    .await?;

    Ok(())
}

/// Indexes backing the circulation lookups and invariants
async fn create_circulation_indexes(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_open_copy
    ON transactions(copy_id) WHERE return_date IS NULL;
CREATE INDEX IF NOT EXISTS idx_transactions_member_open
    ON transactions(member_id) WHERE return_date IS NULL;
CREATE INDEX IF NOT EXISTS idx_copies_item ON copies(item_id, status);
CREATE INDEX IF NOT EXISTS idx_reservations_queue
    ON reservations(item_id, status, reservation_date, id);
CREATE INDEX IF NOT EXISTS idx_reservations_member ON reservations(member_id, status);
CREATE INDEX IF NOT EXISTS idx_fines_member ON fines(member_id, status);
CREATE INDEX IF NOT EXISTS idx_fines_transaction ON fines(transaction_id);
CREATE INDEX IF NOT EXISTS idx_payments_fine ON payments(fine_id);
        "#,
    )
    .await?;

    Ok(())
}
