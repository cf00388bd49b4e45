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


//! Error types for the circulation core
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are grouped the same way callers have to react to them:
//!
//! ### Circulation rule violations (terminal, surface to the end user)
//! - `MemberInvalid`, `MemberAtLimit`, `CopyUnavailable`
//! - `TransactionClosed`, `RenewalLimitExceeded`, `ItemReserved`
//! - `AlreadyReserved`, `InvalidState`
//! - `OverpaymentNotAllowed`, `DuplicateReceipt`
//!
//! ### Transient store contention (retry with backoff)
//! - `Retryable` - SQLite BUSY/LOCKED, pool acquire timeouts, lost optimistic updates
//!
//! ### Everything else
//! - Missing records, bad input, configuration and driver errors

use serde::Serialize;
use thiserror::Error;

/// Result type alias using our CirculationError type
pub type Result<T> = std::result::Result<T, CirculationError>;

/// Main error type for the circulation core
///
/// Each rule violation carries enough context to explain the refusal to the
/// member at the desk.
#[derive(Error, Debug)]
pub enum CirculationError {
    // ===== Circulation Rule Violations =====

    /// Membership is inactive or expired
    #[error("Membership {member_id} is not valid (inactive or expired)")]
    MemberInvalid { member_id: String },

    /// Member already holds as many open loans as their membership allows
    #[error("Member {member_id} has reached the loan limit of {max_books} items")]
    MemberAtLimit { member_id: String, max_books: i64 },

    /// Copy cannot be lent in its current status
    #[error("Copy {barcode} is not available for checkout (status: {status})")]
    CopyUnavailable { barcode: String, status: String },

    /// Transaction has already been checked in
    #[error("Transaction {transaction_id} is already closed")]
    TransactionClosed { transaction_id: i64 },

    /// Renewal would exceed the membership's renewal allowance
    #[error("Transaction {transaction_id} has already been renewed {max_renewals} times")]
    RenewalLimitExceeded {
        transaction_id: i64,
        max_renewals: i64,
    },

    /// Another member is waiting for the item
    #[error("Item {item_id} has {waiting} pending reservation(s); renewal refused")]
    ItemReserved { item_id: i64, waiting: i64 },

    /// Member already holds a pending or ready reservation for the item
    #[error("Member already holds reservation {reservation_id} for item {item_id}")]
    AlreadyReserved { reservation_id: i64, item_id: i64 },

    /// Entity is in a state that does not allow the requested transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Payment exceeds the remaining balance of the fine
    #[error("Payment of {amount_cents} cents exceeds fine {fine_id} balance of {balance_cents} cents")]
    OverpaymentNotAllowed {
        fine_id: i64,
        amount_cents: i64,
        balance_cents: i64,
    },

    /// Receipt number is already in use; retry with a fresh number
    #[error("Receipt number already used: {0}")]
    DuplicateReceipt(String),

    // ===== Transient Errors =====

    /// Store contention; the whole operation may be retried
    #[error("Store is busy, retry the operation: {0}")]
    Retryable(String),

    // ===== Lookup/Input Errors =====

    /// Database record not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database schema migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Policy or configuration file is invalid
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // ===== External Library Errors =====

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Closed set of error kinds reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MemberInvalid,
    MemberAtLimit,
    CopyUnavailable,
    TransactionClosed,
    RenewalLimitExceeded,
    ItemReserved,
    AlreadyReserved,
    InvalidState,
    OverpaymentNotAllowed,
    DuplicateReceipt,
    Retryable,
    NotFound,
    InvalidInput,
    Internal,
}

impl CirculationError {
    /// Shorthand for a missing record
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CirculationError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Map the error to its reported kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            CirculationError::MemberInvalid { .. } => ErrorKind::MemberInvalid,
            CirculationError::MemberAtLimit { .. } => ErrorKind::MemberAtLimit,
            CirculationError::CopyUnavailable { .. } => ErrorKind::CopyUnavailable,
            CirculationError::TransactionClosed { .. } => ErrorKind::TransactionClosed,
            CirculationError::RenewalLimitExceeded { .. } => ErrorKind::RenewalLimitExceeded,
            CirculationError::ItemReserved { .. } => ErrorKind::ItemReserved,
            CirculationError::AlreadyReserved { .. } => ErrorKind::AlreadyReserved,
            CirculationError::InvalidState(_) => ErrorKind::InvalidState,
            CirculationError::OverpaymentNotAllowed { .. } => ErrorKind::OverpaymentNotAllowed,
            CirculationError::DuplicateReceipt(_) => ErrorKind::DuplicateReceipt,
            CirculationError::Retryable(_) => ErrorKind::Retryable,
            CirculationError::NotFound { .. } => ErrorKind::NotFound,
            CirculationError::InvalidInput(_) | CirculationError::ConfigurationError(_) => {
                ErrorKind::InvalidInput
            }
            CirculationError::MigrationFailed(_)
            | CirculationError::Database(_)
            | CirculationError::Json(_)
            | CirculationError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Only store contention should be retried automatically
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

/// SQLite primary result codes for contention
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // Extended result codes keep the primary code in the low byte
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    }
}

impl From<sqlx::Error> for CirculationError {
    fn from(err: sqlx::Error) -> Self {
        if is_contention(&err) {
            CirculationError::Retryable(err.to_string())
        } else {
            CirculationError::Database(err)
        }
    }
}

impl From<std::num::ParseIntError> for CirculationError {
    fn from(err: std::num::ParseIntError) -> Self {
        CirculationError::InvalidInput(format!("Failed to parse integer: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_contention_is_retryable() {
        assert!(CirculationError::Retryable("busy".to_string()).is_retryable());
        assert!(CirculationError::from(sqlx::Error::PoolTimedOut).is_retryable());

        let terminal = CirculationError::MemberAtLimit {
            member_id: "M-1".to_string(),
            max_books: 5,
        };
        assert!(!terminal.is_retryable());
        assert_eq!(terminal.kind(), ErrorKind::MemberAtLimit);
    }

    #[test]
    fn test_row_not_found_is_internal() {
        let err = CirculationError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_messages_carry_reason() {
        let err = CirculationError::OverpaymentNotAllowed {
            fine_id: 7,
            amount_cents: 500,
            balance_cents: 300,
        };
        assert_eq!(
            err.to_string(),
            "Payment of 500 cents exceeds fine 7 balance of 300 cents"
        );
    }
}
