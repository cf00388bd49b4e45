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

//! Circulation policy configuration
//!
//! Library-wide knobs that are not part of a membership type. Loaded from a
//! JSON file (or built in code) and validated once at startup.
//!
//! # Example file
//! ```json
//! {
//!   "hold_period_days": 3,
//!   "max_fine_cents": 2000,
//!   "block_renewal_when_reserved": true,
//!   "due_soon_days": 2,
//!   "receipt_prefix": "RCPT"
//! }
//! ```

use crate::error::{CirculationError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Longest hold or notice window a policy may configure
pub const MAX_PERIOD_DAYS: i64 = 365;

/// Policy settings shared by every circulation operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CirculationPolicy {
    /// Days a promoted reservation stays on the hold shelf
    pub hold_period_days: i64,
    /// Upper bound for a single overdue fine (None = uncapped)
    pub max_fine_cents: Option<i64>,
    /// Refuse renewals while other members are queued for the item
    pub block_renewal_when_reserved: bool,
    /// Loans due within this many days produce a due-soon notice
    pub due_soon_days: i64,
    /// Prefix for generated payment receipt numbers
    pub receipt_prefix: String,
}

impl Default for CirculationPolicy {
    fn default() -> Self {
        Self {
            hold_period_days: 3,
            max_fine_cents: None,
            block_renewal_when_reserved: true,
            due_soon_days: 2,
            receipt_prefix: "RCPT".to_string(),
        }
    }
}

impl CirculationPolicy {
    /// Parse and validate a policy from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        let policy: Self = serde_json::from_str(json)
            .map_err(|e| CirculationError::ConfigurationError(format!("Invalid policy JSON: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load and validate a policy file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            CirculationError::ConfigurationError(format!(
                "Failed to read policy file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Reject settings that would make circulation rules meaningless
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PERIOD_DAYS).contains(&self.hold_period_days) {
            return Err(CirculationError::ConfigurationError(format!(
                "hold_period_days must be between 1 and {}",
                MAX_PERIOD_DAYS
            )));
        }
        if !(0..=MAX_PERIOD_DAYS).contains(&self.due_soon_days) {
            return Err(CirculationError::ConfigurationError(format!(
                "due_soon_days must be between 0 and {}",
                MAX_PERIOD_DAYS
            )));
        }
        if matches!(self.max_fine_cents, Some(cap) if cap <= 0) {
            return Err(CirculationError::ConfigurationError(
                "max_fine_cents must be positive when set".to_string(),
            ));
        }
        if self.receipt_prefix.trim().is_empty() {
            return Err(CirculationError::ConfigurationError(
                "receipt_prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply the configured cap to a computed fine amount
    pub fn cap_fine(&self, amount_cents: i64) -> i64 {
        match self.max_fine_cents {
            Some(cap) => amount_cents.min(cap),
            None => amount_cents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_uses_defaults() {
        let policy = CirculationPolicy::from_json_str(r#"{"hold_period_days": 5}"#)
            .expect("Failed to parse policy");

        assert_eq!(policy.hold_period_days, 5);
        assert_eq!(policy.due_soon_days, 2);
        assert!(policy.block_renewal_when_reserved);
        assert_eq!(policy.max_fine_cents, None);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let err = CirculationPolicy::from_json_str(r#"{"hold_period_days": 0}"#)
            .expect_err("Zero hold period should be rejected");
        assert!(matches!(err, CirculationError::ConfigurationError(_)));

        let err = CirculationPolicy::from_json_str(r#"{"hold_period_days": 1000000000}"#)
            .expect_err("Hold period past the limit should be rejected");
        assert!(matches!(err, CirculationError::ConfigurationError(_)));

        let err = CirculationPolicy::from_json_str(r#"{"due_soon_days": 366}"#)
            .expect_err("Notice window past the limit should be rejected");
        assert!(matches!(err, CirculationError::ConfigurationError(_)));

        let err = CirculationPolicy::from_json_str(r#"{"max_fine_cents": -1}"#)
            .expect_err("Negative cap should be rejected");
        assert!(matches!(err, CirculationError::ConfigurationError(_)));
    }

    #[test]
    fn test_cap_fine() {
        let mut policy = CirculationPolicy::default();
        assert_eq!(policy.cap_fine(10_000), 10_000);

        policy.max_fine_cents = Some(2_000);
        assert_eq!(policy.cap_fine(10_000), 2_000);
        assert_eq!(policy.cap_fine(300), 300);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        write!(file, r#"{{"receipt_prefix": "LIB", "due_soon_days": 1}}"#)
            .expect("Failed to write policy");

        let policy = CirculationPolicy::from_file(file.path()).expect("Failed to load policy");
        assert_eq!(policy.receipt_prefix, "LIB");
        assert_eq!(policy.due_soon_days, 1);
    }
}
