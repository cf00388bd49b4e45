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

//! Database models for circulation
//!
//! Rust structs mirroring the SQLite schema in `migrations.rs`.
//!
//! # Conventions
//! - Choice fields are closed enums stored as lowercase TEXT
//! - Money is stored in integer cents
//! - Computed values (`is_overdue`, `balance`, `full_name`) are derived on
//!   read and never persisted

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::CirculationError;

// ============================================================================
// ENUMS
// ============================================================================

/// Declares a TEXT-backed enum with string conversions in both directions
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[serde(rename_all = "snake_case")]
        #[sqlx(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CirculationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CirculationError::InvalidInput(format!(
                        "Unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum! {
    /// Membership category
    pub enum MembershipKind {
        Student => "student",
        Faculty => "faculty",
        Public => "public",
        Corporate => "corporate",
    }
}

text_enum! {
    /// Catalog item format
    pub enum ItemType {
        Book => "book",
        Ebook => "ebook",
        Journal => "journal",
        Magazine => "magazine",
    }
}

text_enum! {
    /// Shelf status of a physical or digital copy
    pub enum CopyStatus {
        Available => "available",
        CheckedOut => "checked_out",
        /// Held for a member whose reservation was promoted
        Reserved => "reserved",
        Damaged => "damaged",
        Lost => "lost",
        InRepair => "in_repair",
        Withdrawn => "withdrawn",
    }
}

text_enum! {
    /// Kind of circulation transaction
    pub enum TransactionType {
        Checkout => "checkout",
        Checkin => "checkin",
        Renew => "renew",
        Reserve => "reserve",
    }
}

text_enum! {
    /// Reservation lifecycle
    ///
    /// `pending` -> `available` -> `fulfilled`; `cancelled` and `expired`
    /// are the other terminal states.
    pub enum ReservationStatus {
        Pending => "pending",
        Available => "available",
        Fulfilled => "fulfilled",
        Cancelled => "cancelled",
        Expired => "expired",
    }
}

impl ReservationStatus {
    /// Pending or waiting on the hold shelf
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Available)
    }
}

text_enum! {
    /// Reason a fine was issued
    pub enum FineType {
        Overdue => "overdue",
        Lost => "lost",
        Damaged => "damaged",
        Membership => "membership",
        Other => "other",
    }
}

text_enum! {
    /// Payment state of a fine
    pub enum FineStatus {
        Unpaid => "unpaid",
        Partial => "partial",
        Paid => "paid",
        Waived => "waived",
    }
}

impl FineStatus {
    /// Status implied by the paid amount (waiving is an explicit action)
    pub fn from_amounts(amount_cents: i64, amount_paid_cents: i64) -> Self {
        if amount_paid_cents >= amount_cents {
            FineStatus::Paid
        } else if amount_paid_cents > 0 {
            FineStatus::Partial
        } else {
            FineStatus::Unpaid
        }
    }

    /// Nothing more can be collected
    pub fn is_settled(&self) -> bool {
        matches!(self, FineStatus::Paid | FineStatus::Waived)
    }
}

text_enum! {
    /// How a payment was tendered
    pub enum PaymentMethod {
        Cash => "cash",
        Card => "card",
        Online => "online",
        Check => "check",
        Other => "other",
    }
}

/// Format cents as a decimal amount ("3.00")
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

// ============================================================================
// MEMBERS
// ============================================================================

/// Loan limits and fees shared by a group of members
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MembershipType {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub kind: MembershipKind,
    pub max_books: i64,
    pub loan_period_days: i64,
    pub max_renewals: i64,
    pub annual_fee_cents: i64,
    pub fine_per_day_cents: i64,
    pub is_active: bool,
}

/// Data for creating a membership type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMembershipType {
    pub code: String,
    pub name: String,
    pub kind: MembershipKind,
    pub max_books: i64,
    pub loan_period_days: i64,
    pub max_renewals: i64,
    pub annual_fee_cents: i64,
    pub fine_per_day_cents: i64,
}

impl NewMembershipType {
    /// Membership type with the library's standard limits
    /// (5 items, 14 days, 2 renewals, 1.00 per day)
    pub fn new(code: String, name: String, kind: MembershipKind) -> Self {
        Self {
            code,
            name,
            kind,
            max_books: 5,
            loan_period_days: 14,
            max_renewals: 2,
            annual_fee_cents: 0,
            fine_per_day_cents: 100,
        }
    }
}

/// Library member
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    /// Public member number printed on the card
    pub member_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub barcode: String,
    pub membership_type_id: i64,
    pub registration_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub is_active: bool,
    pub notes: String,
}

impl Member {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Active and not past the expiry date
    pub fn is_membership_valid(&self, today: NaiveDate) -> bool {
        self.is_active && self.expiry_date >= today
    }
}

/// Data for registering a member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMember {
    pub member_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub barcode: String,
    pub membership_type_id: i64,
    pub registration_date: NaiveDate,
    pub expiry_date: NaiveDate,
}

/// Member joined with their membership limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberProfile {
    pub member: Member,
    pub membership: MembershipType,
}

impl MemberProfile {
    /// Valid membership on a membership type that is still offered
    pub fn can_borrow(&self, today: NaiveDate) -> bool {
        self.member.is_membership_valid(today) && self.membership.is_active
    }
}

// ============================================================================
// CATALOG
// ============================================================================

/// Catalog entry (title-level record)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub title: String,
    pub subtitle: String,
    pub item_type: ItemType,
    pub isbn: String,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub fn title_with_subtitle(&self) -> String {
        if self.subtitle.is_empty() {
            self.title.clone()
        } else {
            format!("{}: {}", self.title, self.subtitle)
        }
    }
}

/// Data for creating an item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewItem {
    pub title: String,
    pub subtitle: String,
    pub item_type: ItemType,
    pub isbn: String,
}

impl NewItem {
    pub fn book(title: String) -> Self {
        Self {
            title,
            subtitle: String::new(),
            item_type: ItemType::Book,
            isbn: String::new(),
        }
    }
}

/// Lendable instance of an item
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ItemCopy {
    pub id: i64,
    pub item_id: i64,
    pub barcode: String,
    pub location: String,
    pub status: CopyStatus,
    pub price_cents: i64,
}

/// Data for adding a copy to an item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCopy {
    pub item_id: i64,
    pub barcode: String,
    pub location: String,
    pub price_cents: i64,
}

// ============================================================================
// CIRCULATION
// ============================================================================

/// Loan record linking a member to a copy
///
/// Open while `return_date` is unset. At most one open transaction exists per
/// copy (enforced by a partial unique index).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub member_id: i64,
    pub copy_id: i64,
    pub transaction_type: TransactionType,
    pub transaction_date: DateTime<Utc>,
    #[sqlx(default)]
    pub due_date: Option<NaiveDate>,
    #[sqlx(default)]
    pub return_date: Option<NaiveDate>,
    pub renewed_count: i64,
    #[sqlx(default)]
    pub staff_user: Option<String>,
    pub notes: String,
}

impl Transaction {
    pub fn is_open(&self) -> bool {
        self.return_date.is_none()
    }

    /// Past due and not yet returned
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        match (self.due_date, self.return_date) {
            (Some(due), None) => due < today,
            _ => false,
        }
    }

    pub fn days_overdue(&self, today: NaiveDate) -> i64 {
        match self.due_date {
            Some(due) if self.is_overdue(today) => (today - due).num_days(),
            _ => 0,
        }
    }
}

/// Member queued for an item
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub member_id: i64,
    pub item_id: i64,
    pub reservation_date: DateTime<Utc>,
    pub status: ReservationStatus,
    /// Copy set aside once the reservation is promoted
    #[sqlx(default)]
    pub held_copy_id: Option<i64>,
    #[sqlx(default)]
    pub available_date: Option<NaiveDate>,
    #[sqlx(default)]
    pub expiry_date: Option<NaiveDate>,
    #[sqlx(default)]
    pub fulfilled_date: Option<NaiveDate>,
    pub notified: bool,
}

/// Amount owed by a member
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Fine {
    pub id: i64,
    pub member_id: i64,
    #[sqlx(default)]
    pub transaction_id: Option<i64>,
    pub fine_type: FineType,
    pub amount_cents: i64,
    pub amount_paid_cents: i64,
    pub status: FineStatus,
    pub issue_date: NaiveDate,
    #[sqlx(default)]
    pub due_date: Option<NaiveDate>,
    pub description: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

impl Fine {
    /// Unpaid remainder; zero once waived
    pub fn balance_cents(&self) -> i64 {
        if self.status == FineStatus::Waived {
            0
        } else {
            self.amount_cents - self.amount_paid_cents
        }
    }
}

/// Data for issuing a fine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFine {
    pub member_id: i64,
    pub transaction_id: Option<i64>,
    pub fine_type: FineType,
    pub amount_cents: i64,
    pub issue_date: NaiveDate,
    pub description: String,
}

/// Money applied to one fine
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub fine_id: i64,
    pub member_id: i64,
    pub amount_cents: i64,
    pub payment_method: PaymentMethod,
    pub payment_date: DateTime<Utc>,
    #[sqlx(default)]
    pub external_reference: Option<String>,
    pub receipt_number: String,
    #[sqlx(default)]
    pub staff_user: Option<String>,
    pub notes: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn loan(due: Option<NaiveDate>, returned: Option<NaiveDate>) -> Transaction {
        Transaction {
            id: 1,
            member_id: 1,
            copy_id: 1,
            transaction_type: TransactionType::Checkout,
            transaction_date: Utc::now(),
            due_date: due,
            return_date: returned,
            renewed_count: 0,
            staff_user: None,
            notes: String::new(),
        }
    }

    #[test]
    fn test_copy_status_text() {
        assert_eq!(CopyStatus::CheckedOut.as_str(), "checked_out");
        assert_eq!("in_repair".parse::<CopyStatus>().ok(), Some(CopyStatus::InRepair));
        assert!("shelved".parse::<CopyStatus>().is_err());
        assert_eq!(CopyStatus::ALL.len(), 7);
    }

    #[test]
    fn test_overdue_computation() {
        let today = date(2025, 6, 10);

        let open_late = loan(Some(date(2025, 6, 7)), None);
        assert!(open_late.is_overdue(today));
        assert_eq!(open_late.days_overdue(today), 3);

        let due_today = loan(Some(today), None);
        assert!(!due_today.is_overdue(today));
        assert_eq!(due_today.days_overdue(today), 0);

        let returned = loan(Some(date(2025, 6, 1)), Some(date(2025, 6, 9)));
        assert!(!returned.is_overdue(today));
        assert_eq!(returned.days_overdue(today), 0);
    }

    #[test]
    fn test_fine_status_from_amounts() {
        assert_eq!(FineStatus::from_amounts(300, 0), FineStatus::Unpaid);
        assert_eq!(FineStatus::from_amounts(300, 100), FineStatus::Partial);
        assert_eq!(FineStatus::from_amounts(300, 300), FineStatus::Paid);
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(300), "3.00");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(-1250), "-12.50");
    }

    #[test]
    fn test_membership_validity() {
        let member = Member {
            id: 1,
            member_id: "M-1".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.org".to_string(),
            phone: String::new(),
            barcode: "B-1".to_string(),
            membership_type_id: 1,
            registration_date: date(2024, 1, 1),
            expiry_date: date(2025, 12, 31),
            is_active: true,
            notes: String::new(),
        };
        assert!(member.is_membership_valid(date(2025, 12, 31)));
        assert!(!member.is_membership_valid(date(2026, 1, 1)));
        assert_eq!(member.full_name(), "Ada Lovelace");

        let inactive = Member {
            is_active: false,
            ..member
        };
        assert!(!inactive.is_membership_valid(date(2025, 1, 1)));
    }
}
