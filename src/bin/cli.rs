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

//! Desk and maintenance CLI for the circulation core
//!
//! Copies are addressed by barcode and members by member number, the way
//! they are scanned at the desk. Results are printed as JSON.

use anyhow::{Context, Result};
use chrono::{Months, NaiveDate};
use circulation_core::storage::models::{
    CopyStatus, FineType, MembershipKind, NewCopy, NewItem, NewMember, NewMembershipType, PaymentMethod,
};
use circulation_core::storage::Database;
use circulation_core::{init_logging, Circulation, CirculationPolicy, PaymentRequest};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "circulation-cli")]
#[command(about = "Library circulation desk tool", long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "CIRCULATION_DB", default_value = "circulation.db")]
    db: PathBuf,

    /// Policy JSON file (defaults apply when omitted)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Staff user recorded on loans, payments and audit records
    #[arg(long, global = true)]
    staff: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the database and print its statistics
    Init,
    /// Add a membership type with the standard limits
    AddMembershipType {
        code: String,
        name: String,
        #[arg(long, default_value = "public")]
        kind: MembershipKind,
        #[arg(long)]
        max_books: Option<i64>,
        #[arg(long)]
        loan_period_days: Option<i64>,
        #[arg(long)]
        fine_per_day_cents: Option<i64>,
    },
    /// Register a member
    AddMember {
        /// Member number printed on the card
        member_id: String,
        first_name: String,
        last_name: String,
        email: String,
        #[arg(long)]
        membership_type: i64,
        /// Card barcode (defaults to the member number)
        #[arg(long)]
        barcode: Option<String>,
        /// Membership length in months
        #[arg(long, default_value_t = 12)]
        months: u32,
    },
    /// Add a book with one copy
    AddCopy {
        /// Existing item id; a new book is created when omitted
        #[arg(long, conflicts_with = "title")]
        item: Option<i64>,
        #[arg(long)]
        title: Option<String>,
        barcode: String,
        #[arg(long, default_value = "Stacks")]
        location: String,
        #[arg(long, default_value_t = 0)]
        price_cents: i64,
    },
    /// Change a copy's shelf status (repair, withdrawal, found)
    SetStatus { barcode: String, status: CopyStatus },
    /// Lend a copy
    Checkout { member: String, barcode: String },
    /// Return a copy
    Checkin { barcode: String },
    /// Renew the open loan on a copy
    Renew { barcode: String },
    /// Close the open loan on a copy and charge its replacement cost
    DeclareLost { barcode: String },
    /// Queue a member for an item
    Reserve { member: String, item: i64 },
    /// Cancel a reservation
    CancelReservation { reservation: i64 },
    /// Expire lapsed holds and pass their copies on
    ExpireHolds,
    /// Issue a manual fine
    Fine {
        member: String,
        #[arg(long, default_value = "damaged")]
        fine_type: FineType,
        amount_cents: i64,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Pay against a fine
    Pay {
        fine: i64,
        amount_cents: i64,
        #[arg(long, default_value = "cash")]
        method: PaymentMethod,
        /// Receipt number (generated when omitted)
        #[arg(long)]
        receipt: Option<String>,
        #[arg(long)]
        reference: Option<String>,
    },
    /// Waive a fine
    Waive { fine: i64 },
    /// Show a member's fines and outstanding balance
    Fines { member: String },
    /// Scan loans for overdue and due-soon notices
    Notices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let policy = match &cli.policy {
        Some(path) => CirculationPolicy::from_file(path)
            .with_context(|| format!("Failed to load policy from {}", path.display()))?,
        None => CirculationPolicy::default(),
    };

    let db = Database::new(&cli.db)
        .await
        .with_context(|| format!("Failed to open database {}", cli.db.display()))?;
    let circulation = Circulation::new(db, policy)?;
    let staff = cli.staff.as_deref();

    match cli.command {
        Commands::Init => {
            let stats = circulation.database().get_stats().await?;
            print_json(&serde_json::json!({
                "path": cli.db,
                "page_count": stats.page_count,
                "page_size": stats.page_size,
                "total_size": stats.total_size,
            }))?;
        }
        Commands::AddMembershipType {
            code,
            name,
            kind,
            max_books,
            loan_period_days,
            fine_per_day_cents,
        } => {
            let mut membership = NewMembershipType::new(code, name, kind);
            if let Some(max_books) = max_books {
                membership.max_books = max_books;
            }
            if let Some(days) = loan_period_days {
                membership.loan_period_days = days;
            }
            if let Some(cents) = fine_per_day_cents {
                membership.fine_per_day_cents = cents;
            }
            print_json(&circulation.members().add_membership_type(&membership).await?)?;
        }
        Commands::AddMember {
            member_id,
            first_name,
            last_name,
            email,
            membership_type,
            barcode,
            months,
        } => {
            let today = circulation.clock().today();
            let expiry_date = today
                .checked_add_months(Months::new(months))
                .unwrap_or(NaiveDate::MAX);
            let member = NewMember {
                barcode: barcode.unwrap_or_else(|| member_id.clone()),
                member_id,
                first_name,
                last_name,
                email,
                phone: String::new(),
                membership_type_id: membership_type,
                registration_date: today,
                expiry_date,
            };
            print_json(&circulation.members().add_member(&member).await?)?;
        }
        Commands::AddCopy {
            item,
            title,
            barcode,
            location,
            price_cents,
        } => {
            let catalog = circulation.catalog();
            let item_id = match (item, title) {
                (Some(id), _) => id,
                (None, Some(title)) => catalog.add_item(&NewItem::book(title)).await?.id,
                (None, None) => anyhow::bail!("either --item or --title is required"),
            };
            let copy = catalog
                .add_copy(&NewCopy {
                    item_id,
                    barcode,
                    location,
                    price_cents,
                })
                .await?;
            print_json(&copy)?;
        }
        Commands::SetStatus { barcode, status } => {
            let copy = circulation.catalog().get_copy_by_barcode(&barcode).await?;
            print_json(&circulation.set_copy_status(copy.id, status, staff).await?)?;
        }
        Commands::Checkout { member, barcode } => {
            let member = circulation.members().get_member_by_number(&member).await?;
            let copy = circulation.catalog().get_copy_by_barcode(&barcode).await?;
            print_json(&circulation.checkout(member.id, copy.id, staff).await?)?;
        }
        Commands::Checkin { barcode } => {
            let loan = open_loan(&circulation, &barcode).await?;
            print_json(&circulation.checkin(loan, staff).await?)?;
        }
        Commands::Renew { barcode } => {
            let loan = open_loan(&circulation, &barcode).await?;
            print_json(&circulation.renew(loan, staff).await?)?;
        }
        Commands::DeclareLost { barcode } => {
            let loan = open_loan(&circulation, &barcode).await?;
            print_json(&circulation.declare_lost(loan, staff).await?)?;
        }
        Commands::Reserve { member, item } => {
            let member = circulation.members().get_member_by_number(&member).await?;
            print_json(&circulation.reserve(member.id, item, staff).await?)?;
        }
        Commands::CancelReservation { reservation } => {
            print_json(&circulation.cancel(reservation, staff).await?)?;
        }
        Commands::ExpireHolds => {
            let expired = circulation.expire_stale().await?;
            print_json(&serde_json::json!({ "expired": expired }))?;
        }
        Commands::Fine {
            member,
            fine_type,
            amount_cents,
            description,
        } => {
            let member = circulation.members().get_member_by_number(&member).await?;
            let fine = circulation
                .issue_fine(member.id, fine_type, amount_cents, &description, staff)
                .await?;
            print_json(&fine)?;
        }
        Commands::Pay {
            fine,
            amount_cents,
            method,
            receipt,
            reference,
        } => {
            let receipt = receipt.unwrap_or_else(|| circulation.generate_receipt_number());
            let mut request = PaymentRequest::new(amount_cents, method, receipt);
            if let Some(staff) = staff {
                request = request.staff(staff);
            }
            if let Some(reference) = reference {
                request = request.reference(reference);
            }
            print_json(&circulation.apply_payment(fine, &request).await?)?;
        }
        Commands::Waive { fine } => {
            let staff = staff.context("--staff is required to waive a fine")?;
            print_json(&circulation.waive(fine, staff).await?)?;
        }
        Commands::Fines { member } => {
            let member = circulation.members().get_member_by_number(&member).await?;
            let fines = circulation.member_fines(member.id).await?;
            let balance = circulation.outstanding_balance(member.id).await?;
            print_json(&serde_json::json!({
                "member": member.member_id,
                "fines": fines,
                "outstanding_cents": balance,
            }))?;
        }
        Commands::Notices => {
            print_json(&circulation.scan_notices().await?)?;
        }
    }

    circulation.database().clone().close().await?;
    Ok(())
}

/// Id of the open loan on a copy
async fn open_loan(circulation: &Circulation, barcode: &str) -> Result<i64> {
    let copy = circulation.catalog().get_copy_by_barcode(barcode).await?;
    let loan = circulation
        .open_loan_for_copy(copy.id)
        .await?
        .with_context(|| format!("Copy {} is not on loan", barcode))?;
    Ok(loan.id)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
