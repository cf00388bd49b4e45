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

//! Outbound circulation events
//!
//! The core never delivers notifications or persists audit trails itself. It
//! hands two kinds of records to an [`EventSink`]:
//! - [`NotificationEvent`] - something a member should hear about
//! - [`AuditRecord`] - one record per mutating call, with the changed fields
//!
//! Events are published only after the unit of work that produced them has
//! committed, so a sink never sees changes that were rolled back.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Member-facing notification produced by the circulation core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// Loan is past its due date
    Overdue {
        member_id: i64,
        transaction_id: i64,
        days_overdue: i64,
    },
    /// Loan is due within the configured window
    DueSoon {
        member_id: i64,
        transaction_id: i64,
        due_date: NaiveDate,
    },
    /// Reserved item is waiting on the hold shelf
    ReservedAvailable {
        member_id: i64,
        reservation_id: i64,
        expiry_date: NaiveDate,
    },
    /// New fine was issued
    FineIssued {
        member_id: i64,
        fine_id: i64,
        amount_cents: i64,
    },
}

impl NotificationEvent {
    pub fn member_id(&self) -> i64 {
        match self {
            NotificationEvent::Overdue { member_id, .. }
            | NotificationEvent::DueSoon { member_id, .. }
            | NotificationEvent::ReservedAvailable { member_id, .. }
            | NotificationEvent::FineIssued { member_id, .. } => *member_id,
        }
    }

    /// Short name used in logs and delivery templates
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::Overdue { .. } => "overdue",
            NotificationEvent::DueSoon { .. } => "due_soon",
            NotificationEvent::ReservedAvailable { .. } => "reserved_available",
            NotificationEvent::FineIssued { .. } => "fine_issued",
        }
    }
}

/// Audit trail entry for a mutating call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: String,
    pub entity: String,
    pub entity_id: i64,
    pub actor: Option<String>,
    pub changes: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: &str,
        entity: &str,
        entity_id: i64,
        actor: Option<&str>,
        changes: serde_json::Value,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action: action.to_string(),
            entity: entity.to_string(),
            entity_id,
            actor: actor.map(str::to_string),
            changes,
            recorded_at,
        }
    }
}

/// Receiver for notifications and audit records
pub trait EventSink: Send + Sync {
    /// Called for every notification after commit
    fn notify(&self, event: &NotificationEvent);

    /// Called for every audit record after commit
    fn audit(&self, record: &AuditRecord);
}

/// Writes events to the `tracing` pipeline
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notify(&self, event: &NotificationEvent) {
        tracing::info!(
            kind = event.kind(),
            member_id = event.member_id(),
            event = ?event,
            "notification"
        );
    }

    fn audit(&self, record: &AuditRecord) {
        tracing::info!(
            action = %record.action,
            entity = %record.entity,
            entity_id = record.entity_id,
            actor = record.actor.as_deref().unwrap_or("system"),
            changes = %record.changes,
            "audit"
        );
    }
}

/// Keeps every event in memory
///
/// Useful for tests and for request layers that forward events in batches.
#[derive(Debug, Default)]
pub struct MemorySink {
    notifications: Mutex<Vec<NotificationEvent>>,
    audits: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<NotificationEvent> {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn audits(&self) -> Vec<AuditRecord> {
        self.audits.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain collected events, returning them
    pub fn take(&self) -> (Vec<NotificationEvent>, Vec<AuditRecord>) {
        let notifications =
            std::mem::take(&mut *self.notifications.lock().unwrap_or_else(|e| e.into_inner()));
        let audits = std::mem::take(&mut *self.audits.lock().unwrap_or_else(|e| e.into_inner()));
        (notifications, audits)
    }
}

impl EventSink for MemorySink {
    fn notify(&self, event: &NotificationEvent) {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }

    fn audit(&self, record: &AuditRecord) {
        self.audits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}

/// Events gathered during one unit of work, published after commit
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    notifications: Vec<NotificationEvent>,
    audits: Vec<AuditRecord>,
}

impl Outbox {
    pub(crate) fn notify(&mut self, event: NotificationEvent) {
        self.notifications.push(event);
    }

    pub(crate) fn audit(&mut self, record: AuditRecord) {
        self.audits.push(record);
    }

    pub(crate) fn publish(self, sink: &dyn EventSink) {
        for record in &self.audits {
            sink.audit(record);
        }
        for event in &self.notifications {
            sink.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_serializes_with_tag() {
        let event = NotificationEvent::FineIssued {
            member_id: 1,
            fine_id: 9,
            amount_cents: 300,
        };
        let json = serde_json::to_value(&event).expect("Failed to serialize");
        assert_eq!(json["type"], "fine_issued");
        assert_eq!(json["amount_cents"], 300);
        assert_eq!(event.kind(), "fine_issued");
    }

    #[test]
    fn test_outbox_publishes_to_sink() {
        let sink = MemorySink::new();
        let mut outbox = Outbox::default();
        outbox.audit(AuditRecord::new(
            "checkout",
            "transaction",
            1,
            Some("desk"),
            serde_json::json!({"copy_id": 4}),
            Utc::now(),
        ));
        outbox.notify(NotificationEvent::Overdue {
            member_id: 2,
            transaction_id: 1,
            days_overdue: 3,
        });
        outbox.publish(&sink);

        assert_eq!(sink.audits().len(), 1);
        assert_eq!(sink.notifications()[0].member_id(), 2);

        let (notifications, audits) = sink.take();
        assert_eq!((notifications.len(), audits.len()), (1, 1));
        assert!(sink.notifications().is_empty());
    }
}
