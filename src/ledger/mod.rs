//! Alert ledger: one `AlertRecord` per detection event, keyed by alert id (the event id).
//!
//! The dispatcher is the only writer. It serializes writes per alert id, so stores only
//! need to make single-record `upsert`/`get` atomic.

mod memory;
mod sqlite;

pub use memory::InMemoryAlertLedger;
pub use sqlite::SqliteAlertLedger;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PipelineResult;
use crate::{DetectionEvent, DetectionKind, EventId, GeoFix};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Attempt cycle in progress.
    Pending,
    /// Delivered. Only a later alert round of the same event reopens it.
    Sent,
    /// Left unresolved at shutdown. Eligible for manual re-send.
    Failed,
    /// Attempt budget spent; terminal until an operator re-sends.
    Exhausted,
}

impl AlertStatus {
    pub const ALL: [AlertStatus; 4] = [
        AlertStatus::Pending,
        AlertStatus::Sent,
        AlertStatus::Failed,
        AlertStatus::Exhausted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Sent => "sent",
            AlertStatus::Failed => "failed",
            AlertStatus::Exhausted => "exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(value.trim()))
    }

    /// Pending and Sent records block a new attempt cycle for the same round.
    pub fn is_live(self) -> bool {
        matches!(self, AlertStatus::Pending | AlertStatus::Sent)
    }

    pub fn is_resendable(self) -> bool {
        matches!(self, AlertStatus::Failed | AlertStatus::Exhausted)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlertRecord {
    pub alert_id: String,
    pub event_id: EventId,
    pub round: u32,
    pub kind: DetectionKind,
    pub content: String,
    pub geo_fix: Option<GeoFix>,
    pub status: AlertStatus,
    pub attempt_count: u32,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub last_attempt_at_ms: Option<u64>,
    pub transport_message_id: Option<String>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub resend_count: u32,
}

impl AlertRecord {
    /// Fresh Pending record for an event's current round.
    pub fn pending(event: &DetectionEvent, geo_fix: Option<GeoFix>, now_ms: u64) -> Self {
        Self {
            alert_id: event.alert_id(),
            event_id: event.id.clone(),
            round: event.alert_round,
            kind: event.kind,
            content: event.content.clone(),
            geo_fix,
            status: AlertStatus::Pending,
            attempt_count: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            last_attempt_at_ms: None,
            transport_message_id: None,
            last_error: None,
            resend_count: 0,
        }
    }
}

/// Persistence for alert records, keyed by `alert_id`.
pub trait AlertLedger: Send + Sync {
    /// Insert or replace the record with the same `alert_id`.
    fn upsert(&self, record: &AlertRecord) -> PipelineResult<()>;

    fn get(&self, alert_id: &str) -> PipelineResult<Option<AlertRecord>>;

    /// Records with the given status, oldest first.
    fn list_by_status(&self, status: AlertStatus) -> PipelineResult<Vec<AlertRecord>>;

    /// Records created at or after `since_ms`, oldest first.
    fn list_since(&self, since_ms: u64) -> PipelineResult<Vec<AlertRecord>>;
}

fn sort_oldest_first(records: &mut [AlertRecord]) {
    records.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.alert_id.cmp(&b.alert_id))
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ContentKey;

    pub(crate) fn record(content: &str, round: u32, created_at_ms: u64) -> AlertRecord {
        let key = ContentKey::of(content);
        let event = DetectionEvent {
            id: EventId::derive(&key, 0),
            key,
            kind: DetectionKind::Barcode,
            content: content.to_string(),
            first_seen_ms: 0,
            last_seen_ms: 0,
            occurrence_count: 1,
            alert_round: round,
        };
        AlertRecord::pending(&event, None, created_at_ms)
    }

    /// Shared behaviour every store must satisfy.
    pub(crate) fn exercise_ledger(ledger: &dyn AlertLedger) {
        let mut a = record("ABC123", 0, 100);
        let b = record("door 4", 1, 200);
        let c = record("exit", 0, 300);

        for r in [&a, &b, &c] {
            ledger.upsert(r).unwrap();
        }
        assert_eq!(ledger.get(&a.alert_id).unwrap().unwrap(), a);
        assert_eq!(ledger.get(&b.alert_id).unwrap().unwrap().round, 1);
        assert!(ledger.get("missing").unwrap().is_none());

        a.status = AlertStatus::Sent;
        a.attempt_count = 2;
        a.transport_message_id = Some("77".into());
        ledger.upsert(&a).unwrap();
        assert_eq!(
            ledger.get(&a.alert_id).unwrap().unwrap().status,
            AlertStatus::Sent
        );

        let pending = ledger.list_by_status(AlertStatus::Pending).unwrap();
        let ids: Vec<&str> = pending.iter().map(|r| r.alert_id.as_str()).collect();
        assert_eq!(ids, vec![b.alert_id.as_str(), c.alert_id.as_str()]);

        let recent = ledger.list_since(200).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].alert_id, b.alert_id);
    }

    #[test]
    fn status_names_roundtrip() {
        for status in AlertStatus::ALL {
            assert_eq!(AlertStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AlertStatus::parse("EXHAUSTED"), Some(AlertStatus::Exhausted));
        assert!(AlertStatus::parse("queued").is_none());
        assert!(AlertStatus::Sent.is_live());
        assert!(!AlertStatus::Sent.is_resendable());
        assert!(AlertStatus::Failed.is_resendable());
    }
}
