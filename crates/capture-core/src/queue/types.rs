// ============================================================================
// Offline Queue Types
// ============================================================================
// Records persisted in the queue database. All records are JSON so the
// session payload (arbitrary field values) survives round trips intact.
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{SessionStatus, SubmittedSession};
use crate::types::SchemaRef;

/// Lifecycle of a queued session. `Synced` is not a state here: a synced
/// entry is removed and leaves an `AuditRecord` behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum EntryState {
    Enqueued,
    InFlight,
    Conflict { reason: String },
    Failed,
}

impl EntryState {
    pub fn name(&self) -> &'static str {
        match self {
            EntryState::Enqueued => "enqueued",
            EntryState::InFlight => "in-flight",
            EntryState::Conflict { .. } => "conflict",
            EntryState::Failed => "failed",
        }
    }

    /// Waiting to be sent (possibly backing off)
    pub fn is_pending(&self) -> bool {
        matches!(self, EntryState::Enqueued | EntryState::InFlight)
    }

    /// Needs operator action before it moves again
    pub fn needs_operator(&self) -> bool {
        matches!(self, EntryState::Conflict { .. } | EntryState::Failed)
    }
}

/// One submitted session awaiting acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub session: SubmittedSession,
    #[serde(flatten)]
    pub state: EntryState,
    pub attempts: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    /// Session status as seen by the UI
    pub fn status(&self) -> SessionStatus {
        match self.state {
            EntryState::Enqueued | EntryState::InFlight => SessionStatus::Submitted,
            EntryState::Conflict { .. } => SessionStatus::Conflict,
            EntryState::Failed => SessionStatus::Failed,
        }
    }

    /// Pending and not backing off
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_pending() && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued(QueueEntry),
    /// Same session id already queued; nothing written
    AlreadyQueued(QueueEntry),
    /// Same session id already acknowledged by the server
    AlreadySynced(AuditRecord),
}

/// How the server acknowledged a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncOutcome {
    Accepted,
    Duplicate,
}

/// Trace of a synced session kept after its entry is removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub session_id: String,
    pub schema_ref: SchemaRef,
    pub outcome: SyncOutcome,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
    #[serde(default)]
    pub amends: Option<String>,
}

/// Queue figures exposed to status surfaces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Entries not yet acknowledged (pending + conflict + failed)
    pub depth: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub conflict: usize,
    pub failed: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub oldest_pending_age_secs: Option<i64>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub synced_total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CaptureSession;

    fn entry(state: EntryState, next_retry_at: Option<DateTime<Utc>>) -> QueueEntry {
        let draft = CaptureSession::new(
            SchemaRef {
                form_id: "f".into(),
                version: 1,
            },
            "dev",
        );
        let (session, _) = draft.seal(|_| true);
        QueueEntry {
            session,
            state,
            attempts: 0,
            next_retry_at,
            last_error: None,
            enqueued_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_is_flattened_into_entry() {
        let e = entry(
            EntryState::Conflict {
                reason: "unit unknown".into(),
            },
            None,
        );
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["state"], "conflict");
        assert_eq!(json["reason"], "unit unknown");

        let back: QueueEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_is_due_respects_backoff() {
        let now = Utc::now();
        assert!(entry(EntryState::Enqueued, None).is_due(now));
        assert!(!entry(EntryState::Enqueued, Some(now + chrono::Duration::seconds(5))).is_due(now));
        assert!(!entry(EntryState::Failed, None).is_due(now));
    }

    #[test]
    fn test_status_projection() {
        assert_eq!(entry(EntryState::InFlight, None).status(), SessionStatus::Submitted);
        assert_eq!(entry(EntryState::Failed, None).status(), SessionStatus::Failed);
    }
}
