// ============================================================================
// OfflineQueue - Durable FIFO of submitted sessions (redb)
// ============================================================================
// Every state change is one write transaction: the entry record, its index
// row, its blobs and (on completion) its audit row move together or not at
// all. Entries are keyed `{createdAtMillis:020}:{sessionId}` so key order is
// FIFO by capture time with ties broken by session id.
// Default path: ~/.capture/queue.redb (override via CAPTURE_QUEUE_PATH)
// ============================================================================

pub mod types;

pub use types::{AuditRecord, EnqueueOutcome, EntryState, QueueEntry, QueueStats, SyncOutcome};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::retry::{self, RetryConfig, RetryDecision};
use crate::session::{Attachment, AttachmentRef, SubmittedSession};
use crate::types::{EnqueueFailure, QueueError};

// Table definitions
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
const INDEX: TableDefinition<&str, &str> = TableDefinition::new("entry_index");
const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
const AUDIT: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

const META_DEVICE_ID: &str = "device_id";
const META_LAST_SYNC: &str = "last_sync_at";

/// Where submitted sessions go. Implemented by `OfflineQueue`; the form view
/// only needs this much of it.
pub trait SessionSink: Send + Sync {
    fn enqueue(
        &self,
        session: &SubmittedSession,
        blobs: &[Attachment],
    ) -> Result<EnqueueOutcome, EnqueueFailure>;
}

/// Durable offline queue, shared by form views (enqueue) and the reconciler
pub struct OfflineQueue {
    db: Database,
    path: PathBuf,
}

impl OfflineQueue {
    /// Open (or create) the queue database and recover entries a crash left
    /// in flight back to enqueued.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(QueueError::storage("Failed to create queue directory"))?;
        }

        info!("Opening offline queue at: {}", path.display());

        let db = Database::create(&path).map_err(QueueError::storage("Failed to open database"))?;

        let write_txn = db.begin_write().map_err(QueueError::storage("Failed to begin write"))?;
        {
            write_txn
                .open_table(ENTRIES)
                .map_err(QueueError::storage("Failed to create entries table"))?;
            write_txn
                .open_table(INDEX)
                .map_err(QueueError::storage("Failed to create index table"))?;
            write_txn
                .open_table(BLOBS)
                .map_err(QueueError::storage("Failed to create blobs table"))?;
            write_txn
                .open_table(AUDIT)
                .map_err(QueueError::storage("Failed to create audit table"))?;
            write_txn
                .open_table(META)
                .map_err(QueueError::storage("Failed to create meta table"))?;
        }
        write_txn.commit().map_err(QueueError::storage("Failed to commit init"))?;

        let queue = Self { db, path };
        queue.recover_in_flight()?;
        info!("Offline queue ready");

        Ok(queue)
    }

    /// Put every in-flight entry back to enqueued without counting an
    /// attempt. Only safe while no send is running: at open, and at the
    /// start of a drain under the drain lock.
    pub fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let write_txn = self.db.begin_write().map_err(QueueError::storage("Failed to begin write"))?;
        let recovered = {
            let mut entries = write_txn
                .open_table(ENTRIES)
                .map_err(QueueError::storage("Failed to open entries table"))?;

            let mut stuck = Vec::new();
            for item in entries.iter().map_err(QueueError::storage("Failed to iterate entries"))? {
                let (key, value) = item.map_err(QueueError::storage("Failed to read entry"))?;
                let entry: QueueEntry = decode(value.value())?;
                if entry.state == EntryState::InFlight {
                    stuck.push((key.value().to_string(), entry));
                }
            }

            let now = Utc::now();
            for (key, mut entry) in stuck.iter().cloned() {
                entry.state = EntryState::Enqueued;
                entry.updated_at = now;
                entries
                    .insert(key.as_str(), encode(&entry)?.as_slice())
                    .map_err(QueueError::storage("Failed to recover entry"))?;
            }
            stuck.len()
        };
        write_txn.commit().map_err(QueueError::storage("Failed to commit recovery"))?;

        if recovered > 0 {
            warn!("Recovered {} in-flight entries back to enqueued", recovered);
        }
        Ok(recovered)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Device id for this installation. A configured id wins; otherwise one
    /// is generated on first use and persisted.
    pub fn device_id(&self, configured: Option<&str>) -> Result<String, QueueError> {
        if let Some(id) = configured {
            return Ok(id.to_string());
        }

        let write_txn = self.db.begin_write().map_err(QueueError::storage("Failed to begin write"))?;
        let id = {
            let mut meta = write_txn
                .open_table(META)
                .map_err(QueueError::storage("Failed to open meta table"))?;
            let existing = meta
                .get(META_DEVICE_ID)
                .map_err(QueueError::storage("Failed to read device id"))?
                .map(|g| g.value().to_string());
            match existing {
                Some(id) => id,
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    meta.insert(META_DEVICE_ID, id.as_str())
                        .map_err(QueueError::storage("Failed to store device id"))?;
                    info!("Generated device id {}", id);
                    id
                }
            }
        };
        write_txn.commit().map_err(QueueError::storage("Failed to commit"))?;
        Ok(id)
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Durably append a submitted session and its blobs. Returns only after
    /// the write transaction has committed. Idempotent on session id.
    pub fn enqueue(
        &self,
        session: &SubmittedSession,
        blobs: &[Attachment],
    ) -> Result<EnqueueOutcome, EnqueueFailure> {
        self.try_enqueue(session, blobs).map_err(|e| EnqueueFailure {
            session_id: session.session_id().to_string(),
            reason: e.to_string(),
        })
    }

    fn try_enqueue(
        &self,
        session: &SubmittedSession,
        blobs: &[Attachment],
    ) -> Result<EnqueueOutcome, QueueError> {
        let session_id = session.session_id();
        let write_txn = self.db.begin_write().map_err(QueueError::storage("Failed to begin write"))?;
        let outcome = {
            let audit = write_txn
                .open_table(AUDIT)
                .map_err(QueueError::storage("Failed to open audit table"))?;
            let synced = audit
                .get(session_id)
                .map_err(QueueError::storage("Failed to read audit"))?
                .map(|g| g.value().to_vec());
            if let Some(raw) = synced {
                return Ok(EnqueueOutcome::AlreadySynced(decode(&raw)?));
            }

            let mut index = write_txn
                .open_table(INDEX)
                .map_err(QueueError::storage("Failed to open index table"))?;
            let mut entries = write_txn
                .open_table(ENTRIES)
                .map_err(QueueError::storage("Failed to open entries table"))?;

            let existing_key = index
                .get(session_id)
                .map_err(QueueError::storage("Failed to read index"))?
                .map(|g| g.value().to_string());
            if let Some(key) = existing_key {
                let raw = entries
                    .get(key.as_str())
                    .map_err(QueueError::storage("Failed to read entry"))?
                    .map(|g| g.value().to_vec())
                    .ok_or_else(|| QueueError::NotFound(session_id.to_string()))?;
                return Ok(EnqueueOutcome::AlreadyQueued(decode(&raw)?));
            }

            let now = Utc::now();
            let entry = QueueEntry {
                session: session.clone(),
                state: EntryState::Enqueued,
                attempts: 0,
                next_retry_at: None,
                last_error: None,
                enqueued_at: now,
                updated_at: now,
            };
            let key = entry_key(session);
            entries
                .insert(key.as_str(), encode(&entry)?.as_slice())
                .map_err(QueueError::storage("Failed to insert entry"))?;
            index
                .insert(session_id, key.as_str())
                .map_err(QueueError::storage("Failed to insert index"))?;

            let mut blob_table = write_txn
                .open_table(BLOBS)
                .map_err(QueueError::storage("Failed to open blobs table"))?;
            for blob in blobs {
                let blob_key = format!("{}/{}", session_id, blob.blob_id());
                blob_table
                    .insert(blob_key.as_str(), blob.bytes.as_slice())
                    .map_err(QueueError::storage("Failed to insert blob"))?;
            }

            // Inherited references of an amendment: if the prior session is
            // still queued its blobs never reached the server, so the
            // amendment takes its own copy.
            if let Some(prior_id) = session.amends() {
                let fresh: BTreeSet<String> = blobs.iter().map(Attachment::blob_id).collect();
                let mut carried = 0;
                for reference in session.attachments().values() {
                    if fresh.contains(&reference.blob_id) {
                        continue;
                    }
                    let prior_key = format!("{}/{}", prior_id, reference.blob_id);
                    let bytes = blob_table
                        .get(prior_key.as_str())
                        .map_err(QueueError::storage("Failed to read blob"))?
                        .map(|g| g.value().to_vec());
                    if let Some(bytes) = bytes {
                        let blob_key = format!("{}/{}", session_id, reference.blob_id);
                        blob_table
                            .insert(blob_key.as_str(), bytes.as_slice())
                            .map_err(QueueError::storage("Failed to insert blob"))?;
                        carried += 1;
                    }
                }
                if carried > 0 {
                    debug!("Carried {} blobs from {} into {}", carried, prior_id, session_id);
                }
            }

            EnqueueOutcome::Queued(entry)
        };
        write_txn.commit().map_err(QueueError::storage("Failed to commit enqueue"))?;

        debug!("Enqueued session {} ({} blobs)", session_id, blobs.len());
        Ok(outcome)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Every entry in FIFO order
    pub fn snapshot(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let read_txn = self.db.begin_read().map_err(QueueError::storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(ENTRIES)
            .map_err(QueueError::storage("Failed to open entries table"))?;

        let mut results = Vec::new();
        for item in table.iter().map_err(QueueError::storage("Failed to iterate entries"))? {
            let (_key, value) = item.map_err(QueueError::storage("Failed to read entry"))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Entries whose state name (`enqueued`, `in-flight`, `conflict`, `failed`) matches
    pub fn list(&self, state: Option<&str>) -> Result<Vec<QueueEntry>, QueueError> {
        let entries = self.snapshot()?;
        Ok(match state {
            Some(name) => entries.into_iter().filter(|e| e.state.name() == name).collect(),
            None => entries,
        })
    }

    pub fn get(&self, session_id: &str) -> Result<Option<QueueEntry>, QueueError> {
        let read_txn = self.db.begin_read().map_err(QueueError::storage("Failed to begin read"))?;
        let index = read_txn
            .open_table(INDEX)
            .map_err(QueueError::storage("Failed to open index table"))?;
        let Some(key) = index
            .get(session_id)
            .map_err(QueueError::storage("Failed to read index"))?
            .map(|g| g.value().to_string())
        else {
            return Ok(None);
        };

        let entries = read_txn
            .open_table(ENTRIES)
            .map_err(QueueError::storage("Failed to open entries table"))?;
        match entries
            .get(key.as_str())
            .map_err(QueueError::storage("Failed to read entry"))?
        {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Locally stored blobs for an entry. Inherited references whose bytes
    /// the server already holds have no local copy and are omitted.
    pub fn blobs(&self, entry: &QueueEntry) -> Result<Vec<(AttachmentRef, Vec<u8>)>, QueueError> {
        let read_txn = self.db.begin_read().map_err(QueueError::storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(BLOBS)
            .map_err(QueueError::storage("Failed to open blobs table"))?;

        let mut seen = BTreeSet::new();
        let mut results = Vec::new();
        for reference in entry.session.attachments().values() {
            if !seen.insert(reference.blob_id.clone()) {
                continue;
            }
            let key = format!("{}/{}", entry.session_id(), reference.blob_id);
            if let Some(value) = table
                .get(key.as_str())
                .map_err(QueueError::storage("Failed to read blob"))?
            {
                results.push((reference.clone(), value.value().to_vec()));
            }
        }
        Ok(results)
    }

    pub fn audit_record(&self, session_id: &str) -> Result<Option<AuditRecord>, QueueError> {
        let read_txn = self.db.begin_read().map_err(QueueError::storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(AUDIT)
            .map_err(QueueError::storage("Failed to open audit table"))?;
        match table
            .get(session_id)
            .map_err(QueueError::storage("Failed to read audit"))?
        {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Whether the server has acknowledged this session from this device
    pub fn was_synced(&self, session_id: &str) -> Result<bool, QueueError> {
        Ok(self.audit_record(session_id)?.is_some())
    }

    /// Audit trail, oldest sync first
    pub fn audit_log(&self) -> Result<Vec<AuditRecord>, QueueError> {
        let read_txn = self.db.begin_read().map_err(QueueError::storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(AUDIT)
            .map_err(QueueError::storage("Failed to open audit table"))?;

        let mut records: Vec<AuditRecord> = Vec::new();
        for item in table.iter().map_err(QueueError::storage("Failed to iterate audit"))? {
            let (_key, value) = item.map_err(QueueError::storage("Failed to read audit"))?;
            records.push(decode(value.value())?);
        }
        records.sort_by_key(|r| r.synced_at);
        Ok(records)
    }

    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let read_txn = self.db.begin_read().map_err(QueueError::storage("Failed to begin read"))?;
        let meta = read_txn
            .open_table(META)
            .map_err(QueueError::storage("Failed to open meta table"))?;
        let raw = meta
            .get(META_LAST_SYNC)
            .map_err(QueueError::storage("Failed to read last sync"))?
            .map(|g| g.value().to_string());
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)))
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let entries = self.snapshot()?;
        let now = Utc::now();

        let mut stats = QueueStats {
            depth: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            match &entry.state {
                EntryState::Enqueued => stats.pending += 1,
                EntryState::InFlight => {
                    stats.pending += 1;
                    stats.in_flight += 1;
                }
                EntryState::Conflict { .. } => stats.conflict += 1,
                EntryState::Failed => stats.failed += 1,
            }
        }
        stats.oldest_pending_at = entries
            .iter()
            .filter(|e| e.state.is_pending())
            .map(|e| e.enqueued_at)
            .min();
        stats.oldest_pending_age_secs = stats.oldest_pending_at.map(|at| (now - at).num_seconds());
        stats.last_sync_at = self.last_sync_at()?;

        let read_txn = self.db.begin_read().map_err(QueueError::storage("Failed to begin read"))?;
        let audit = read_txn
            .open_table(AUDIT)
            .map_err(QueueError::storage("Failed to open audit table"))?;
        stats.synced_total = audit
            .iter()
            .map_err(QueueError::storage("Failed to iterate audit"))?
            .count();

        Ok(stats)
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// enqueued -> in-flight
    pub fn mark_in_flight(&self, session_id: &str) -> Result<QueueEntry, QueueError> {
        self.update_entry(session_id, "send", |entry| {
            if entry.state != EntryState::Enqueued {
                return Err(invalid_state(entry, "send"));
            }
            entry.state = EntryState::InFlight;
            Ok(())
        })
    }

    /// in-flight -> enqueued without counting an attempt
    pub fn release(&self, session_id: &str) -> Result<QueueEntry, QueueError> {
        self.update_entry(session_id, "release", |entry| {
            if entry.state != EntryState::InFlight {
                return Err(invalid_state(entry, "release"));
            }
            entry.state = EntryState::Enqueued;
            Ok(())
        })
    }

    /// in-flight -> conflict; retained for operator review, never retried
    pub fn record_conflict(&self, session_id: &str, reason: &str) -> Result<QueueEntry, QueueError> {
        self.update_entry(session_id, "record conflict", |entry| {
            if entry.state != EntryState::InFlight {
                return Err(invalid_state(entry, "record conflict"));
            }
            entry.attempts += 1;
            entry.state = EntryState::Conflict {
                reason: reason.to_string(),
            };
            entry.next_retry_at = None;
            entry.last_error = Some(reason.to_string());
            Ok(())
        })
    }

    /// in-flight -> enqueued with backoff, or -> failed once the attempt
    /// bound is reached
    pub fn record_transient(
        &self,
        session_id: &str,
        error: &str,
        policy: &RetryConfig,
    ) -> Result<QueueEntry, QueueError> {
        let entry = self.update_entry(session_id, "record failure", |entry| {
            if entry.state != EntryState::InFlight {
                return Err(invalid_state(entry, "record failure"));
            }
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            match retry::decide(entry.attempts, policy, Utc::now()) {
                RetryDecision::RetryAt(at) => {
                    entry.state = EntryState::Enqueued;
                    entry.next_retry_at = Some(at);
                }
                RetryDecision::GiveUp => {
                    entry.state = EntryState::Failed;
                    entry.next_retry_at = None;
                }
            }
            Ok(())
        })?;

        if entry.state == EntryState::Failed {
            warn!(
                "Session {} failed after {} attempts: {}",
                session_id, entry.attempts, error
            );
        }
        Ok(entry)
    }

    /// in-flight -> synced: entry, index row and blobs removed and the audit
    /// row written in one transaction
    pub fn complete(&self, session_id: &str, outcome: SyncOutcome) -> Result<AuditRecord, QueueError> {
        let now = Utc::now();
        let write_txn = self.db.begin_write().map_err(QueueError::storage("Failed to begin write"))?;
        let record = {
            let (key, mut entry) = load_for_update(&write_txn, session_id)?;
            if entry.state != EntryState::InFlight {
                return Err(invalid_state(&entry, "complete"));
            }
            entry.attempts += 1;

            remove_entry(&write_txn, session_id, &key)?;

            let record = AuditRecord {
                session_id: session_id.to_string(),
                schema_ref: entry.session.schema_ref().clone(),
                outcome,
                attempts: entry.attempts,
                enqueued_at: entry.enqueued_at,
                synced_at: now,
                amends: entry.session.amends().map(str::to_string),
            };
            let mut audit = write_txn
                .open_table(AUDIT)
                .map_err(QueueError::storage("Failed to open audit table"))?;
            audit
                .insert(session_id, encode(&record)?.as_slice())
                .map_err(QueueError::storage("Failed to insert audit"))?;

            let mut meta = write_txn
                .open_table(META)
                .map_err(QueueError::storage("Failed to open meta table"))?;
            let stamp = now.to_rfc3339();
            meta.insert(META_LAST_SYNC, stamp.as_str())
                .map_err(QueueError::storage("Failed to store last sync"))?;

            record
        };
        write_txn.commit().map_err(QueueError::storage("Failed to commit completion"))?;

        debug!("Session {} synced ({:?})", session_id, outcome);
        Ok(record)
    }

    // ========================================================================
    // Operator actions
    // ========================================================================

    /// conflict/failed -> enqueued with a fresh attempt budget
    pub fn requeue(&self, session_id: &str) -> Result<QueueEntry, QueueError> {
        let entry = self.update_entry(session_id, "requeue", |entry| {
            if !entry.state.needs_operator() {
                return Err(invalid_state(entry, "requeue"));
            }
            entry.state = EntryState::Enqueued;
            entry.attempts = 0;
            entry.next_retry_at = None;
            Ok(())
        })?;
        info!("Requeued session {}", session_id);
        Ok(entry)
    }

    /// Drop a conflict/failed entry and its blobs. Pending entries cannot be
    /// discarded.
    pub fn discard(&self, session_id: &str) -> Result<QueueEntry, QueueError> {
        let write_txn = self.db.begin_write().map_err(QueueError::storage("Failed to begin write"))?;
        let entry = {
            let (key, entry) = load_for_update(&write_txn, session_id)?;
            if !entry.state.needs_operator() {
                return Err(invalid_state(&entry, "discard"));
            }
            remove_entry(&write_txn, session_id, &key)?;
            entry
        };
        write_txn.commit().map_err(QueueError::storage("Failed to commit discard"))?;

        warn!("Discarded session {} ({})", session_id, entry.state.name());
        Ok(entry)
    }

    /// Remove audit rows synced more than `older_than` ago. Returns how many
    /// rows were (or, with `dry_run`, would be) removed.
    pub fn prune_audit(&self, older_than: chrono::Duration, dry_run: bool) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - older_than;
        let stale: Vec<String> = self
            .audit_log()?
            .into_iter()
            .filter(|r| r.synced_at < cutoff)
            .map(|r| r.session_id)
            .collect();

        if dry_run || stale.is_empty() {
            return Ok(stale.len());
        }

        let write_txn = self.db.begin_write().map_err(QueueError::storage("Failed to begin write"))?;
        {
            let mut audit = write_txn
                .open_table(AUDIT)
                .map_err(QueueError::storage("Failed to open audit table"))?;
            for session_id in &stale {
                audit
                    .remove(session_id.as_str())
                    .map_err(QueueError::storage("Failed to remove audit"))?;
            }
        }
        write_txn.commit().map_err(QueueError::storage("Failed to commit prune"))?;

        info!("Pruned {} audit records", stale.len());
        Ok(stale.len())
    }

    fn update_entry(
        &self,
        session_id: &str,
        action: &str,
        apply: impl FnOnce(&mut QueueEntry) -> Result<(), QueueError>,
    ) -> Result<QueueEntry, QueueError> {
        let write_txn = self.db.begin_write().map_err(QueueError::storage("Failed to begin write"))?;
        let entry = {
            let (key, mut entry) = load_for_update(&write_txn, session_id)?;
            apply(&mut entry)?;
            entry.updated_at = Utc::now();

            let mut entries = write_txn
                .open_table(ENTRIES)
                .map_err(QueueError::storage("Failed to open entries table"))?;
            entries
                .insert(key.as_str(), encode(&entry)?.as_slice())
                .map_err(QueueError::storage("Failed to update entry"))?;
            entry
        };
        write_txn.commit().map_err(QueueError::storage("Failed to commit"))?;

        debug!("Session {}: {} -> {}", session_id, action, entry.state.name());
        Ok(entry)
    }
}

impl SessionSink for OfflineQueue {
    fn enqueue(
        &self,
        session: &SubmittedSession,
        blobs: &[Attachment],
    ) -> Result<EnqueueOutcome, EnqueueFailure> {
        OfflineQueue::enqueue(self, session, blobs)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn entry_key(session: &SubmittedSession) -> String {
    let millis = session.created_at().timestamp_millis().max(0);
    format!("{:020}:{}", millis, session.session_id())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(value).map_err(|e| QueueError::Encoding(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, QueueError> {
    serde_json::from_slice(bytes).map_err(|e| QueueError::Encoding(e.to_string()))
}

fn invalid_state(entry: &QueueEntry, action: &str) -> QueueError {
    QueueError::InvalidState {
        session_id: entry.session_id().to_string(),
        state: entry.state.name().to_string(),
        action: action.to_string(),
    }
}

fn load_for_update(
    write_txn: &redb::WriteTransaction,
    session_id: &str,
) -> Result<(String, QueueEntry), QueueError> {
    let index = write_txn
        .open_table(INDEX)
        .map_err(QueueError::storage("Failed to open index table"))?;
    let key = index
        .get(session_id)
        .map_err(QueueError::storage("Failed to read index"))?
        .map(|g| g.value().to_string())
        .ok_or_else(|| QueueError::NotFound(session_id.to_string()))?;

    let entries = write_txn
        .open_table(ENTRIES)
        .map_err(QueueError::storage("Failed to open entries table"))?;
    let raw = entries
        .get(key.as_str())
        .map_err(QueueError::storage("Failed to read entry"))?
        .map(|g| g.value().to_vec())
        .ok_or_else(|| QueueError::NotFound(session_id.to_string()))?;

    Ok((key, decode(&raw)?))
}

fn remove_entry(
    write_txn: &redb::WriteTransaction,
    session_id: &str,
    key: &str,
) -> Result<(), QueueError> {
    let mut entries = write_txn
        .open_table(ENTRIES)
        .map_err(QueueError::storage("Failed to open entries table"))?;
    entries
        .remove(key)
        .map_err(QueueError::storage("Failed to remove entry"))?;

    let mut index = write_txn
        .open_table(INDEX)
        .map_err(QueueError::storage("Failed to open index table"))?;
    index
        .remove(session_id)
        .map_err(QueueError::storage("Failed to remove index"))?;

    let mut blobs = write_txn
        .open_table(BLOBS)
        .map_err(QueueError::storage("Failed to open blobs table"))?;
    remove_blobs(&mut blobs, session_id)
}

fn remove_blobs(
    blobs: &mut Table<'_, &'static str, &'static [u8]>,
    session_id: &str,
) -> Result<(), QueueError> {
    let prefix = format!("{}/", session_id);
    let mut keys = Vec::new();
    for item in blobs
        .range::<&str>(prefix.as_str()..)
        .map_err(QueueError::storage("Failed to iterate blobs"))?
    {
        let (key, _) = item.map_err(QueueError::storage("Failed to read blob"))?;
        if !key.value().starts_with(&prefix) {
            break;
        }
        keys.push(key.value().to_string());
    }

    for key in &keys {
        blobs
            .remove(key.as_str())
            .map_err(QueueError::storage("Failed to remove blob"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CaptureSession;
    use crate::types::SchemaRef;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, OfflineQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::open(dir.path().join("queue.redb")).unwrap();
        (dir, queue)
    }

    fn submitted(unit: &str) -> (SubmittedSession, Vec<Attachment>) {
        let mut draft = CaptureSession::new(
            SchemaRef {
                form_id: "pcr".into(),
                version: 1,
            },
            "dev-1",
        );
        draft.set_value("unit", json!(unit));
        draft.attach("sig", Attachment::new("image/png", unit.as_bytes().to_vec()));
        // distinct createdAt millis keep FIFO keys strictly ordered
        std::thread::sleep(std::time::Duration::from_millis(2));
        draft.seal(|_| true)
    }

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: false,
        }
    }

    #[test]
    fn test_enqueue_is_fifo_and_idempotent() {
        let (_dir, queue) = open_temp();
        let (s1, b1) = submitted("M1");
        let (s2, b2) = submitted("M2");

        // enqueue out of order; capture time decides position
        assert!(matches!(queue.enqueue(&s2, &b2).unwrap(), EnqueueOutcome::Queued(_)));
        assert!(matches!(queue.enqueue(&s1, &b1).unwrap(), EnqueueOutcome::Queued(_)));
        assert!(matches!(
            queue.enqueue(&s1, &b1).unwrap(),
            EnqueueOutcome::AlreadyQueued(_)
        ));

        let ids: Vec<_> = queue.snapshot().unwrap().iter().map(|e| e.session_id().to_string()).collect();
        assert_eq!(ids, vec![s1.session_id().to_string(), s2.session_id().to_string()]);
    }

    #[test]
    fn test_enqueue_survives_restart_and_recovers_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.redb");
        let (session, blobs) = submitted("M1");

        {
            let queue = OfflineQueue::open(&path).unwrap();
            queue.enqueue(&session, &blobs).unwrap();
            queue.mark_in_flight(session.session_id()).unwrap();
        }

        let queue = OfflineQueue::open(&path).unwrap();
        let entry = queue.get(session.session_id()).unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Enqueued);
        assert_eq!(entry.session, session);
        assert_eq!(queue.blobs(&entry).unwrap().len(), 1);
    }

    #[test]
    fn test_complete_removes_entry_and_writes_audit() {
        let (_dir, queue) = open_temp();
        let (session, blobs) = submitted("M1");
        let id = session.session_id();
        queue.enqueue(&session, &blobs).unwrap();
        queue.mark_in_flight(id).unwrap();

        let record = queue.complete(id, SyncOutcome::Accepted).unwrap();
        assert_eq!(record.attempts, 1);
        assert!(queue.get(id).unwrap().is_none());
        assert!(queue.was_synced(id).unwrap());
        assert!(queue.last_sync_at().unwrap().is_some());

        // a resubmitted copy of a synced session is not queued again
        assert!(matches!(
            queue.enqueue(&session, &blobs).unwrap(),
            EnqueueOutcome::AlreadySynced(_)
        ));
        assert_eq!(queue.stats().unwrap().depth, 0);
    }

    #[test]
    fn test_transient_backoff_then_failed_after_bound() {
        let (_dir, queue) = open_temp();
        let (session, blobs) = submitted("M1");
        let id = session.session_id();
        queue.enqueue(&session, &blobs).unwrap();

        queue.mark_in_flight(id).unwrap();
        let entry = queue.record_transient(id, "timeout", &no_jitter()).unwrap();
        assert_eq!(entry.state, EntryState::Enqueued);
        assert!(entry.next_retry_at.is_some());
        assert!(!entry.is_due(Utc::now()));

        queue.mark_in_flight(id).unwrap();
        let entry = queue.record_transient(id, "timeout", &no_jitter()).unwrap();
        assert_eq!(entry.state, EntryState::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));

        let stats = queue.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.depth, 1);
    }

    #[test]
    fn test_conflict_requeue_and_discard() {
        let (_dir, queue) = open_temp();
        let (session, blobs) = submitted("M1");
        let id = session.session_id();
        queue.enqueue(&session, &blobs).unwrap();

        assert!(matches!(queue.discard(id), Err(QueueError::InvalidState { .. })));

        queue.mark_in_flight(id).unwrap();
        let entry = queue.record_conflict(id, "unknown unit").unwrap();
        assert_eq!(
            entry.state,
            EntryState::Conflict {
                reason: "unknown unit".into()
            }
        );
        assert_eq!(queue.stats().unwrap().conflict, 1);

        let entry = queue.requeue(id).unwrap();
        assert_eq!(entry.state, EntryState::Enqueued);
        assert_eq!(entry.attempts, 0);

        queue.mark_in_flight(id).unwrap();
        queue.record_conflict(id, "still unknown").unwrap();
        queue.discard(id).unwrap();
        assert!(queue.get(id).unwrap().is_none());
        assert!(!queue.was_synced(id).unwrap());
    }

    #[test]
    fn test_release_does_not_count_attempt() {
        let (_dir, queue) = open_temp();
        let (session, blobs) = submitted("M1");
        let id = session.session_id();
        queue.enqueue(&session, &blobs).unwrap();
        queue.mark_in_flight(id).unwrap();

        let entry = queue.release(id).unwrap();
        assert_eq!(entry.state, EntryState::Enqueued);
        assert_eq!(entry.attempts, 0);
    }

    #[test]
    fn test_amendment_keeps_blobs_of_unsent_prior() {
        let (_dir, queue) = open_temp();
        let (prior, blobs) = submitted("M1");
        queue.enqueue(&prior, &blobs).unwrap();
        queue.mark_in_flight(prior.session_id()).unwrap();
        queue.record_conflict(prior.session_id(), "blob upload rejected").unwrap();

        let (amendment, fresh) = prior.amend().seal(|_| true);
        assert!(fresh.is_empty());
        queue.enqueue(&amendment, &fresh).unwrap();

        // the prior copy goes away with the discarded entry
        queue.discard(prior.session_id()).unwrap();

        let entry = queue.get(amendment.session_id()).unwrap().unwrap();
        let carried = queue.blobs(&entry).unwrap();
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].1, b"M1".to_vec());
    }

    #[test]
    fn test_amendment_of_synced_prior_has_no_local_blobs() {
        let (_dir, queue) = open_temp();
        let (prior, blobs) = submitted("M1");
        queue.enqueue(&prior, &blobs).unwrap();
        queue.mark_in_flight(prior.session_id()).unwrap();
        queue.complete(prior.session_id(), SyncOutcome::Accepted).unwrap();

        let (amendment, fresh) = prior.amend().seal(|_| true);
        queue.enqueue(&amendment, &fresh).unwrap();
        let entry = queue.get(amendment.session_id()).unwrap().unwrap();
        assert!(queue.blobs(&entry).unwrap().is_empty());
    }

    #[test]
    fn test_recover_in_flight_without_reopen() {
        let (_dir, queue) = open_temp();
        let (session, blobs) = submitted("M1");
        let id = session.session_id();
        queue.enqueue(&session, &blobs).unwrap();
        queue.mark_in_flight(id).unwrap();

        assert_eq!(queue.recover_in_flight().unwrap(), 1);
        let entry = queue.get(id).unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Enqueued);
        assert_eq!(entry.attempts, 0);
        assert_eq!(queue.recover_in_flight().unwrap(), 0);
    }

    #[test]
    fn test_device_id_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.redb");

        let first = OfflineQueue::open(&path).unwrap().device_id(None).unwrap();
        let second = OfflineQueue::open(&path).unwrap().device_id(None).unwrap();
        assert_eq!(first, second);

        let configured = OfflineQueue::open(&path).unwrap().device_id(Some("tablet-7")).unwrap();
        assert_eq!(configured, "tablet-7");
    }

    #[test]
    fn test_prune_audit() {
        let (_dir, queue) = open_temp();
        let (session, blobs) = submitted("M1");
        let id = session.session_id();
        queue.enqueue(&session, &blobs).unwrap();
        queue.mark_in_flight(id).unwrap();
        queue.complete(id, SyncOutcome::Duplicate).unwrap();

        assert_eq!(queue.prune_audit(chrono::Duration::days(1), false).unwrap(), 0);
        assert_eq!(queue.prune_audit(chrono::Duration::seconds(-1), true).unwrap(), 1);
        assert!(queue.was_synced(id).unwrap());
        assert_eq!(queue.prune_audit(chrono::Duration::seconds(-1), false).unwrap(), 1);
        assert!(!queue.was_synced(id).unwrap());
    }
}
