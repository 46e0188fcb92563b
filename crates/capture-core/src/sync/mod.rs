//! ============================================================================
//! Sync Reconciler - Drains the offline queue to the submission endpoint
//! ============================================================================
//! One drain cycle walks a snapshot of the queue taken at cycle start, in
//! FIFO order:
//! - accepted / duplicate -> synced (entry removed, audit row kept)
//! - rejected -> conflict with the server's reason, never retried
//! - timeout, transport or server error -> backoff, and the cycle stops so
//!   no later entry overtakes this one
//! - entry still backing off -> the cycle stops
//! - conflict / failed entries -> skipped until an operator acts
//! - no token -> the cycle stops without consuming an attempt
//!
//! At most one drain runs at a time. Enqueue runs concurrently; anything
//! enqueued mid-cycle is picked up by the next cycle.
//! ============================================================================

mod submitter;

pub use submitter::{classify_response, HttpSubmitter, SubmitError, SubmitOutcome, Submitter};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::queue::{EntryState, OfflineQueue, QueueEntry, SyncOutcome};
use crate::retry::RetryConfig;
use crate::types::QueueError;

/// Why a drain cycle stopped before the end of its snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum HaltReason {
    #[serde(rename_all = "camelCase")]
    Transient { session_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    Backoff {
        session_id: String,
        retry_at: Option<DateTime<Utc>>,
    },
    Unauthorized,
}

/// Result of one drain cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub synced: usize,
    pub duplicates: usize,
    pub conflict: usize,
    pub failed: usize,
    pub skipped: usize,
    pub still_pending: usize,
    pub halted: Option<HaltReason>,
}

impl SyncReport {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            synced: 0,
            duplicates: 0,
            conflict: 0,
            failed: 0,
            skipped: 0,
            still_pending: 0,
            halted: None,
        }
    }
}

/// Process-scoped reconciler over the shared queue
pub struct SyncReconciler {
    queue: Arc<OfflineQueue>,
    submitter: Arc<dyn Submitter>,
    retry: RetryConfig,
    submit_timeout: Duration,
    drain_lock: Mutex<()>,
    last_report: RwLock<Option<SyncReport>>,
}

impl SyncReconciler {
    pub fn new(
        queue: Arc<OfflineQueue>,
        submitter: Arc<dyn Submitter>,
        retry: RetryConfig,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            submitter,
            retry,
            submit_timeout,
            drain_lock: Mutex::new(()),
            last_report: RwLock::new(None),
        }
    }

    pub fn from_config(queue: Arc<OfflineQueue>, submitter: Arc<dyn Submitter>, config: &CoreConfig) -> Self {
        Self::new(queue, submitter, config.retry.clone(), config.submit_timeout)
    }

    pub async fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().await.clone()
    }

    /// Run one drain cycle
    pub async fn drain(&self) -> Result<SyncReport, QueueError> {
        let _guard = self.drain_lock.lock().await;

        let mut report = SyncReport::start();
        // Nothing is sending while we hold the lock, so any in-flight entry
        // belongs to a cycle that was dropped mid-submit.
        self.queue.recover_in_flight()?;
        let entries = self.queue.snapshot()?;
        debug!("Drain cycle over {} entries", entries.len());

        for entry in entries {
            if entry.state.needs_operator() {
                report.skipped += 1;
                continue;
            }

            let now = Utc::now();
            if !entry.is_due(now) {
                report.halted = Some(HaltReason::Backoff {
                    session_id: entry.session_id().to_string(),
                    retry_at: entry.next_retry_at,
                });
                break;
            }

            if let Some(halt) = self.process(&entry, &mut report).await? {
                report.halted = Some(halt);
                break;
            }
        }

        report.still_pending = self.queue.stats()?.pending;
        report.finished_at = Utc::now();

        match &report.halted {
            Some(halt) => info!(
                "Drain halted: synced={} conflict={} failed={} pending={} ({:?})",
                report.synced, report.conflict, report.failed, report.still_pending, halt
            ),
            None => info!(
                "Drain complete: synced={} conflict={} failed={} pending={}",
                report.synced, report.conflict, report.failed, report.still_pending
            ),
        }

        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    /// Send one entry. Returns a halt reason when the cycle must stop here.
    async fn process(
        &self,
        entry: &QueueEntry,
        report: &mut SyncReport,
    ) -> Result<Option<HaltReason>, QueueError> {
        let session_id = entry.session_id();
        self.queue.mark_in_flight(session_id)?;
        let mut in_flight = InFlightGuard::new(self.queue.as_ref(), session_id);

        let blobs = self.queue.blobs(entry)?;
        let result = match tokio::time::timeout(
            self.submit_timeout,
            self.submitter.submit(&entry.session, &blobs),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Timeout {
                after_ms: self.submit_timeout.as_millis() as u64,
            }),
        };

        let transient = match result {
            Ok(SubmitOutcome::Accepted) => {
                self.queue.complete(session_id, SyncOutcome::Accepted)?;
                in_flight.disarm();
                report.synced += 1;
                return Ok(None);
            }
            Ok(SubmitOutcome::Duplicate) => {
                self.queue.complete(session_id, SyncOutcome::Duplicate)?;
                in_flight.disarm();
                report.synced += 1;
                report.duplicates += 1;
                return Ok(None);
            }
            Ok(SubmitOutcome::Rejected { reason }) => {
                warn!("Session {} rejected: {}", session_id, reason);
                self.queue.record_conflict(session_id, &reason)?;
                in_flight.disarm();
                report.conflict += 1;
                return Ok(None);
            }
            Err(SubmitError::Unauthorized) => {
                warn!("No credentials, releasing session {}", session_id);
                in_flight.disarm();
                self.queue.release(session_id)?;
                return Ok(Some(HaltReason::Unauthorized));
            }
            Ok(SubmitOutcome::ServerError { status, message }) => {
                format!("server error {}: {}", status, message)
            }
            Err(err) => err.to_string(),
        };

        let updated = self.queue.record_transient(session_id, &transient, &self.retry)?;
        in_flight.disarm();
        if updated.state == EntryState::Failed {
            // out of attempts: held for an operator, later entries proceed
            report.failed += 1;
            return Ok(None);
        }

        debug!(
            "Session {} attempt {} failed: {}",
            session_id, updated.attempts, transient
        );
        Ok(Some(HaltReason::Transient {
            session_id: session_id.to_string(),
            error: transient,
        }))
    }

    /// Drain on a timer and whenever connectivity comes back, until
    /// cancelled. A drain in progress always runs to completion.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut online: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        info!("Sync loop started (every {:?})", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut was_online = *online.borrow();
        let mut watching = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    if *online.borrow() {
                        self.drain_logged().await;
                    }
                }
                changed = online.changed(), if watching => {
                    if changed.is_err() {
                        warn!("Connectivity monitor dropped, continuing on timer only");
                        watching = false;
                        continue;
                    }
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online {
                        info!("Connectivity restored, draining");
                        self.drain_logged().await;
                    }
                    was_online = now_online;
                }
            }
        }

        info!("Sync loop stopped");
    }

    async fn drain_logged(&self) {
        if let Err(e) = self.drain().await {
            error!("Drain cycle failed: {}", e);
        }
    }
}

/// Puts an entry back to enqueued, without counting an attempt, unless the
/// send reached a recorded outcome. Covers the drain future being dropped
/// mid-submit and queue errors between marking and recording.
struct InFlightGuard<'a> {
    queue: &'a OfflineQueue,
    session_id: &'a str,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(queue: &'a OfflineQueue, session_id: &'a str) -> Self {
        Self {
            queue,
            session_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.queue.release(self.session_id) {
            Ok(_) => debug!("Released session {}", self.session_id),
            Err(e) => warn!("Failed to release session {}: {}", self.session_id, e),
        }
    }
}
