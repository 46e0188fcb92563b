//! ============================================================================
//! Offline Status - Read-only projection for status and telemetry surfaces
//! ============================================================================
//! Queue figures come straight from `OfflineQueue::stats`, so what a status
//! bar shows is exactly what the queue holds. Nothing here can mutate the
//! queue.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connectivity::ConnectivityMonitor;
use crate::device::{CapabilityRegistry, CapabilityStatus};
use crate::queue::{OfflineQueue, QueueStats};
use crate::sync::{SyncReconciler, SyncReport};
use crate::types::QueueError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub online: bool,
    pub queue_depth: usize,
    pub pending: usize,
    pub failed: usize,
    pub conflict: usize,
    pub oldest_pending_age_secs: Option<i64>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_report: Option<SyncReport>,
    pub capabilities: Vec<CapabilityStatus>,
    pub observed_at: DateTime<Utc>,
}

impl OfflineStatus {
    pub fn from_parts(
        stats: QueueStats,
        online: bool,
        last_report: Option<SyncReport>,
        capabilities: Vec<CapabilityStatus>,
    ) -> Self {
        Self {
            online,
            queue_depth: stats.depth,
            pending: stats.pending,
            failed: stats.failed,
            conflict: stats.conflict,
            oldest_pending_age_secs: stats.oldest_pending_age_secs,
            last_sync_at: stats.last_sync_at,
            last_report,
            capabilities,
            observed_at: Utc::now(),
        }
    }

    pub async fn collect(
        queue: &OfflineQueue,
        reconciler: &SyncReconciler,
        connectivity: &ConnectivityMonitor,
        capabilities: &CapabilityRegistry,
    ) -> Result<Self, QueueError> {
        Ok(Self::from_parts(
            queue.stats()?,
            connectivity.is_online(),
            reconciler.last_report().await,
            capabilities.statuses().await,
        ))
    }

    /// Anything that needs an operator's attention
    pub fn needs_attention(&self) -> bool {
        self.failed > 0 || self.conflict > 0
    }
}
