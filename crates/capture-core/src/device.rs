//! ============================================================================
//! Device Capabilities - Cameras, scanners, signature pads, attached sensors
//! ============================================================================
//! Each collaborator is an opaque producer: it reports whether it is
//! reachable and, when asked, yields either an attachment blob or a
//! telemetry value. How it talks to the hardware is its own business.
//! ============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::render::FormView;
use crate::session::Attachment;
use crate::types::FormError;

/// Availability probes that take longer than this count as unavailable
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Camera,
    Scanner,
    Signature,
    Sensor,
}

/// What a capture yields
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutput {
    Blob(Attachment),
    Telemetry(Value),
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Unknown capability source: {0}")]
    UnknownSource(String),

    #[error("Capability {0} is not available")]
    Unavailable(String),

    #[error("Capture from {source_id} failed: {message}")]
    Failed { source_id: String, message: String },

    #[error(transparent)]
    Form(#[from] FormError),
}

/// One device-side producer of blobs or telemetry
#[async_trait]
pub trait DeviceCapability: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> CapabilityKind;
    async fn is_available(&self) -> bool;
    async fn capture(&self) -> Result<CaptureOutput, CapabilityError>;
}

/// Last known availability of one source
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityStatus {
    pub source_id: String,
    pub kind: CapabilityKind,
    pub available: bool,
    pub checked_at: DateTime<Utc>,
}

/// Registered collaborators keyed by source id
#[derive(Default)]
pub struct CapabilityRegistry {
    sources: RwLock<BTreeMap<String, Arc<dyn DeviceCapability>>>,
    statuses: RwLock<BTreeMap<String, CapabilityStatus>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a source
    pub async fn register(&self, capability: Arc<dyn DeviceCapability>) {
        let source_id = capability.source_id().to_string();
        info!("Registered {:?} capability {}", capability.kind(), source_id);
        self.sources.write().await.insert(source_id, capability);
    }

    pub async fn unregister(&self, source_id: &str) -> bool {
        self.statuses.write().await.remove(source_id);
        self.sources.write().await.remove(source_id).is_some()
    }

    /// Probe every source concurrently and record the results
    pub async fn probe_all(&self) -> Vec<CapabilityStatus> {
        let sources: Vec<_> = self.sources.read().await.values().cloned().collect();

        let probes = sources.iter().map(|source| async move {
            let available = tokio::time::timeout(PROBE_TIMEOUT, source.is_available())
                .await
                .unwrap_or(false);
            CapabilityStatus {
                source_id: source.source_id().to_string(),
                kind: source.kind(),
                available,
                checked_at: Utc::now(),
            }
        });
        let results = join_all(probes).await;

        let mut statuses = self.statuses.write().await;
        for status in &results {
            if !status.available {
                debug!("Capability {} unavailable", status.source_id);
            }
            statuses.insert(status.source_id.clone(), status.clone());
        }
        results
    }

    /// Last recorded statuses, without probing
    pub async fn statuses(&self) -> Vec<CapabilityStatus> {
        self.statuses.read().await.values().cloned().collect()
    }

    pub async fn capture(&self, source_id: &str) -> Result<CaptureOutput, CapabilityError> {
        let source = self
            .sources
            .read()
            .await
            .get(source_id)
            .cloned()
            .ok_or_else(|| CapabilityError::UnknownSource(source_id.to_string()))?;

        let available = source.is_available().await;
        self.record(source.as_ref(), available).await;
        if !available {
            return Err(CapabilityError::Unavailable(source_id.to_string()));
        }

        source.capture().await.map_err(|e| {
            warn!("Capture from {} failed: {}", source_id, e);
            e
        })
    }

    /// Capture from a source straight into a form field: blobs become
    /// attachments, telemetry becomes the field value
    pub async fn capture_into(
        &self,
        form: &mut FormView,
        field: &str,
        source_id: &str,
    ) -> Result<(), CapabilityError> {
        match self.capture(source_id).await? {
            CaptureOutput::Blob(attachment) => form.attach(field, attachment)?,
            CaptureOutput::Telemetry(value) => form.set_value(field, value)?,
        }
        debug!("Captured {} into field {}", source_id, field);
        Ok(())
    }

    async fn record(&self, source: &dyn DeviceCapability, available: bool) {
        self.statuses.write().await.insert(
            source.source_id().to_string(),
            CapabilityStatus {
                source_id: source.source_id().to_string(),
                kind: source.kind(),
                available,
                checked_at: Utc::now(),
            },
        );
    }
}
