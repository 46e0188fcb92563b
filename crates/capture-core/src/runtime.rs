//! ============================================================================
//! Capture Runtime - Process-scoped owner of the shared components
//! ============================================================================
//! Init opens the queue (recovering interrupted sends) and wires resolver,
//! reconciler, connectivity and device registry. Views receive what they
//! need by reference. Shutdown stops the sync loop and waits for a drain in
//! progress so its queue writes complete.
//! ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::TokenProvider;
use crate::config::CoreConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::device::CapabilityRegistry;
use crate::queue::OfflineQueue;
use crate::render::{DashboardView, FormView};
use crate::resolver::{DataBackend, DataSourceResolver, HttpBackend};
use crate::schema::{DashboardSchema, FormSchema};
use crate::session::SubmittedSession;
use crate::status::OfflineStatus;
use crate::sync::{HttpSubmitter, Submitter, SyncReconciler, SyncReport};
use crate::types::{Bindings, FormSubmitError, QueueError, SchemaValidationError};

/// How long shutdown waits for the sync loop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CaptureRuntime {
    config: CoreConfig,
    device_id: String,
    queue: Arc<OfflineQueue>,
    resolver: Arc<DataSourceResolver>,
    reconciler: Arc<SyncReconciler>,
    connectivity: Arc<ConnectivityMonitor>,
    capabilities: Arc<CapabilityRegistry>,
    cancel: CancellationToken,
    sync_task: Option<JoinHandle<()>>,
}

impl CaptureRuntime {
    /// Open the queue at the configured path and talk HTTP to the backend
    pub fn init(config: CoreConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self, QueueError> {
        let queue = Arc::new(OfflineQueue::open(config.resolve_queue_path()?)?);
        let backend = Arc::new(HttpBackend::new(config.api_base_url.clone(), tokens.clone()));
        let submitter = Arc::new(HttpSubmitter::new(
            config.api_base_url.clone(),
            tokens,
            config.submit_timeout,
        ));
        Self::with_collaborators(config, queue, backend, submitter)
    }

    pub fn with_collaborators(
        config: CoreConfig,
        queue: Arc<OfflineQueue>,
        backend: Arc<dyn DataBackend>,
        submitter: Arc<dyn Submitter>,
    ) -> Result<Self, QueueError> {
        let device_id = queue.device_id(config.device_id.as_deref())?;
        let resolver = Arc::new(DataSourceResolver::from_config(backend, &config));
        let reconciler = Arc::new(SyncReconciler::from_config(queue.clone(), submitter, &config));

        info!("Capture runtime ready (device {})", device_id);

        Ok(Self {
            config,
            device_id,
            queue,
            resolver,
            reconciler,
            connectivity: Arc::new(ConnectivityMonitor::new(true)),
            capabilities: Arc::new(CapabilityRegistry::new()),
            cancel: CancellationToken::new(),
            sync_task: None,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn resolver(&self) -> &Arc<DataSourceResolver> {
        &self.resolver
    }

    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// Start the background sync loop (no-op if already running)
    pub fn start(&mut self) {
        if self.sync_task.is_some() {
            warn!("Sync loop already running");
            return;
        }
        let reconciler = self.reconciler.clone();
        self.sync_task = Some(tokio::spawn(reconciler.run(
            self.config.drain_interval,
            self.connectivity.subscribe(),
            self.cancel.clone(),
        )));
    }

    pub fn is_running(&self) -> bool {
        self.sync_task.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the sync loop, close open views and wait for queue writes
    pub async fn shutdown(mut self) {
        info!("Shutting down capture runtime");
        self.cancel.cancel();

        if let Some(handle) = self.sync_task.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => info!("Sync loop stopped cleanly"),
                Ok(Err(e)) => warn!("Sync loop task failed: {}", e),
                Err(_) => warn!("Sync loop did not stop within timeout"),
            }
        }
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn open_form(&self, schema: FormSchema) -> Result<FormView, SchemaValidationError> {
        FormView::open(schema, &self.device_id)
    }

    pub fn amend_form(
        &self,
        schema: FormSchema,
        prior: &SubmittedSession,
    ) -> Result<FormView, SchemaValidationError> {
        FormView::amend(schema, prior)
    }

    /// Submit a form into this runtime's queue
    pub fn submit(&self, form: &mut FormView) -> Result<SubmittedSession, FormSubmitError> {
        form.submit(self.queue.as_ref())
    }

    /// Render a dashboard; shutdown closes it
    pub async fn render_dashboard(
        &self,
        schema: DashboardSchema,
        bindings: Bindings,
    ) -> Result<DashboardView, SchemaValidationError> {
        DashboardView::render_with_cancel(
            schema,
            bindings,
            self.resolver.clone(),
            self.cancel.child_token(),
        )
        .await
    }

    // ========================================================================
    // Sync and status
    // ========================================================================

    /// Drain now, outside the timer
    pub async fn sync_now(&self) -> Result<SyncReport, QueueError> {
        self.reconciler.drain().await
    }

    pub async fn status(&self) -> Result<OfflineStatus, QueueError> {
        OfflineStatus::collect(
            &self.queue,
            &self.reconciler,
            &self.connectivity,
            &self.capabilities,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::PanelData;
    use crate::resolver::test_support::MockBackend;
    use crate::schema::{FieldKind, FieldSpec, WidgetKind, WidgetSpec};
    use crate::session::AttachmentRef;
    use crate::sync::{SubmitError, SubmitOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct AcceptAll {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Submitter for AcceptAll {
        async fn submit(
            &self,
            _session: &SubmittedSession,
            _blobs: &[(AttachmentRef, Vec<u8>)],
        ) -> Result<SubmitOutcome, SubmitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SubmitOutcome::Accepted)
        }
    }

    fn runtime(dir: &tempfile::TempDir, submitter: Arc<AcceptAll>) -> CaptureRuntime {
        let config = CoreConfig {
            device_id: Some("tablet-3".into()),
            ..Default::default()
        };
        let queue = Arc::new(OfflineQueue::open(dir.path().join("q.redb")).unwrap());
        CaptureRuntime::with_collaborators(
            config,
            queue,
            Arc::new(MockBackend::new(Duration::ZERO)),
            submitter,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_capture_submit_sync_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = Arc::new(AcceptAll::default());
        let runtime = runtime(&dir, submitter.clone());

        let schema = FormSchema::new("pcr", vec![FieldSpec::new("unit", FieldKind::Text).required()]);
        let mut form = runtime.open_form(schema).unwrap();
        assert_eq!(form.session().device_id(), "tablet-3");
        form.set_value("unit", json!("M1")).unwrap();
        runtime.submit(&mut form).unwrap();

        let status = runtime.status().await.unwrap();
        assert_eq!(status.queue_depth, 1);
        assert!(status.oldest_pending_age_secs.is_some());

        let report = runtime.sync_now().await.unwrap();
        assert_eq!(report.synced, 1);

        let status = runtime.status().await.unwrap();
        assert_eq!(status.queue_depth, 0);
        assert!(status.last_sync_at.is_some());
        assert_eq!(status.last_report, Some(report));
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop_and_closes_views() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = runtime(&dir, Arc::new(AcceptAll::default()));
        runtime.start();
        assert!(runtime.is_running());

        let schema = DashboardSchema::new("ops", vec![WidgetSpec::new("calls", WidgetKind::Stat, "/calls")]);
        let mut view = runtime.render_dashboard(schema, Bindings::new()).await.unwrap();
        assert!(matches!(view.panel("calls").unwrap().data, PanelData::Ready { .. }));

        runtime.shutdown().await;
        assert!(view.is_closed());
        view.refresh_all().await;
        assert_eq!(view.panel("calls").unwrap().data, PanelData::Cancelled);
    }
}
