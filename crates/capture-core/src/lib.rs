//! ============================================================================
//! CAPTURE-CORE: Schema-driven dashboards and offline field capture
//! ============================================================================
//! This crate handles everything below the UI layer:
//! - Dashboard and form schemas (validation, derivation, visibility graph)
//! - Data source resolution with a shared stale-while-revalidate cache
//! - Capture sessions, attachments and the durable offline queue (redb)
//! - Sync reconciliation with retry, conflict and duplicate handling
//! - Device capability collaborators and connectivity signalling
//! ============================================================================

pub mod auth;
pub mod config;
pub mod connectivity;
pub mod device;
pub mod queue;
pub mod render;
pub mod resolver;
pub mod retry;
pub mod runtime;
pub mod schema;
pub mod session;
pub mod status;
pub mod sync;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use auth::{SharedToken, StaticToken, TokenProvider};
pub use config::CoreConfig;
pub use connectivity::ConnectivityMonitor;
pub use device::{CapabilityKind, CapabilityRegistry, CapabilityStatus, CaptureOutput, DeviceCapability};
pub use queue::{OfflineQueue, SessionSink};
pub use render::{DashboardView, FormView};
pub use resolver::{DataRequest, DataSourceResolver, DataState, FetchError, ResolveMode};
pub use retry::RetryConfig;
pub use runtime::CaptureRuntime;
pub use schema::{DashboardSchema, FormSchema};
pub use session::{Attachment, CaptureSession, SessionStatus, SubmittedSession};
pub use status::OfflineStatus;
pub use sync::{SyncReconciler, SyncReport};
