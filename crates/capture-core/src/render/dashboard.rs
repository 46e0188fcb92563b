//! ============================================================================
//! Dashboard View - One independently refreshing panel per widget
//! ============================================================================
//! Rendering validates the schema, binds parameters into each widget's data
//! source and resolves every widget concurrently. A widget that cannot get
//! data degrades to its own `Unavailable` panel; the view always renders.
//! ============================================================================

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::resolver::{DataRequest, DataSourceResolver, DataState, ResolveMode};
use crate::schema::{DashboardSchema, WidgetSpec};
use crate::types::{Bindings, SchemaValidationError};

/// Panel content state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PanelData {
    Loading,
    #[serde(rename_all = "camelCase")]
    Ready {
        value: Value,
        fetched_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Stale {
        value: Value,
        fetched_at: DateTime<Utc>,
        reason: String,
    },
    Unavailable { reason: String },
    Cancelled,
}

impl From<DataState> for PanelData {
    fn from(state: DataState) -> Self {
        match state {
            DataState::Fresh { value, fetched_at } => PanelData::Ready { value, fetched_at },
            DataState::Stale {
                value,
                fetched_at,
                reason,
            } => PanelData::Stale {
                value,
                fetched_at,
                reason,
            },
            DataState::Unavailable { reason } => PanelData::Unavailable { reason },
            DataState::Cancelled => PanelData::Cancelled,
        }
    }
}

/// Rendered widget
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Panel {
    pub widget: WidgetSpec,
    /// None when the data source could not be bound
    pub request: Option<DataRequest>,
    pub data: PanelData,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Live dashboard bound to a parameter set
pub struct DashboardView {
    schema: DashboardSchema,
    bindings: Bindings,
    resolver: Arc<DataSourceResolver>,
    panels: Vec<Panel>,
    cancel: CancellationToken,
}

impl DashboardView {
    pub async fn render(
        schema: DashboardSchema,
        bindings: Bindings,
        resolver: Arc<DataSourceResolver>,
    ) -> Result<Self, SchemaValidationError> {
        Self::render_with_cancel(schema, bindings, resolver, CancellationToken::new()).await
    }

    /// Render with a caller-held token, so the view can be closed from
    /// elsewhere while its first resolution is still running
    pub async fn render_with_cancel(
        schema: DashboardSchema,
        bindings: Bindings,
        resolver: Arc<DataSourceResolver>,
        cancel: CancellationToken,
    ) -> Result<Self, SchemaValidationError> {
        schema.validate()?;

        let panels = schema
            .widgets
            .iter()
            .map(|widget| match DataRequest::for_widget(&widget.data_source, &bindings) {
                Ok(request) => Panel {
                    widget: widget.clone(),
                    request: Some(request),
                    data: PanelData::Loading,
                    resolved_at: None,
                },
                Err(e) => Panel {
                    widget: widget.clone(),
                    request: None,
                    data: PanelData::Unavailable {
                        reason: e.to_string(),
                    },
                    resolved_at: Some(Utc::now()),
                },
            })
            .collect();

        let mut view = Self {
            schema,
            bindings,
            resolver,
            panels,
            cancel,
        };

        info!(
            "Rendering dashboard '{}' ({} widgets)",
            view.schema.title,
            view.panels.len()
        );
        view.resolve_all(ResolveMode::Cached).await;
        Ok(view)
    }

    pub fn title(&self) -> &str {
        &self.schema.title
    }

    pub fn description(&self) -> &str {
        &self.schema.description
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn panels(&self) -> &[Panel] {
        &self.panels
    }

    pub fn panel(&self, widget_id: &str) -> Option<&Panel> {
        self.panels.iter().find(|p| p.widget.id == widget_id)
    }

    /// Re-resolve every widget once, ignoring the freshness window
    pub async fn refresh_all(&mut self) {
        debug!("Refreshing all widgets of '{}'", self.schema.title);
        self.resolve_all(ResolveMode::Fresh).await;
    }

    /// Re-resolve one widget, ignoring the freshness window
    pub async fn refresh_widget(&mut self, widget_id: &str) -> Option<&Panel> {
        let idx = self.panels.iter().position(|p| p.widget.id == widget_id)?;
        if let Some(request) = self.panels[idx].request.clone() {
            self.panels[idx].data = PanelData::Loading;
            let state = self
                .resolver
                .resolve(&request, ResolveMode::Fresh, &self.cancel)
                .await;
            let panel = &mut self.panels[idx];
            panel.data = state.into();
            panel.resolved_at = Some(Utc::now());
        }
        Some(&self.panels[idx])
    }

    /// Cancel this view's in-flight fetches. Other views and the shared
    /// cache are unaffected.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Closing dashboard '{}'", self.schema.title);
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that closes this view when cancelled
    pub fn close_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn resolve_all(&mut self, mode: ResolveMode) {
        let resolver = self.resolver.as_ref();
        let cancel = &self.cancel;

        let pending = self.panels.iter().map(|panel| {
            let request = panel.request.clone();
            async move {
                match request {
                    Some(request) => Some(resolver.resolve(&request, mode, cancel).await),
                    None => None,
                }
            }
        });
        let results = join_all(pending).await;

        let now = Utc::now();
        for (panel, result) in self.panels.iter_mut().zip(results) {
            if let Some(state) = result {
                panel.data = state.into();
                panel.resolved_at = Some(now);
            }
        }
    }
}

impl Drop for DashboardView {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
