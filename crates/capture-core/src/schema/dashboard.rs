//! ============================================================================
//! Dashboard Schema - Widgets, validation, derivation from templates
//! ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::types::SchemaValidationError;

/// Widget type tags accepted in schema JSON
pub const WIDGET_TYPES: &[&str] = &["stat", "table", "chart", "list", "map", "gauge"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetKind {
    #[default]
    Stat,
    Table,
    Chart,
    List,
    Map,
    Gauge,
}

/// Layout hint only; has no behavioral effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub w: u16,
    pub h: u16,
}

impl Default for GridSize {
    fn default() -> Self {
        Self { w: 1, h: 1 }
    }
}

/// One independently refreshable dashboard panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSpec {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: WidgetKind,
    #[serde(default)]
    pub title: String,
    /// Resolver key; may embed `{param}` placeholders filled from bindings
    pub data_source: String,
    #[serde(default)]
    pub grid_size: GridSize,
}

impl WidgetSpec {
    pub fn new(id: impl Into<String>, kind: WidgetKind, data_source: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            kind,
            data_source: data_source.into(),
            grid_size: GridSize::default(),
        }
    }
}

/// Ordered widgets plus title/description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSchema {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub widgets: Vec<WidgetSpec>,
}

/// Widgets to insert after an anchor widget (or at the end)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSplice {
    #[serde(default)]
    pub after: Option<String>,
    pub widgets: Vec<WidgetSpec>,
}

/// Named overrides applied when deriving a variant from a template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaOverrides {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub splices: Vec<WidgetSplice>,
}

impl DashboardSchema {
    pub fn new(title: impl Into<String>, widgets: Vec<WidgetSpec>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            widgets,
        }
    }

    /// Parse schema JSON. Unknown widget types are rejected here, naming the
    /// offending widget.
    pub fn from_json(json: &str) -> Result<Self, SchemaValidationError> {
        let raw: Value = serde_json::from_str(json)
            .map_err(|e| SchemaValidationError::Malformed(e.to_string()))?;

        if let Some(widgets) = raw.get("widgets").and_then(Value::as_array) {
            for widget in widgets {
                if let Some(type_name) = widget.get("type").and_then(Value::as_str) {
                    if !WIDGET_TYPES.contains(&type_name) {
                        return Err(SchemaValidationError::UnknownType {
                            element: "widget".to_string(),
                            id: widget
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or("<missing id>")
                                .to_string(),
                            type_name: type_name.to_string(),
                        });
                    }
                }
            }
        }

        let schema: DashboardSchema = serde_json::from_value(raw)
            .map_err(|e| SchemaValidationError::Malformed(e.to_string()))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Pre-render validation: unique non-empty ids, non-empty data sources
    pub fn validate(&self) -> Result<(), SchemaValidationError> {
        let mut seen = HashSet::new();
        for widget in &self.widgets {
            if widget.id.trim().is_empty() {
                return Err(SchemaValidationError::InvalidId(widget.id.clone()));
            }
            if !seen.insert(widget.id.as_str()) {
                return Err(SchemaValidationError::DuplicateId(widget.id.clone()));
            }
            if widget.data_source.trim().is_empty() {
                return Err(SchemaValidationError::EmptyDataSource(widget.id.clone()));
            }
        }
        Ok(())
    }

    pub fn widget(&self, id: &str) -> Option<&WidgetSpec> {
        self.widgets.iter().find(|w| w.id == id)
    }

    /// Derive a variant from this template. The base is never mutated and the
    /// result is re-validated, so a splice that collides on id fails here.
    pub fn derive(&self, overrides: SchemaOverrides) -> Result<DashboardSchema, SchemaValidationError> {
        let mut derived = self.clone();

        if let Some(title) = overrides.title {
            derived.title = title;
        }
        if let Some(description) = overrides.description {
            derived.description = description;
        }

        for splice in overrides.splices {
            let at = match &splice.after {
                Some(anchor) => derived
                    .widgets
                    .iter()
                    .position(|w| &w.id == anchor)
                    .map(|i| i + 1)
                    .ok_or_else(|| SchemaValidationError::UnknownAnchor(anchor.clone()))?,
                None => derived.widgets.len(),
            };
            derived.widgets.splice(at..at, splice.widgets);
        }

        derived.validate()?;
        Ok(derived)
    }
}
