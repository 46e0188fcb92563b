//! ============================================================================
//! Schema Module - Declarative dashboard and form descriptions
//! ============================================================================
//! Schemas are pure, serializable data. Validation is a pre-render step that
//! fails with a `SchemaValidationError` naming the offending widget/field.
//!
//! ## Usage
//! ```rust,ignore
//! use capture_core::schema::{DashboardSchema, FormSchema};
//!
//! let dashboard = DashboardSchema::from_json(&std::fs::read_to_string("ops.json")?)?;
//! let night = dashboard.derive(SchemaOverrides { title: Some("Night".into()), ..Default::default() })?;
//! let form = FormSchema::from_json(&std::fs::read_to_string("pcr.json")?)?;
//! ```
//! ============================================================================

mod compiled;
mod dashboard;
mod form;
mod predicate;

pub use compiled::{CompiledForm, FieldNode};
pub use dashboard::{
    DashboardSchema, GridSize, SchemaOverrides, WidgetKind, WidgetSpec, WidgetSplice, WIDGET_TYPES,
};
pub use form::{FieldKind, FieldSpec, FormSchema, ValidationRule, FIELD_TYPES};
pub use predicate::{is_empty_value, values_match, VisibleWhen};
