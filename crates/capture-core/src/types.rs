//! ============================================================================
//! Core Types for the Capture Core
//! ============================================================================
//! Shared value types and the error taxonomy used across schema, rendering,
//! queue and sync modules. Wire types serialize as camelCase JSON for the
//! UI shell and the backend.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::session::SessionStatus;

/// Parameter set bound into a dashboard (org id, unit id, date range, ...)
pub type Bindings = BTreeMap<String, String>;

/// Reference to the form schema a session was captured against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRef {
    pub form_id: String,
    pub version: u32,
}

impl std::fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.form_id, self.version)
    }
}

// ============================================================================
// Schema Errors
// ============================================================================

/// Malformed schema. Fatal at load: a schema that fails validation is never
/// partially rendered.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaValidationError {
    #[error("Malformed schema: {0}")]
    Malformed(String),

    #[error("Unknown type '{type_name}' on {element} '{id}'")]
    UnknownType {
        element: String,
        id: String,
        type_name: String,
    },

    #[error("Invalid id '{0}': ids must be non-empty and must not contain '.'")]
    InvalidId(String),

    #[error("Duplicate id '{0}'")]
    DuplicateId(String),

    #[error("Widget '{0}' has an empty data source")]
    EmptyDataSource(String),

    #[error("Field '{field}' references unknown field '{reference}'")]
    UnknownReference { field: String, reference: String },

    #[error("Field '{field}' references '{reference}', which is declared later and is not a sibling")]
    ForwardReference { field: String, reference: String },

    #[error("Field '{field}' references group '{reference}', which holds no value")]
    GroupReference { field: String, reference: String },

    #[error("Visibility cycle: {}", .0.join(" -> "))]
    VisibilityCycle(Vec<String>),

    #[error("Select field '{0}' declares no options")]
    MissingOptions(String),

    #[error("Rule '{rule}' does not apply to {field_type} field '{field}'")]
    RuleNotApplicable {
        field: String,
        field_type: String,
        rule: String,
    },

    #[error("Splice anchor '{0}' not found")]
    UnknownAnchor(String),
}

// ============================================================================
// Field Validation
// ============================================================================

/// Per-field validation failure. Blocks submit; recoverable by correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FieldValidationError {
    #[error("Field is required")]
    Required,

    #[error("Expected {expected}")]
    WrongType { expected: String },

    #[error("Must be at least {min} characters")]
    TooShort { min: usize },

    #[error("Must be at most {max} characters")]
    TooLong { max: usize },

    #[error("Must be at least {min}")]
    BelowMinimum { min: f64 },

    #[error("Must be at most {max}")]
    AboveMaximum { max: f64 },

    #[error("Date must not be in the future")]
    InFuture,

    #[error("'{value}' is not one of the allowed options")]
    NotAnOption { value: String },
}

/// A failing field and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIssue {
    pub field: String,
    pub error: FieldValidationError,
}

/// Errors from editing a form view
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormError {
    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field '{field}' does not accept {input}")]
    WrongInput { field: String, input: String },

    #[error("Session is {0:?} and can no longer be edited")]
    NotEditable(SessionStatus),
}

/// Why a submit attempt did not produce a durably queued session
#[derive(Debug, thiserror::Error)]
pub enum FormSubmitError {
    #[error("Submit blocked by {} invalid field(s): {}", .issues.len(), .failing.join(", "))]
    Blocked {
        failing: Vec<String>,
        issues: Vec<FieldIssue>,
    },

    #[error(transparent)]
    Enqueue(#[from] EnqueueFailure),

    #[error("Session is {0:?} and cannot be submitted again")]
    AlreadySubmitted(SessionStatus),
}

// ============================================================================
// Queue Errors
// ============================================================================

/// Durable storage write failed during enqueue. "Submitted" must never be
/// reported when this occurs.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to durably enqueue session {session_id}: {reason}")]
pub struct EnqueueFailure {
    pub session_id: String,
    pub reason: String,
}

/// Offline queue storage / state errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(String),

    #[error("Queue encoding error: {0}")]
    Encoding(String),

    #[error("Queue entry not found: {0}")]
    NotFound(String),

    #[error("Queue entry {session_id} is {state}, cannot {action}")]
    InvalidState {
        session_id: String,
        state: String,
        action: String,
    },
}

impl QueueError {
    /// Map any storage-layer error into `QueueError::Storage` with context
    pub(crate) fn storage<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> QueueError {
        move |e| QueueError::Storage(format!("{}: {}", context, e))
    }
}
