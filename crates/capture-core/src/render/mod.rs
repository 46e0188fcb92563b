//! ============================================================================
//! Render Module - Headless view models for dashboards and forms
//! ============================================================================
//! Rendering turns a validated schema into state a UI shell binds to:
//! - `DashboardView`: one `Panel` per widget, each with its own data state
//! - `FormView`: one `InputRegion` per field over a draft `CaptureSession`
//! ============================================================================

mod dashboard;
mod form;

pub use dashboard::{DashboardView, Panel, PanelData};
pub use form::{FormView, InputRegion};
