//! ============================================================================
//! Form View - Input regions over a draft capture session
//! ============================================================================
//! Every edit re-evaluates every `visibleWhen` predicate in the form, since a
//! change to one field can show or hide fields anywhere. Hidden fields keep
//! their draft values but are skipped by validation and left out of the
//! submitted snapshot.
//! ============================================================================

use chrono::Local;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::queue::{EnqueueOutcome, SessionSink};
use crate::schema::{CompiledForm, FieldNode, FormSchema};
use crate::session::{Attachment, AttachmentRef, CaptureSession, SessionStatus, SubmittedSession};
use crate::types::{FieldIssue, FieldValidationError, FormError, FormSubmitError, SchemaValidationError};

/// One rendered input
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRegion {
    pub path: String,
    pub label: String,
    pub field_type: &'static str,
    pub depth: usize,
    pub required: bool,
    pub visible: bool,
    pub value: Option<Value>,
    pub attachment: Option<AttachmentRef>,
    pub error: Option<FieldValidationError>,
}

/// Form bound to one draft session
pub struct FormView {
    schema: FormSchema,
    compiled: CompiledForm,
    session: CaptureSession,
    visibility: BTreeMap<String, bool>,
    errors: BTreeMap<String, FieldValidationError>,
}

impl FormView {
    /// Validate the schema and start a draft seeded with default values
    pub fn open(schema: FormSchema, device_id: &str) -> Result<Self, SchemaValidationError> {
        let compiled = CompiledForm::compile(&schema)?;
        let mut session = CaptureSession::new(schema.schema_ref(), device_id);

        for node in compiled.nodes() {
            if let Some(default) = &node.spec.default_value {
                if !node.spec.kind.is_group() && !node.spec.kind.takes_attachment() {
                    session.set_value(&node.path, default.clone());
                }
            }
        }

        info!(
            "Opened form {} as session {}",
            schema.schema_ref(),
            session.session_id()
        );
        Ok(Self::with_session(schema, compiled, session))
    }

    /// Start a correction of a submitted session
    pub fn amend(schema: FormSchema, prior: &SubmittedSession) -> Result<Self, SchemaValidationError> {
        if prior.schema_ref().form_id != schema.id {
            return Err(SchemaValidationError::Malformed(format!(
                "session {} was captured with form '{}', not '{}'",
                prior.session_id(),
                prior.schema_ref().form_id,
                schema.id
            )));
        }
        let compiled = CompiledForm::compile(&schema)?;
        let mut session = prior.amend();
        if prior.schema_ref().version != schema.version {
            debug!(
                "Amendment of {} moves from version {} to {}",
                prior.session_id(),
                prior.schema_ref().version,
                schema.version
            );
        }
        // validated against `schema`, so it must say so
        session.restamp(schema.schema_ref());

        info!(
            "Opened amendment {} of session {}",
            session.session_id(),
            prior.session_id()
        );
        Ok(Self::with_session(schema, compiled, session))
    }

    fn with_session(schema: FormSchema, compiled: CompiledForm, session: CaptureSession) -> Self {
        let mut view = Self {
            schema,
            compiled,
            session,
            visibility: BTreeMap::new(),
            errors: BTreeMap::new(),
        };
        view.recompute_visibility();
        view
    }

    pub fn schema(&self) -> &FormSchema {
        &self.schema
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn is_visible(&self, path: &str) -> bool {
        self.visibility.get(path).copied().unwrap_or(false)
    }

    pub fn field_error(&self, path: &str) -> Option<&FieldValidationError> {
        self.errors.get(path)
    }

    // ========================================================================
    // Edits
    // ========================================================================

    pub fn set_value(&mut self, path: &str, value: Value) -> Result<(), FormError> {
        self.editable_value_field(path)?;
        self.session.set_value(path, value);
        self.after_change(path);
        Ok(())
    }

    pub fn clear_value(&mut self, path: &str) -> Result<(), FormError> {
        self.editable_value_field(path)?;
        self.session.clear_value(path);
        self.after_change(path);
        Ok(())
    }

    /// Attach a captured blob to a photo or signature field
    pub fn attach(&mut self, path: &str, attachment: Attachment) -> Result<(), FormError> {
        self.editable_attachment_field(path)?;
        self.session.attach(path, attachment);
        self.after_change(path);
        Ok(())
    }

    pub fn detach(&mut self, path: &str) -> Result<(), FormError> {
        self.editable_attachment_field(path)?;
        self.session.detach(path);
        self.after_change(path);
        Ok(())
    }

    /// Focus left a field: validate it without changing anything
    pub fn blur(&mut self, path: &str) -> Result<Option<&FieldValidationError>, FormError> {
        let node = self.node(path)?;
        let path = node.path.clone();
        self.validate_field(&path);
        Ok(self.errors.get(&path))
    }

    fn editable_value_field(&self, path: &str) -> Result<(), FormError> {
        let node = self.editable_node(path)?;
        if node.spec.kind.is_group() || node.spec.kind.takes_attachment() {
            return Err(FormError::WrongInput {
                field: path.to_string(),
                input: "a value".to_string(),
            });
        }
        Ok(())
    }

    fn editable_attachment_field(&self, path: &str) -> Result<(), FormError> {
        let node = self.editable_node(path)?;
        if !node.spec.kind.takes_attachment() {
            return Err(FormError::WrongInput {
                field: path.to_string(),
                input: "an attachment".to_string(),
            });
        }
        Ok(())
    }

    fn editable_node(&self, path: &str) -> Result<&FieldNode, FormError> {
        if self.session.status() != SessionStatus::Draft {
            return Err(FormError::NotEditable(self.session.status()));
        }
        self.node(path)
    }

    fn node(&self, path: &str) -> Result<&FieldNode, FormError> {
        self.compiled
            .node(path)
            .ok_or_else(|| FormError::UnknownField(path.to_string()))
    }

    fn after_change(&mut self, path: &str) {
        self.recompute_visibility();
        self.validate_field(path);
    }

    fn recompute_visibility(&mut self) {
        self.visibility = self
            .compiled
            .visibility(self.session.values(), &self.session.attached_paths());
        let visibility = &self.visibility;
        self.errors
            .retain(|path, _| visibility.get(path).copied().unwrap_or(false));
    }

    fn validate_field(&mut self, path: &str) {
        match self.check(path) {
            Some(Err(error)) => {
                debug!("Field {} invalid: {}", path, error);
                self.errors.insert(path.to_string(), error);
            }
            _ => {
                self.errors.remove(path);
            }
        }
    }

    /// None for hidden fields and groups
    fn check(&self, path: &str) -> Option<Result<(), FieldValidationError>> {
        let node = self.compiled.node(path)?;
        if node.spec.kind.is_group() || !self.is_visible(path) {
            return None;
        }
        Some(node.spec.check_value(
            self.session.value(path),
            self.session.has_attachment(path),
            Local::now().date_naive(),
        ))
    }

    // ========================================================================
    // Projection
    // ========================================================================

    /// Every field in document order, hidden ones flagged `visible: false`
    pub fn regions(&self) -> Vec<InputRegion> {
        self.compiled
            .nodes()
            .iter()
            .map(|node| InputRegion {
                path: node.path.clone(),
                label: node.spec.label.clone(),
                field_type: node.spec.kind.name(),
                depth: node.depth,
                required: node.spec.required,
                visible: self.is_visible(&node.path),
                value: self.session.value(&node.path).cloned(),
                attachment: self
                    .session
                    .attachments()
                    .get(&node.path)
                    .map(|a| a.reference()),
                error: self.errors.get(&node.path).cloned(),
            })
            .collect()
    }

    /// Every failing visible field, in document order
    pub fn validate_all(&self) -> Vec<FieldIssue> {
        self.compiled
            .nodes()
            .iter()
            .filter_map(|node| match self.check(&node.path) {
                Some(Err(error)) => Some(FieldIssue {
                    field: node.path.clone(),
                    error,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn can_submit(&self) -> bool {
        self.session.status() == SessionStatus::Draft && self.validate_all().is_empty()
    }

    // ========================================================================
    // Submit / abandon
    // ========================================================================

    /// Validate everything, snapshot the visible values and durably enqueue.
    /// The session only becomes `submitted` once the queue has committed.
    pub fn submit(&mut self, queue: &dyn SessionSink) -> Result<SubmittedSession, FormSubmitError> {
        if self.session.status() != SessionStatus::Draft {
            return Err(FormSubmitError::AlreadySubmitted(self.session.status()));
        }

        let issues = self.validate_all();
        if !issues.is_empty() {
            for issue in &issues {
                self.errors.insert(issue.field.clone(), issue.error.clone());
            }
            let failing: Vec<String> = issues.iter().map(|i| i.field.clone()).collect();
            debug!("Submit blocked by {:?}", failing);
            return Err(FormSubmitError::Blocked { failing, issues });
        }

        let visibility = &self.visibility;
        let compiled = &self.compiled;
        let (snapshot, blobs) = self.session.seal(|path| {
            visibility.get(path).copied().unwrap_or(false)
                && compiled.node(path).is_some_and(|n| !n.spec.kind.is_group())
        });

        match queue.enqueue(&snapshot, &blobs) {
            Ok(EnqueueOutcome::Queued(_)) | Ok(EnqueueOutcome::AlreadyQueued(_)) => {}
            Ok(EnqueueOutcome::AlreadySynced(_)) => {
                warn!("Session {} was already synced", snapshot.session_id());
            }
            Err(failure) => {
                warn!("Enqueue failed, draft kept: {}", failure);
                return Err(FormSubmitError::Enqueue(failure));
            }
        }

        self.session.mark_submitted();
        info!(
            "Submitted session {} ({} values, {} blobs)",
            snapshot.session_id(),
            snapshot.values().len(),
            blobs.len()
        );
        Ok(snapshot)
    }

    /// Discard the draft. Nothing was written, so nothing remains.
    pub fn abandon(self) {
        debug!("Abandoned draft {}", self.session.session_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OfflineQueue;
    use crate::schema::{FieldKind, FieldSpec, ValidationRule, VisibleWhen};
    use crate::types::EnqueueFailure;
    use serde_json::json;

    fn scenario_form() -> FormSchema {
        FormSchema::new(
            "scenario",
            vec![
                FieldSpec::new("a", FieldKind::Text).required(),
                FieldSpec::new("b", FieldKind::Text)
                    .required()
                    .visible_when(VisibleWhen::Equals {
                        field: "a".into(),
                        value: json!("x"),
                    }),
            ],
        )
    }

    struct FailingSink;

    impl SessionSink for FailingSink {
        fn enqueue(
            &self,
            session: &SubmittedSession,
            _blobs: &[Attachment],
        ) -> Result<EnqueueOutcome, EnqueueFailure> {
            Err(EnqueueFailure {
                session_id: session.session_id().to_string(),
                reason: "disk full".into(),
            })
        }
    }

    fn temp_queue() -> (tempfile::TempDir, OfflineQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::open(dir.path().join("q.redb")).unwrap();
        (dir, queue)
    }

    #[test]
    fn test_hidden_required_field_does_not_block() {
        let (_dir, queue) = temp_queue();
        let mut form = FormView::open(scenario_form(), "dev-1").unwrap();

        form.set_value("a", json!("y")).unwrap();
        assert!(!form.is_visible("b"));
        assert!(form.can_submit());

        let submitted = form.submit(&queue).unwrap();
        assert_eq!(form.status(), SessionStatus::Submitted);
        assert_eq!(submitted.values().len(), 1);
        assert!(queue.get(submitted.session_id()).unwrap().is_some());
    }

    #[test]
    fn test_visible_required_field_blocks_with_its_id() {
        let (_dir, queue) = temp_queue();
        let mut form = FormView::open(scenario_form(), "dev-1").unwrap();

        form.set_value("a", json!("x")).unwrap();
        assert!(form.is_visible("b"));

        match form.submit(&queue) {
            Err(FormSubmitError::Blocked { failing, .. }) => assert_eq!(failing, vec!["b"]),
            other => panic!("expected blocked, got {:?}", other.map(|s| s.session_id().to_string())),
        }
        assert_eq!(form.status(), SessionStatus::Draft);
        assert_eq!(form.field_error("b"), Some(&FieldValidationError::Required));
        assert!(queue.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_all_failing_fields_reported() {
        let schema = FormSchema::new(
            "f",
            vec![
                FieldSpec::new("name", FieldKind::Text).required(),
                FieldSpec::new("pulse", FieldKind::Number).with_rule(ValidationRule::Max { value: 300.0 }),
                FieldSpec::new("sig", FieldKind::Signature).required(),
            ],
        );
        let mut form = FormView::open(schema, "dev-1").unwrap();
        form.set_value("pulse", json!(400)).unwrap();

        let failing: Vec<_> = form.validate_all().into_iter().map(|i| i.field).collect();
        assert_eq!(failing, vec!["name", "pulse", "sig"]);
    }

    #[test]
    fn test_hidden_values_retained_but_not_submitted() {
        let (_dir, queue) = temp_queue();
        let mut form = FormView::open(scenario_form(), "dev-1").unwrap();

        form.set_value("a", json!("x")).unwrap();
        form.set_value("b", json!("details")).unwrap();
        form.set_value("a", json!("y")).unwrap();
        assert_eq!(form.session().value("b"), Some(&json!("details")));

        form.set_value("a", json!("x")).unwrap();
        assert!(form.is_visible("b"));
        assert!(form.validate_all().is_empty());

        form.set_value("a", json!("y")).unwrap();
        let submitted = form.submit(&queue).unwrap();
        assert!(submitted.values().get("b").is_none());
    }

    #[test]
    fn test_enqueue_failure_keeps_draft() {
        let mut form = FormView::open(scenario_form(), "dev-1").unwrap();
        form.set_value("a", json!("y")).unwrap();

        assert!(matches!(form.submit(&FailingSink), Err(FormSubmitError::Enqueue(_))));
        assert_eq!(form.status(), SessionStatus::Draft);
        assert_eq!(form.session().value("a"), Some(&json!("y")));
        form.set_value("a", json!("z")).unwrap();
    }

    #[test]
    fn test_submitted_form_is_read_only() {
        let (_dir, queue) = temp_queue();
        let mut form = FormView::open(scenario_form(), "dev-1").unwrap();
        form.set_value("a", json!("y")).unwrap();
        form.submit(&queue).unwrap();

        assert_eq!(
            form.set_value("a", json!("z")),
            Err(FormError::NotEditable(SessionStatus::Submitted))
        );
        assert!(matches!(
            form.submit(&queue),
            Err(FormSubmitError::AlreadySubmitted(SessionStatus::Submitted))
        ));
    }

    #[test]
    fn test_group_visibility_hides_children() {
        let schema = FormSchema::new(
            "f",
            vec![
                FieldSpec::new("injured", FieldKind::Checkbox),
                FieldSpec::new(
                    "injury",
                    FieldKind::Group {
                        fields: vec![FieldSpec::new("site", FieldKind::Text).required()],
                    },
                )
                .visible_when(VisibleWhen::Equals {
                    field: "injured".into(),
                    value: json!(true),
                }),
            ],
        );
        let mut form = FormView::open(schema, "dev-1").unwrap();
        assert!(!form.is_visible("injury.site"));
        assert!(form.can_submit());

        form.set_value("injured", json!(true)).unwrap();
        assert_eq!(form.validate_all()[0].field, "injury.site");
    }

    #[test]
    fn test_defaults_and_input_kinds() {
        let schema = FormSchema::new(
            "f",
            vec![
                FieldSpec::new("unit", FieldKind::Text).with_default(json!("M1")),
                FieldSpec::new("photo", FieldKind::Photo),
            ],
        );
        let mut form = FormView::open(schema, "dev-1").unwrap();
        assert_eq!(form.session().value("unit"), Some(&json!("M1")));

        assert!(matches!(
            form.set_value("photo", json!("x")),
            Err(FormError::WrongInput { .. })
        ));
        assert!(matches!(
            form.attach("unit", Attachment::new("image/png", vec![1])),
            Err(FormError::WrongInput { .. })
        ));
        assert_eq!(
            form.set_value("missing", json!(1)),
            Err(FormError::UnknownField("missing".into()))
        );

        form.attach("photo", Attachment::new("image/png", vec![1])).unwrap();
        let region = form.regions().into_iter().find(|r| r.path == "photo").unwrap();
        assert_eq!(region.attachment.unwrap().size, 1);
    }

    #[test]
    fn test_blur_validates_untouched_field() {
        let mut form = FormView::open(scenario_form(), "dev-1").unwrap();
        assert_eq!(form.blur("a").unwrap(), Some(&FieldValidationError::Required));
        // hidden field never reports an error
        assert_eq!(form.blur("b").unwrap(), None);
    }

    #[test]
    fn test_amend_links_prior_and_copies_values() {
        let (_dir, queue) = temp_queue();
        let mut form = FormView::open(scenario_form(), "dev-1").unwrap();
        form.set_value("a", json!("y")).unwrap();
        let submitted = form.submit(&queue).unwrap();

        let mut amendment = FormView::amend(scenario_form(), &submitted).unwrap();
        assert_eq!(amendment.session().amends(), Some(submitted.session_id()));
        amendment.set_value("a", json!("x")).unwrap();
        amendment.set_value("b", json!("forgot this")).unwrap();
        let corrected = amendment.submit(&queue).unwrap();

        assert_eq!(corrected.amends(), Some(submitted.session_id()));
        assert_eq!(queue.snapshot().unwrap().len(), 2);
        // the original snapshot is untouched
        assert_eq!(submitted.values().get("a"), Some(&json!("y")));
    }

    #[test]
    fn test_amend_takes_version_of_given_schema() {
        let (_dir, queue) = temp_queue();
        let mut form = FormView::open(scenario_form(), "dev-1").unwrap();
        form.set_value("a", json!("y")).unwrap();
        let submitted = form.submit(&queue).unwrap();
        assert_eq!(submitted.schema_ref().version, 1);

        let mut revised = scenario_form();
        revised.version = 2;
        let mut amendment = FormView::amend(revised, &submitted).unwrap();
        assert_eq!(amendment.session().schema_ref().version, 2);

        let corrected = amendment.submit(&queue).unwrap();
        assert_eq!(corrected.schema_ref().version, 2);
        assert_eq!(submitted.schema_ref().version, 1);
    }

    #[test]
    fn test_abandon_leaves_no_trace() {
        let (_dir, queue) = temp_queue();
        let mut form = FormView::open(scenario_form(), "dev-1").unwrap();
        form.set_value("a", json!("y")).unwrap();
        form.abandon();
        assert!(queue.snapshot().unwrap().is_empty());
    }
}
