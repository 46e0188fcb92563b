//! ============================================================================
//! Capture Session - Draft and submitted records of one form fill
//! ============================================================================
//! A draft is mutable and has exactly one writer (the owning `FormView`).
//! Submission seals it into a `SubmittedSession`, an immutable snapshot that
//! is what the offline queue persists and the reconciler sends. Corrections
//! after submission go through `SubmittedSession::amend`, which starts a new
//! draft pointing back at the prior session id.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::types::SchemaRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Draft,
    Submitted,
    Synced,
    Conflict,
    Failed,
}

// ============================================================================
// Attachments
// ============================================================================

/// Captured blob held in memory while drafting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            bytes,
        }
    }

    /// Content-addressed id: lowercase hex sha256 of the bytes
    pub fn blob_id(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }

    pub fn reference(&self) -> AttachmentRef {
        AttachmentRef {
            blob_id: self.blob_id(),
            media_type: self.media_type.clone(),
            size: self.bytes.len() as u64,
        }
    }
}

/// What a submitted session carries in place of attachment bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub blob_id: String,
    pub media_type: String,
    pub size: u64,
}

/// Attachment slot on a draft. Amended drafts inherit references; the bytes
/// are either on the server already or still queued under the prior session,
/// in which case the queue copies them to the amendment.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftAttachment {
    Captured(Attachment),
    Inherited(AttachmentRef),
}

impl DraftAttachment {
    pub fn reference(&self) -> AttachmentRef {
        match self {
            DraftAttachment::Captured(attachment) => attachment.reference(),
            DraftAttachment::Inherited(reference) => reference.clone(),
        }
    }
}

// ============================================================================
// Draft
// ============================================================================

/// One in-progress fill of a form
#[derive(Debug, Clone)]
pub struct CaptureSession {
    session_id: String,
    schema_ref: SchemaRef,
    device_id: String,
    values: BTreeMap<String, Value>,
    attachments: BTreeMap<String, DraftAttachment>,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
    amends: Option<String>,
}

impl CaptureSession {
    pub fn new(schema_ref: SchemaRef, device_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::now_v7().to_string(),
            schema_ref,
            device_id: device_id.into(),
            values: BTreeMap::new(),
            attachments: BTreeMap::new(),
            status: SessionStatus::Draft,
            created_at: now,
            last_modified_at: now,
            amends: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn schema_ref(&self) -> &SchemaRef {
        &self.schema_ref
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }

    pub fn attachments(&self) -> &BTreeMap<String, DraftAttachment> {
        &self.attachments
    }

    pub fn has_attachment(&self, path: &str) -> bool {
        self.attachments.contains_key(path)
    }

    pub fn attached_paths(&self) -> BTreeSet<String> {
        self.attachments.keys().cloned().collect()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_modified_at(&self) -> DateTime<Utc> {
        self.last_modified_at
    }

    pub fn amends(&self) -> Option<&str> {
        self.amends.as_deref()
    }

    pub(crate) fn set_value(&mut self, path: &str, value: Value) {
        self.values.insert(path.to_string(), value);
        self.touch();
    }

    pub(crate) fn clear_value(&mut self, path: &str) -> Option<Value> {
        let previous = self.values.remove(path);
        self.touch();
        previous
    }

    pub(crate) fn attach(&mut self, path: &str, attachment: Attachment) {
        self.attachments
            .insert(path.to_string(), DraftAttachment::Captured(attachment));
        self.touch();
    }

    pub(crate) fn detach(&mut self, path: &str) -> Option<DraftAttachment> {
        let previous = self.attachments.remove(path);
        self.touch();
        previous
    }

    /// Move the draft onto another version of its form
    pub(crate) fn restamp(&mut self, schema_ref: SchemaRef) {
        self.schema_ref = schema_ref;
        self.touch();
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.status = SessionStatus::Submitted;
    }

    fn touch(&mut self) {
        self.last_modified_at = Utc::now();
    }

    /// Snapshot the draft for submission. Only paths accepted by `include`
    /// are carried; the draft itself keeps everything. Returns the snapshot
    /// and the distinct blobs that must travel with it.
    pub(crate) fn seal(&self, include: impl Fn(&str) -> bool) -> (SubmittedSession, Vec<Attachment>) {
        let values = self
            .values
            .iter()
            .filter(|(path, _)| include(path))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect();

        let mut attachments = BTreeMap::new();
        let mut blobs = Vec::new();
        let mut seen = BTreeSet::new();
        for (path, slot) in &self.attachments {
            if !include(path) {
                continue;
            }
            let reference = slot.reference();
            if let DraftAttachment::Captured(attachment) = slot {
                if seen.insert(reference.blob_id.clone()) {
                    blobs.push(attachment.clone());
                }
            }
            attachments.insert(path.clone(), reference);
        }

        let snapshot = SubmittedSession {
            session_id: self.session_id.clone(),
            schema_ref: self.schema_ref.clone(),
            device_id: self.device_id.clone(),
            values,
            attachments,
            created_at: self.created_at,
            last_modified_at: self.last_modified_at,
            submitted_at: Utc::now(),
            amends: self.amends.clone(),
        };
        (snapshot, blobs)
    }
}

// ============================================================================
// Submitted snapshot
// ============================================================================

/// Immutable record handed to the offline queue. This is also the body the
/// submission endpoint receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedSession {
    session_id: String,
    schema_ref: SchemaRef,
    device_id: String,
    values: BTreeMap<String, Value>,
    attachments: BTreeMap<String, AttachmentRef>,
    created_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
    submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    amends: Option<String>,
}

impl SubmittedSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn schema_ref(&self) -> &SchemaRef {
        &self.schema_ref
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn attachments(&self) -> &BTreeMap<String, AttachmentRef> {
        &self.attachments
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_modified_at(&self) -> DateTime<Utc> {
        self.last_modified_at
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn amends(&self) -> Option<&str> {
        self.amends.as_deref()
    }

    /// Start a correction: a fresh draft carrying this session's values and
    /// attachment references, linked back through `amends`.
    pub fn amend(&self) -> CaptureSession {
        let mut draft = CaptureSession::new(self.schema_ref.clone(), self.device_id.clone());
        draft.values = self.values.clone();
        draft.attachments = self
            .attachments
            .iter()
            .map(|(path, reference)| (path.clone(), DraftAttachment::Inherited(reference.clone())))
            .collect();
        draft.amends = Some(self.session_id.clone());
        draft
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema_ref() -> SchemaRef {
        SchemaRef {
            form_id: "pcr".into(),
            version: 3,
        }
    }

    #[test]
    fn test_session_ids_are_time_ordered_v7() {
        let a = CaptureSession::new(schema_ref(), "dev-1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = CaptureSession::new(schema_ref(), "dev-1");

        let parsed = Uuid::parse_str(a.session_id()).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
        assert!(a.session_id() < b.session_id());
    }

    #[test]
    fn test_attachment_is_content_addressed() {
        let a = Attachment::new("image/jpeg", b"same".to_vec());
        let b = Attachment::new("image/jpeg", b"same".to_vec());
        assert_eq!(a.blob_id(), b.blob_id());
        assert_eq!(a.blob_id().len(), 64);
        assert_eq!(a.reference().size, 4);
    }

    #[test]
    fn test_seal_filters_paths_and_dedupes_blobs() {
        let mut draft = CaptureSession::new(schema_ref(), "dev-1");
        draft.set_value("unit", json!("M1"));
        draft.set_value("hidden", json!("kept in draft"));
        draft.attach("front", Attachment::new("image/png", vec![1, 2, 3]));
        draft.attach("back", Attachment::new("image/png", vec![1, 2, 3]));

        let (snapshot, blobs) = draft.seal(|path| path != "hidden");

        assert_eq!(snapshot.values().len(), 1);
        assert_eq!(snapshot.attachments().len(), 2);
        assert_eq!(blobs.len(), 1);
        assert_eq!(draft.value("hidden"), Some(&json!("kept in draft")));
        assert_eq!(snapshot.session_id(), draft.session_id());
    }

    #[test]
    fn test_amend_links_prior_session() {
        let mut draft = CaptureSession::new(schema_ref(), "dev-1");
        draft.set_value("unit", json!("M2"));
        draft.attach("sig", Attachment::new("image/png", vec![9]));
        let (submitted, _) = draft.seal(|_| true);

        let amended = submitted.amend();
        assert_ne!(amended.session_id(), submitted.session_id());
        assert_eq!(amended.amends(), Some(submitted.session_id()));
        assert_eq!(amended.status(), SessionStatus::Draft);
        assert_eq!(amended.value("unit"), Some(&json!("M2")));
        assert!(matches!(
            amended.attachments().get("sig"),
            Some(DraftAttachment::Inherited(_))
        ));
    }

    #[test]
    fn test_submitted_session_wire_format() {
        let draft = CaptureSession::new(schema_ref(), "dev-1");
        let (submitted, _) = draft.seal(|_| true);
        let wire = serde_json::to_value(&submitted).unwrap();

        assert_eq!(wire["schemaRef"]["formId"], "pcr");
        assert_eq!(wire["deviceId"], "dev-1");
        assert!(wire.get("amends").is_none());

        let back: SubmittedSession = serde_json::from_value(wire).unwrap();
        assert_eq!(back, submitted);
    }
}
