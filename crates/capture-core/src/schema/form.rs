//! ============================================================================
//! Form Schema - Field specs, validation rules, value checks
//! ============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::compiled::CompiledForm;
use super::predicate::{is_empty_value, VisibleWhen};
use crate::types::{FieldValidationError, SchemaRef, SchemaValidationError};

/// Field type tags accepted in schema JSON
pub const FIELD_TYPES: &[&str] = &[
    "text", "number", "date", "select", "signature", "photo", "checkbox", "group",
];

/// Closed set of field types. Type-specific payload lives on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FieldKind {
    Text,
    Number,
    Date,
    Select { options: Vec<String> },
    Signature,
    Photo,
    Checkbox,
    Group { fields: Vec<FieldSpec> },
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Date => "date",
            FieldKind::Select { .. } => "select",
            FieldKind::Signature => "signature",
            FieldKind::Photo => "photo",
            FieldKind::Checkbox => "checkbox",
            FieldKind::Group { .. } => "group",
        }
    }

    /// Signature and photo fields are satisfied by an attachment, not a value
    pub fn takes_attachment(&self) -> bool {
        matches!(self, FieldKind::Signature | FieldKind::Photo)
    }

    pub fn is_group(&self) -> bool {
        matches!(self, FieldKind::Group { .. })
    }
}

/// Named validation rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "camelCase")]
pub enum ValidationRule {
    MinLength { value: usize },
    MaxLength { value: usize },
    Min { value: f64 },
    Max { value: f64 },
    NotInFuture,
}

impl ValidationRule {
    pub fn name(&self) -> &'static str {
        match self {
            ValidationRule::MinLength { .. } => "minLength",
            ValidationRule::MaxLength { .. } => "maxLength",
            ValidationRule::Min { .. } => "min",
            ValidationRule::Max { .. } => "max",
            ValidationRule::NotInFuture => "notInFuture",
        }
    }

    fn applies_to(&self, kind: &FieldKind) -> bool {
        match self {
            ValidationRule::MinLength { .. } | ValidationRule::MaxLength { .. } => {
                matches!(kind, FieldKind::Text)
            }
            ValidationRule::Min { .. } | ValidationRule::Max { .. } => {
                matches!(kind, FieldKind::Number)
            }
            ValidationRule::NotInFuture => matches!(kind, FieldKind::Date),
        }
    }
}

/// One form input (or a group of inputs)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub validation: Vec<ValidationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_when: Option<VisibleWhen>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl FieldSpec {
    /// Convenience constructor for a bare field of the given kind
    pub fn new(id: impl Into<String>, kind: FieldKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            required: false,
            validation: Vec::new(),
            visible_when: None,
            default_value: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn visible_when(mut self, predicate: VisibleWhen) -> Self {
        self.visible_when = Some(predicate);
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation.push(rule);
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Static checks on the field definition itself (not on captured values)
    pub(crate) fn check_spec(&self, path: &str) -> Result<(), SchemaValidationError> {
        if let FieldKind::Select { options } = &self.kind {
            if options.is_empty() {
                return Err(SchemaValidationError::MissingOptions(path.to_string()));
            }
        }

        for rule in &self.validation {
            if !rule.applies_to(&self.kind) {
                return Err(SchemaValidationError::RuleNotApplicable {
                    field: path.to_string(),
                    field_type: self.kind.name().to_string(),
                    rule: rule.name().to_string(),
                });
            }
        }

        Ok(())
    }

    /// Validate a captured value against type, required-ness and rules
    pub fn check_value(
        &self,
        value: Option<&Value>,
        has_attachment: bool,
        today: NaiveDate,
    ) -> Result<(), FieldValidationError> {
        let empty = match &self.kind {
            FieldKind::Group { .. } => return Ok(()),
            FieldKind::Signature | FieldKind::Photo => !has_attachment,
            FieldKind::Checkbox => !matches!(value, Some(Value::Bool(true))),
            _ => value.map_or(true, is_empty_value),
        };

        if empty {
            return if self.required {
                Err(FieldValidationError::Required)
            } else {
                Ok(())
            };
        }

        let Some(value) = value else {
            return Ok(());
        };

        match &self.kind {
            FieldKind::Text => {
                let text = value.as_str().ok_or_else(|| wrong_type("text"))?;
                let chars = text.chars().count();
                for rule in &self.validation {
                    match rule {
                        ValidationRule::MinLength { value: min } if chars < *min => {
                            return Err(FieldValidationError::TooShort { min: *min });
                        }
                        ValidationRule::MaxLength { value: max } if chars > *max => {
                            return Err(FieldValidationError::TooLong { max: *max });
                        }
                        _ => {}
                    }
                }
            }
            FieldKind::Number => {
                let number = value.as_f64().ok_or_else(|| wrong_type("a number"))?;
                for rule in &self.validation {
                    match rule {
                        ValidationRule::Min { value: min } if number < *min => {
                            return Err(FieldValidationError::BelowMinimum { min: *min });
                        }
                        ValidationRule::Max { value: max } if number > *max => {
                            return Err(FieldValidationError::AboveMaximum { max: *max });
                        }
                        _ => {}
                    }
                }
            }
            FieldKind::Date => {
                let date = value
                    .as_str()
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                    .ok_or_else(|| wrong_type("a date (YYYY-MM-DD)"))?;
                if self.validation.contains(&ValidationRule::NotInFuture) && date > today {
                    return Err(FieldValidationError::InFuture);
                }
            }
            FieldKind::Select { options } => {
                let choice = value.as_str().ok_or_else(|| wrong_type("an option"))?;
                if !options.iter().any(|o| o == choice) {
                    return Err(FieldValidationError::NotAnOption {
                        value: choice.to_string(),
                    });
                }
            }
            FieldKind::Checkbox => {
                value.as_bool().ok_or_else(|| wrong_type("true or false"))?;
            }
            FieldKind::Signature | FieldKind::Photo | FieldKind::Group { .. } => {}
        }

        Ok(())
    }
}

fn wrong_type(expected: &str) -> FieldValidationError {
    FieldValidationError::WrongType {
        expected: expected.to_string(),
    }
}

/// Ordered, possibly nested, set of fields captured as one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSchema {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub title: String,
    pub fields: Vec<FieldSpec>,
}

fn default_version() -> u32 {
    1
}

impl FormSchema {
    pub fn new(id: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            title: String::new(),
            fields,
        }
    }

    /// Parse schema JSON. Unknown field types are rejected here, naming the
    /// offending field, before any structural validation.
    pub fn from_json(json: &str) -> Result<Self, SchemaValidationError> {
        let raw: Value = serde_json::from_str(json)
            .map_err(|e| SchemaValidationError::Malformed(e.to_string()))?;

        if let Some(fields) = raw.get("fields").and_then(Value::as_array) {
            check_field_types(fields)?;
        }

        let schema: FormSchema = serde_json::from_value(raw)
            .map_err(|e| SchemaValidationError::Malformed(e.to_string()))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Structural validation: ids, references, acyclic visibility, rules
    pub fn validate(&self) -> Result<(), SchemaValidationError> {
        CompiledForm::compile(self).map(|_| ())
    }

    pub fn schema_ref(&self) -> SchemaRef {
        SchemaRef {
            form_id: self.id.clone(),
            version: self.version,
        }
    }
}

fn check_field_types(fields: &[Value]) -> Result<(), SchemaValidationError> {
    for field in fields {
        let id = field.get("id").and_then(Value::as_str).unwrap_or("<missing id>");
        let type_name = field.get("type").and_then(Value::as_str).unwrap_or("<missing>");

        if !FIELD_TYPES.contains(&type_name) {
            return Err(SchemaValidationError::UnknownType {
                element: "field".to_string(),
                id: id.to_string(),
                type_name: type_name.to_string(),
            });
        }

        if let Some(children) = field.get("fields").and_then(Value::as_array) {
            check_field_types(children)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn test_parse_nested_form() {
        let schema = FormSchema::from_json(
            r#"{
                "id": "pcr",
                "title": "Patient care report",
                "fields": [
                    { "id": "unit", "type": "select", "options": ["M1", "M2"], "required": true },
                    { "id": "vitals", "type": "group", "fields": [
                        { "id": "pulse", "type": "number",
                          "validation": [{ "rule": "min", "value": 0 }, { "rule": "max", "value": 300 }] },
                        { "id": "taken", "type": "date", "validation": [{ "rule": "notInFuture" }] }
                    ]},
                    { "id": "sig", "type": "signature", "required": true }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(schema.version, 1);
        assert_eq!(schema.fields.len(), 3);
        assert!(matches!(&schema.fields[1].kind, FieldKind::Group { fields } if fields.len() == 2));
    }

    #[test]
    fn test_unknown_field_type_names_field() {
        let err = FormSchema::from_json(
            r#"{ "id": "f", "fields": [
                { "id": "ok", "type": "text" },
                { "id": "g", "type": "group", "fields": [{ "id": "scan", "type": "barcode" }] }
            ]}"#,
        )
        .unwrap_err();

        assert_eq!(
            err,
            SchemaValidationError::UnknownType {
                element: "field".into(),
                id: "scan".into(),
                type_name: "barcode".into(),
            }
        );
    }

    #[test]
    fn test_select_without_options_is_rejected() {
        let schema = FormSchema::new(
            "f",
            vec![FieldSpec::new("s", FieldKind::Select { options: vec![] })],
        );
        assert_eq!(
            schema.validate(),
            Err(SchemaValidationError::MissingOptions("s".into()))
        );
    }

    #[test]
    fn test_rule_must_match_field_type() {
        let schema = FormSchema::new(
            "f",
            vec![FieldSpec::new("n", FieldKind::Number).with_rule(ValidationRule::MinLength { value: 2 })],
        );
        assert!(matches!(
            schema.validate(),
            Err(SchemaValidationError::RuleNotApplicable { .. })
        ));
    }

    #[test]
    fn test_required_text() {
        let spec = FieldSpec::new("a", FieldKind::Text).required();
        assert_eq!(spec.check_value(None, false, today()), Err(FieldValidationError::Required));
        assert_eq!(
            spec.check_value(Some(&json!("  ")), false, today()),
            Err(FieldValidationError::Required)
        );
        assert_eq!(spec.check_value(Some(&json!("x")), false, today()), Ok(()));
    }

    #[test]
    fn test_optional_empty_field_passes_rules() {
        let spec = FieldSpec::new("a", FieldKind::Text).with_rule(ValidationRule::MinLength { value: 5 });
        assert_eq!(spec.check_value(None, false, today()), Ok(()));
        assert_eq!(
            spec.check_value(Some(&json!("abc")), false, today()),
            Err(FieldValidationError::TooShort { min: 5 })
        );
    }

    #[test]
    fn test_number_bounds_and_type() {
        let spec = FieldSpec::new("pulse", FieldKind::Number)
            .with_rule(ValidationRule::Min { value: 0.0 })
            .with_rule(ValidationRule::Max { value: 300.0 });
        assert_eq!(spec.check_value(Some(&json!(72)), false, today()), Ok(()));
        assert_eq!(
            spec.check_value(Some(&json!(301)), false, today()),
            Err(FieldValidationError::AboveMaximum { max: 300.0 })
        );
        assert!(matches!(
            spec.check_value(Some(&json!("72")), false, today()),
            Err(FieldValidationError::WrongType { .. })
        ));
    }

    #[test]
    fn test_date_not_in_future() {
        let spec = FieldSpec::new("d", FieldKind::Date).with_rule(ValidationRule::NotInFuture);
        assert_eq!(spec.check_value(Some(&json!("2024-05-31")), false, today()), Ok(()));
        assert_eq!(
            spec.check_value(Some(&json!("2024-06-02")), false, today()),
            Err(FieldValidationError::InFuture)
        );
        assert!(spec.check_value(Some(&json!("06/01/2024")), false, today()).is_err());
    }

    #[test]
    fn test_select_must_be_an_option() {
        let spec = FieldSpec::new("s", FieldKind::Select { options: vec!["a".into(), "b".into()] });
        assert_eq!(spec.check_value(Some(&json!("a")), false, today()), Ok(()));
        assert_eq!(
            spec.check_value(Some(&json!("c")), false, today()),
            Err(FieldValidationError::NotAnOption { value: "c".into() })
        );
    }

    #[test]
    fn test_required_checkbox_must_be_checked() {
        let spec = FieldSpec::new("consent", FieldKind::Checkbox).required();
        assert_eq!(
            spec.check_value(Some(&json!(false)), false, today()),
            Err(FieldValidationError::Required)
        );
        assert_eq!(spec.check_value(Some(&json!(true)), false, today()), Ok(()));
    }

    #[test]
    fn test_required_photo_needs_attachment() {
        let spec = FieldSpec::new("scene", FieldKind::Photo).required();
        assert_eq!(spec.check_value(None, false, today()), Err(FieldValidationError::Required));
        assert_eq!(spec.check_value(None, true, today()), Ok(()));
    }
}
