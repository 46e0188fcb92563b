//! Conditional visibility predicates over other field values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Predicate deciding whether a field is shown.
///
/// A field referenced by a predicate that is itself hidden counts as unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum VisibleWhen {
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    IsSet { field: String },
    All { conditions: Vec<VisibleWhen> },
    Any { conditions: Vec<VisibleWhen> },
    Not { condition: Box<VisibleWhen> },
}

impl VisibleWhen {
    /// Every field reference in this predicate, in declaration order
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a str>) {
        match self {
            VisibleWhen::Equals { field, .. }
            | VisibleWhen::NotEquals { field, .. }
            | VisibleWhen::In { field, .. }
            | VisibleWhen::IsSet { field } => refs.push(field),
            VisibleWhen::All { conditions } | VisibleWhen::Any { conditions } => {
                for condition in conditions {
                    condition.collect_references(refs);
                }
            }
            VisibleWhen::Not { condition } => condition.collect_references(refs),
        }
    }

    /// Rewrite every field reference (used to resolve relative ids to paths)
    pub fn map_references<E>(
        &self,
        resolve: &mut dyn FnMut(&str) -> Result<String, E>,
    ) -> Result<VisibleWhen, E> {
        Ok(match self {
            VisibleWhen::Equals { field, value } => VisibleWhen::Equals {
                field: resolve(field)?,
                value: value.clone(),
            },
            VisibleWhen::NotEquals { field, value } => VisibleWhen::NotEquals {
                field: resolve(field)?,
                value: value.clone(),
            },
            VisibleWhen::In { field, values } => VisibleWhen::In {
                field: resolve(field)?,
                values: values.clone(),
            },
            VisibleWhen::IsSet { field } => VisibleWhen::IsSet {
                field: resolve(field)?,
            },
            VisibleWhen::All { conditions } => VisibleWhen::All {
                conditions: conditions
                    .iter()
                    .map(|c| c.map_references(resolve))
                    .collect::<Result<_, _>>()?,
            },
            VisibleWhen::Any { conditions } => VisibleWhen::Any {
                conditions: conditions
                    .iter()
                    .map(|c| c.map_references(resolve))
                    .collect::<Result<_, _>>()?,
            },
            VisibleWhen::Not { condition } => VisibleWhen::Not {
                condition: Box::new(condition.map_references(resolve)?),
            },
        })
    }

    /// Evaluate against a lookup returning the current (visible) value of a field
    pub fn evaluate<'v>(&self, lookup: &mut dyn FnMut(&str) -> Option<&'v Value>) -> bool {
        match self {
            VisibleWhen::Equals { field, value } => {
                lookup(field).is_some_and(|current| values_match(current, value))
            }
            VisibleWhen::NotEquals { field, value } => {
                !lookup(field).is_some_and(|current| values_match(current, value))
            }
            VisibleWhen::In { field, values } => lookup(field)
                .is_some_and(|current| values.iter().any(|v| values_match(current, v))),
            VisibleWhen::IsSet { field } => lookup(field).is_some_and(|v| !is_empty_value(v)),
            VisibleWhen::All { conditions } => conditions.iter().all(|c| c.evaluate(lookup)),
            VisibleWhen::Any { conditions } => conditions.iter().any(|c| c.evaluate(lookup)),
            VisibleWhen::Not { condition } => !condition.evaluate(lookup),
        }
    }
}

/// JSON equality with numbers compared numerically (1 == 1.0)
pub fn values_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Null, blank strings and empty arrays count as "no value"
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
