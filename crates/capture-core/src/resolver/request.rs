//! Data requests: a data source path plus sorted query parameters.

use serde::Serialize;
use std::collections::BTreeMap;

use super::FetchError;
use crate::types::Bindings;

/// Cache and coalescing key. Parameters are kept sorted so equal requests
/// compare equal regardless of binding order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DataRequest {
    pub source: String,
    pub params: BTreeMap<String, String>,
}

impl DataRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Build the request for a widget: `{name}` placeholders in the data
    /// source are filled from the bindings, and every binding not consumed by
    /// a placeholder becomes a query parameter.
    pub fn for_widget(data_source: &str, bindings: &Bindings) -> Result<Self, FetchError> {
        let mut source = String::with_capacity(data_source.len());
        let mut used = Vec::new();
        let mut rest = data_source;

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|i| open + i) else {
                break;
            };
            let name = &rest[open + 1..close];
            let value = bindings
                .get(name)
                .ok_or_else(|| FetchError::MissingParameter(name.to_string()))?;

            source.push_str(&rest[..open]);
            source.push_str(value);
            used.push(name);
            rest = &rest[close + 1..];
        }
        source.push_str(rest);

        let params = bindings
            .iter()
            .filter(|(key, _)| !used.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self { source, params })
    }
}

impl std::fmt::Display for DataRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { '?' } else { '&' }, key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, &str)]) -> Bindings {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_placeholders_fill_path_and_rest_become_params() {
        let request = DataRequest::for_widget(
            "/orgs/{org_id}/units",
            &bindings(&[("org_id", "42"), ("from", "2024-06-01"), ("to", "2024-06-02")]),
        )
        .unwrap();

        assert_eq!(request.source, "/orgs/42/units");
        assert_eq!(request.params.len(), 2);
        assert_eq!(request.to_string(), "/orgs/42/units?from=2024-06-01&to=2024-06-02");
    }

    #[test]
    fn test_missing_placeholder_value() {
        let err = DataRequest::for_widget("/units/{unit_id}", &Bindings::new()).unwrap_err();
        assert!(matches!(err, FetchError::MissingParameter(name) if name == "unit_id"));
    }

    #[test]
    fn test_binding_order_does_not_change_key() {
        let a = DataRequest::new("/x").with_param("b", "2").with_param("a", "1");
        let b = DataRequest::new("/x").with_param("a", "1").with_param("b", "2");
        assert_eq!(a, b);
    }

    #[test]
    fn test_unclosed_brace_is_literal() {
        let request = DataRequest::for_widget("/odd{path", &Bindings::new()).unwrap();
        assert_eq!(request.source, "/odd{path");
    }
}
