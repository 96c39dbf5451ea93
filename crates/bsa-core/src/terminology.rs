//! Terminology types: codings, codeable concepts and value sets.
//!
//! Only the parts of the FHIR ValueSet resource needed for explicit code
//! membership are modelled; expansions and filters are carried through
//! deserialization but never consulted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: Some(code.into()),
            display: None,
        }
    }

    /// The `system|code` token used to report matches.
    pub fn token(&self) -> Option<String> {
        match (&self.system, &self.code) {
            (Some(system), Some(code)) => Some(format!("{system}|{code}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    pub fn from_coding(coding: Coding) -> Self {
        Self {
            coding: vec![coding],
            text: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptReference {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concept: Vec<ConceptReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_set: Vec<String>,
}

impl ConceptSet {
    /// Whether this include group explicitly enumerates `system|code`.
    pub fn enumerates(&self, system: &str, code: &str) -> bool {
        self.system.as_deref() == Some(system) && self.concept.iter().any(|c| c.code == code)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSetCompose {
    #[serde(default)]
    pub include: Vec<ConceptSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<ConceptSet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSet {
    #[serde(default = "value_set_type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose: Option<ValueSetCompose>,
}

fn value_set_type() -> String {
    "ValueSet".to_string()
}

impl ValueSet {
    pub fn from_value(value: &Value) -> Result<Self> {
        let vs: ValueSet = serde_json::from_value(value.clone())?;
        if vs.resource_type != "ValueSet" {
            return Err(CoreError::invalid_resource(format!(
                "Expected ValueSet, found {}",
                vs.resource_type
            )));
        }
        Ok(vs)
    }

    /// Identifier used in log lines: url, falling back to id.
    pub fn label(&self) -> &str {
        self.url
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or("<anonymous>")
    }

    /// Explicit include groups, or `None` when the value set has no compose.
    pub fn includes(&self) -> Option<&[ConceptSet]> {
        self.compose
            .as_ref()
            .filter(|c| !c.include.is_empty())
            .map(|c| c.include.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_set_from_value() {
        let vs = ValueSet::from_value(&json!({
            "resourceType": "ValueSet",
            "id": "covid",
            "url": "http://example.org/ValueSet/covid",
            "version": "1.0.0",
            "compose": {
                "include": [{"system": "http://snomed.info/sct", "concept": [{"code": "840539006"}]}]
            }
        }))
        .unwrap();

        assert_eq!(vs.label(), "http://example.org/ValueSet/covid");
        let includes = vs.includes().unwrap();
        assert!(includes[0].enumerates("http://snomed.info/sct", "840539006"));
        assert!(!includes[0].enumerates("http://loinc.org", "840539006"));
    }

    #[test]
    fn test_value_set_wrong_type() {
        let err = ValueSet::from_value(&json!({"resourceType": "Library"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_value_set_without_compose() {
        let vs = ValueSet::from_value(&json!({"resourceType": "ValueSet", "id": "empty"})).unwrap();
        assert!(vs.includes().is_none());
        assert_eq!(vs.label(), "empty");
    }

    #[test]
    fn test_coding_token() {
        assert_eq!(
            Coding::new("http://sys", "A").token().as_deref(),
            Some("http://sys|A")
        );
        assert_eq!(Coding::default().token(), None);
    }
}
