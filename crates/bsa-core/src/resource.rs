use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::terminology::CodeableConcept;

/// Resource types whose primary `code` element can be matched against a value set.
pub const CODE_FILTERABLE_TYPES: &[&str] = &[
    "Condition",
    "Observation",
    "Procedure",
    "DiagnosticReport",
    "ServiceRequest",
];

/// A clinical resource held as raw FHIR JSON.
///
/// Only `resourceType` and `id` are required; everything else is read on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Value);

impl Resource {
    pub fn from_value(value: Value) -> Result<Self> {
        if value.get("resourceType").and_then(Value::as_str).is_none() {
            return Err(CoreError::invalid_resource("Missing resourceType"));
        }
        Ok(Self(value))
    }

    pub fn resource_type(&self) -> &str {
        self.0
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// `Type/id`, used to deduplicate resources inside a context.
    pub fn key(&self) -> String {
        format!("{}/{}", self.resource_type(), self.id().unwrap_or("_"))
    }

    pub fn url(&self) -> Option<&str> {
        self.0.get("url").and_then(Value::as_str)
    }

    pub fn version(&self) -> Option<&str> {
        self.0.get("version").and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn is_code_filterable(&self) -> bool {
        CODE_FILTERABLE_TYPES.contains(&self.resource_type())
    }

    /// Read a CodeableConcept element. Malformed elements read as absent.
    pub fn codeable_concept(&self, element: &str) -> Option<CodeableConcept> {
        let raw = self.0.get(element)?;
        match serde_json::from_value::<CodeableConcept>(raw.clone()) {
            Ok(cc) => Some(cc),
            Err(e) => {
                tracing::debug!(
                    resource = %self.key(),
                    element,
                    error = %e,
                    "Ignoring malformed CodeableConcept"
                );
                None
            }
        }
    }

    /// The primary coded attribute (`code`).
    pub fn primary_code(&self) -> Option<CodeableConcept> {
        self.codeable_concept("code")
    }

    /// The coded value element, present on observations with coded results.
    pub fn value_code(&self) -> Option<CodeableConcept> {
        self.codeable_concept("valueCodeableConcept")
    }

    pub fn has_profile(&self, profile: &str) -> bool {
        self.0
            .pointer("/meta/profile")
            .and_then(Value::as_array)
            .is_some_and(|profiles| profiles.iter().any(|p| p.as_str() == Some(profile)))
    }
}

impl TryFrom<Value> for Resource {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}
