use serde::{Deserialize, Serialize};

/// Code filter of a data requirement: a path into the resource and the value
/// set its codes must belong to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_set: Option<String>,
}

impl CodeFilter {
    pub const CODE_PATH: &'static str = "code";

    pub fn on_code(value_set: impl Into<String>) -> Self {
        Self {
            path: Some(Self::CODE_PATH.to_string()),
            value_set: Some(value_set.into()),
        }
    }

    pub fn is_code_path(&self) -> bool {
        self.path.as_deref() == Some(Self::CODE_PATH)
    }
}

/// Input or output data declared by an action.
///
/// The `id` labels the resources produced or consumed for this requirement
/// inside a processing context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequirement {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profile: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_filter: Vec<CodeFilter>,
}

impl DataRequirement {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            profile: Vec::new(),
            code_filter: Vec::new(),
        }
    }

    pub fn with_code_filter(mut self, filter: CodeFilter) -> Self {
        self.code_filter.push(filter);
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile.push(profile.into());
        self
    }

    pub fn has_code_filter(&self) -> bool {
        !self.code_filter.is_empty()
    }
}
