use thiserror::Error;

/// Core error types for clinical data handling
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid FHIR DateTime: {0}")]
    InvalidDateTime(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid resource data: {message}")]
    InvalidResource { message: String },

    #[error("Dependent resource not found: {resource_type}/{reference}")]
    DependentResourceNotFound {
        resource_type: String,
        reference: String,
    },
}

impl CoreError {
    /// Create a new InvalidDateTime error
    pub fn invalid_date_time(datetime: impl Into<String>) -> Self {
        Self::InvalidDateTime(datetime.into())
    }

    /// Create a new InvalidDuration error
    pub fn invalid_duration(duration: impl Into<String>) -> Self {
        Self::InvalidDuration(duration.into())
    }

    /// Create a new InvalidResource error
    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: message.into(),
        }
    }

    /// Create a new DependentResourceNotFound error
    pub fn dependent_resource_not_found(
        resource_type: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self::DependentResourceNotFound {
            resource_type: resource_type.into(),
            reference: reference.into(),
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
