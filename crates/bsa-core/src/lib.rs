pub mod error;
pub mod requirement;
pub mod resource;
pub mod terminology;
pub mod time;

pub use error::{CoreError, Result};
pub use requirement::{CodeFilter, DataRequirement};
pub use resource::{CODE_FILTERABLE_TYPES, Resource};
pub use terminology::{CodeableConcept, Coding, ConceptReference, ConceptSet, ValueSet, ValueSetCompose};
pub use time::{FhirDateTime, FhirDuration, now_utc};
