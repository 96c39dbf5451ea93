//! Built-in action-type executors.

mod check_trigger_codes;
mod collect_data;
mod submit_report;
mod terminate;
mod workflow;

pub use check_trigger_codes::CheckTriggerCodes;
pub use collect_data::{CollectData, EhrQueryService, NoopEhrQuery};
pub use submit_report::{LoggingSubmitter, ReportSubmitter, SubmitReport, Submission};
pub use terminate::Terminate;
pub use workflow::WorkflowStep;
