//! Pipeline execution: dispatch, outcomes and overall status

pub mod executor;
pub mod outcome;

pub use executor::{ExecutionPolicy, PipelineExecutor, RetryPolicy};
pub use outcome::{
    overall_status, OverallStatus, ResultEnvelope, SkipReason, StageOutcome, StageRecord,
};
