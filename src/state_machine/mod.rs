mod failure;
mod job;
mod state;

pub use failure::FailureClassification;
pub use job::{
    AttemptRecord, AuditRecord, FinalOutcome, Job, JobSpec, Priority, ResourceUsage,
};
pub use state::{JobState, StateMachine};
