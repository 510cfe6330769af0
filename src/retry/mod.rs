//! Retry policy engine: per-classification ceilings, backoff, and the
//! failure context carried into the next attempt.

mod backoff;
mod context;
mod policy;

pub use backoff::Backoff;
pub use context::{FailingTest, FailureSummary, HintRouter, append_context};
pub use policy::{Decision, RetryPolicy};
