//! runlane: a single-lane test coordination server.
//!
//! Many autonomous coding agents share one machine but must not run test
//! suites concurrently. runlane queues their test jobs, runs exactly one at a
//! time under a supervisor, parses the runner output into a normalized
//! result, and retries failures according to their classification and the
//! cost budget.

pub mod budget;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod git;
pub mod notify;
pub mod parser;
pub mod queue;
pub mod retry;
pub mod server;
pub mod state_machine;
pub mod supervisor;
pub mod ui;

pub use error::{Result, RunlaneError};
