//! Normalizes raw test-runner output into a [`NormalizedResult`].
//!
//! Each supported output format has its own module. All of them tolerate
//! truncated output: whatever records parsed are kept, tests that were
//! announced but never reported are counted as `unknown`, and the result is
//! flagged `truncated`. Output with nothing recognisable in it is a
//! [`ParseError`], which the coordinator degrades to an `Unknown` failure.

pub mod classify;
mod jest;
mod jsonl;
mod libtest;
mod pytest;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use classify::{Diagnosis, ExitInfo, classify_exit, parse_retry_after, scan_output};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, status: TestStatus) -> Self {
        Self {
            name: name.into(),
            status,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    #[serde(default)]
    pub unknown: u32,
}

impl Summary {
    /// Count statuses of individual test records.
    pub fn tally(tests: &[TestCase]) -> Self {
        let mut summary = Summary::default();
        for test in tests {
            match test.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed => summary.failed += 1,
                TestStatus::Skipped => summary.skipped += 1,
                TestStatus::Unknown => summary.unknown += 1,
            }
        }
        summary.recount();
        summary
    }

    /// Sum of the per-status counts. Counts come from runner output, so
    /// overflow saturates instead of panicking.
    pub fn counted(&self) -> u32 {
        self.passed
            .saturating_add(self.failed)
            .saturating_add(self.skipped)
            .saturating_add(self.unknown)
    }

    pub fn recount(&mut self) {
        self.total = self.counted();
    }

    /// Combine the summaries of several test binaries.
    pub fn merge(self, other: Summary) -> Summary {
        let mut merged = Summary {
            total: 0,
            passed: self.passed.saturating_add(other.passed),
            failed: self.failed.saturating_add(other.failed),
            skipped: self.skipped.saturating_add(other.skipped),
            unknown: self.unknown.saturating_add(other.unknown),
        };
        merged.recount();
        merged
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub summary: Summary,
    pub tests: Vec<TestCase>,
    pub artifacts: Vec<Artifact>,
    /// Output ended before the runner reported its own summary.
    #[serde(default)]
    pub truncated: bool,
}

impl NormalizedResult {
    pub fn failing_tests(&self) -> impl Iterator<Item = &TestCase> {
        self.tests.iter().filter(|t| t.status == TestStatus::Failed)
    }

    /// Summary for output cut short: trust the records, and count announced
    /// tests that never reported as unknown.
    fn truncated_from(tests: Vec<TestCase>, announced: u32) -> Self {
        let mut summary = Summary::tally(&tests);
        if announced > summary.total {
            summary.unknown += announced - summary.total;
            summary.total = announced;
        }
        Self {
            summary,
            tests,
            artifacts: Vec::new(),
            truncated: true,
        }
    }
}

/// Output format a framework's runner produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Rust libtest text output (`cargo test`).
    Libtest,
    /// pytest text output, ideally with `-rA`.
    Pytest,
    /// Jest `--json` report.
    JestJson,
    /// One JSON event per line (`{"type": "test", ...}`).
    JsonLines,
    #[default]
    Auto,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Libtest => "libtest",
            OutputFormat::Pytest => "pytest",
            OutputFormat::JestJson => "jest_json",
            OutputFormat::JsonLines => "json_lines",
            OutputFormat::Auto => "auto",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no recognisable test output")]
    Unrecognized,

    #[error("malformed {format} payload: {message}")]
    Malformed { format: OutputFormat, message: String },
}

/// Parse raw runner output in the given format.
pub fn parse(raw: &str, format: OutputFormat) -> Result<NormalizedResult, ParseError> {
    match format {
        OutputFormat::Libtest => libtest::parse(raw),
        OutputFormat::Pytest => pytest::parse(raw),
        OutputFormat::JestJson => jest::parse(raw),
        OutputFormat::JsonLines => jsonl::parse(raw),
        OutputFormat::Auto => detect(raw),
    }
}

fn detect(raw: &str) -> Result<NormalizedResult, ParseError> {
    if raw.contains("\"numTotalTests\"") {
        return jest::parse(raw);
    }
    jsonl::parse(raw)
        .or_else(|_| libtest::parse(raw))
        .or_else(|_| pytest::parse(raw))
}

/// Truncate `text` to at most `max` characters, appending an ellipsis when cut.
pub(crate) fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max).collect();
    clipped.push('…');
    clipped
}
