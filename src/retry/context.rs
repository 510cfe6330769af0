//! Failure context carried from one attempt into the next.
//!
//! On every retry the engine appends a [`FailureSummary`] to the job's work
//! description, so the agent working on the next attempt sees exactly what
//! broke last time.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::parser::clip;
use crate::state_machine::{AttemptRecord, FailureClassification};

const MAX_FAILING_TESTS: usize = 10;
const VALUE_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailingTest {
    pub name: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub attempt: u32,
    pub classification: FailureClassification,
    pub message: String,
    pub failing_tests: Vec<FailingTest>,
    pub hint: Option<String>,
}

impl FailureSummary {
    pub fn from_attempt(record: &AttemptRecord, classification: FailureClassification) -> Self {
        let message = record.message.clone().unwrap_or_default();
        let failing_tests: Vec<FailingTest> = record
            .result
            .failing_tests()
            .take(MAX_FAILING_TESTS)
            .map(|t| FailingTest {
                name: t.name.clone(),
                expected: t.expected.as_deref().map(|v| clip(v, VALUE_LIMIT)),
                actual: t.actual.as_deref().map(|v| clip(v, VALUE_LIMIT)),
                location: t.location.clone(),
            })
            .collect();

        // Hints look at the runner's own words as well as ours.
        let mut haystack = message.clone();
        for test in record.result.failing_tests() {
            if let Some(m) = &test.message {
                haystack.push('\n');
                haystack.push_str(m);
            }
        }
        haystack.push('\n');
        haystack.push_str(&record.output_tail);

        Self {
            attempt: record.number,
            classification,
            message,
            failing_tests,
            hint: HintRouter::hint(&haystack),
        }
    }

    /// Markdown block appended to the job description.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Attempt {} failed: {}", self.attempt, self.classification);
        if !self.message.is_empty() {
            let _ = writeln!(out, "Error: {}", self.message);
        }
        if !self.failing_tests.is_empty() {
            let _ = writeln!(out, "Failing tests:");
            for test in &self.failing_tests {
                let _ = write!(out, "- {}", test.name);
                if let Some(location) = &test.location {
                    let _ = write!(out, " ({location})");
                }
                if test.expected.is_some() || test.actual.is_some() {
                    let _ = write!(
                        out,
                        ": expected {}, got {}",
                        test.expected.as_deref().unwrap_or("?"),
                        test.actual.as_deref().unwrap_or("?")
                    );
                }
                out.push('\n');
            }
        }
        if let Some(hint) = &self.hint {
            let _ = writeln!(out, "Hint: {hint}");
        }
        out
    }
}

/// Append `summary` to an existing work description.
pub fn append_context(description: &str, summary: &FailureSummary) -> String {
    let block = summary.render();
    if description.trim().is_empty() {
        block
    } else {
        format!("{}\n\n{}", description.trim_end(), block)
    }
}

/// Picks a short remediation hint from error text using weighted keyword scoring.
pub struct HintRouter;

impl HintRouter {
    pub fn hint(text: &str) -> Option<String> {
        let lower = text.to_lowercase();

        let keyword_hints: &[(&str, &str, u32)] = &[
            ("assert", "assertion", 10),
            ("expected", "assertion", 5),
            ("left == right", "assertion", 5),
            ("timed out", "timeout", 10),
            ("timeout", "timeout", 7),
            ("deadline", "timeout", 5),
            ("none", "missing_value", 3),
            ("null", "missing_value", 5),
            ("undefined", "missing_value", 7),
            ("unwrap", "missing_value", 5),
            ("mismatched types", "types", 10),
            ("typeerror", "types", 10),
            ("cannot find", "symbol", 8),
            ("not defined", "symbol", 8),
            ("unresolved import", "symbol", 10),
            ("connection refused", "service", 10),
            ("econnrefused", "service", 10),
            ("address already in use", "service", 7),
            ("conflict", "conflict", 10),
            ("syntax", "syntax", 8),
            ("unexpected token", "syntax", 10),
        ];

        let mut scores: HashMap<&str, u32> = HashMap::new();
        for &(keyword, topic, weight) in keyword_hints {
            if lower.contains(keyword) {
                *scores.entry(topic).or_insert(0) += weight;
            }
        }

        scores
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(topic, _)| Self::text(topic).to_string())
    }

    fn text(topic: &str) -> &'static str {
        match topic {
            "assertion" => {
                "Compare the expected and actual values of the failing assertions before changing code."
            }
            "timeout" => {
                "Look for infinite loops, blocking I/O or a missing test double; the run did not finish in time."
            }
            "missing_value" => {
                "A value was unexpectedly absent; check optional values and initialization order."
            }
            "types" => "Check the types passed across the failing call site.",
            "symbol" => "A referenced name is missing; check imports, spelling and visibility.",
            "service" => "A service the tests depend on is not reachable from the test runtime.",
            "conflict" => "Resolve merge conflict markers in the working tree before retrying.",
            "syntax" => "Fix the syntax error reported by the compiler or interpreter first.",
            _ => "Inspect the runner output attached to the previous attempt.",
        }
    }
}
