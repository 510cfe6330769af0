//! JSON-lines event stream, the structured protocol for custom runners.
//!
//! ```text
//! {"type": "test", "name": "checkout", "status": "failed", "expected": "200", "actual": "500", "location": "api.rs:12"}
//! {"type": "artifact", "name": "screenshot", "path": "out/checkout.png"}
//! {"type": "summary", "total": 1, "passed": 0, "failed": 1, "skipped": 0}
//! ```

use serde::Deserialize;

use super::{Artifact, NormalizedResult, ParseError, Summary, TestCase, TestStatus};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Event {
    Test {
        name: String,
        #[serde(default)]
        status: TestStatus,
        #[serde(default)]
        expected: Option<String>,
        #[serde(default)]
        actual: Option<String>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Summary {
        total: u32,
        passed: u32,
        failed: u32,
        #[serde(default)]
        skipped: u32,
    },
    Artifact {
        name: String,
        path: String,
    },
}

pub fn parse(raw: &str) -> Result<NormalizedResult, ParseError> {
    let mut tests = Vec::new();
    let mut artifacts = Vec::new();
    let mut summary: Option<Summary> = None;
    let mut seen_event = false;
    let mut broken_tail = false;

    let lines: Vec<&str> = raw.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => {
                seen_event = true;
                match event {
                    Event::Test {
                        name,
                        status,
                        expected,
                        actual,
                        location,
                        message,
                    } => tests.push(TestCase {
                        name,
                        status,
                        expected,
                        actual,
                        location,
                        message,
                    }),
                    Event::Summary {
                        total,
                        passed,
                        failed,
                        skipped,
                    } => {
                        summary = Some(Summary {
                            total,
                            passed,
                            failed,
                            skipped,
                            unknown: total.saturating_sub(
                                passed.saturating_add(failed).saturating_add(skipped),
                            ),
                        })
                    }
                    Event::Artifact { name, path } => artifacts.push(Artifact { name, path }),
                }
            }
            // A half-written final record from a killed runner.
            Err(_) if i + 1 == lines.len() && !raw.ends_with('\n') => broken_tail = true,
            Err(_) => {}
        }
    }

    if !seen_event {
        return Err(ParseError::Unrecognized);
    }

    let mut result = match summary {
        Some(summary) if !broken_tail => NormalizedResult {
            summary,
            tests,
            artifacts: Vec::new(),
            truncated: false,
        },
        _ => NormalizedResult::truncated_from(tests, 0),
    };
    result.artifacts = artifacts;
    Ok(result)
}
