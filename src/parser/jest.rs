//! Jest `--json` reports.

use serde::Deserialize;

use super::{NormalizedResult, OutputFormat, ParseError, Summary, TestCase, TestStatus};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestReport {
    num_total_tests: u32,
    num_passed_tests: u32,
    num_failed_tests: u32,
    #[serde(default)]
    num_pending_tests: u32,
    #[serde(default)]
    num_todo_tests: u32,
    #[serde(default)]
    test_results: Vec<JestFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestFile {
    name: String,
    #[serde(default)]
    assertion_results: Vec<JestAssertion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestAssertion {
    full_name: String,
    status: String,
    #[serde(default)]
    failure_messages: Vec<String>,
    #[serde(default)]
    location: Option<JestLocation>,
}

#[derive(Debug, Deserialize)]
struct JestLocation {
    line: u32,
    column: u32,
}

pub fn parse(raw: &str) -> Result<NormalizedResult, ParseError> {
    // Jest may print console noise around the report.
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return Err(ParseError::Unrecognized);
    };
    if end < start {
        return Err(ParseError::Unrecognized);
    }
    let report: JestReport =
        serde_json::from_str(&raw[start..=end]).map_err(|e| ParseError::Malformed {
            format: OutputFormat::JestJson,
            message: e.to_string(),
        })?;

    let mut tests = Vec::new();
    for file in &report.test_results {
        for assertion in &file.assertion_results {
            let status = match assertion.status.as_str() {
                "passed" => TestStatus::Passed,
                "failed" => TestStatus::Failed,
                "pending" | "skipped" | "todo" | "disabled" => TestStatus::Skipped,
                _ => TestStatus::Unknown,
            };
            let mut case = TestCase::new(assertion.full_name.clone(), status);
            case.location = assertion
                .location
                .as_ref()
                .map(|loc| format!("{}:{}:{}", file.name, loc.line, loc.column));
            if let Some(message) = assertion.failure_messages.first() {
                apply_failure_message(&mut case, message);
            }
            tests.push(case);
        }
    }

    let skipped = report.num_pending_tests.saturating_add(report.num_todo_tests);
    let reported = report
        .num_passed_tests
        .saturating_add(report.num_failed_tests)
        .saturating_add(skipped);
    let summary = Summary {
        total: report.num_total_tests,
        passed: report.num_passed_tests,
        failed: report.num_failed_tests,
        skipped,
        unknown: report.num_total_tests.saturating_sub(reported),
    };

    Ok(NormalizedResult {
        summary,
        tests,
        artifacts: Vec::new(),
        truncated: false,
    })
}

fn apply_failure_message(case: &mut TestCase, message: &str) {
    for line in message.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Expected:") {
            case.expected.get_or_insert_with(|| value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Received:") {
            case.actual.get_or_insert_with(|| value.trim().to_string());
        } else if !line.is_empty() && case.message.is_none() {
            case.message = Some(line.to_string());
        }
    }
}
