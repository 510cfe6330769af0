//! Rust libtest text output, as printed by `cargo test`.

use std::collections::HashMap;

use super::{NormalizedResult, ParseError, Summary, TestCase, TestStatus};

pub fn parse(raw: &str) -> Result<NormalizedResult, ParseError> {
    let mut tests: Vec<TestCase> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut announced: u32 = 0;
    let mut runs: u32 = 0;
    let mut summaries: Vec<Summary> = Vec::new();
    // Name of the test whose captured output block we are inside.
    let mut current: Option<String> = None;

    for line in raw.lines() {
        let line = line.trim_end();

        if let Some(count) = parse_running(line) {
            announced = announced.saturating_add(count);
            runs += 1;
            current = None;
            continue;
        }

        if let Some(rest) = line.strip_prefix("test result: ") {
            if let Some(summary) = parse_summary(rest) {
                summaries.push(summary);
            }
            current = None;
            continue;
        }

        if let Some(name) = line
            .strip_prefix("---- ")
            .and_then(|rest| rest.strip_suffix(" stdout ----"))
        {
            current = Some(name.to_string());
            continue;
        }

        if line == "failures:" {
            current = None;
            continue;
        }

        if let Some(rest) = line.strip_prefix("test ") {
            if let Some((name, status)) = rest.split_once(" ... ") {
                let status = match status.trim() {
                    "ok" => TestStatus::Passed,
                    "FAILED" => TestStatus::Failed,
                    s if s.starts_with("ignored") => TestStatus::Skipped,
                    "" => TestStatus::Unknown,
                    // Benchmarks and anything else libtest prints on this line.
                    _ => continue,
                };
                upsert(&mut tests, &mut by_name, TestCase::new(name.trim(), status));
                continue;
            }
            if let Some(name) = rest.strip_suffix(" ...") {
                // Killed before the result was written.
                upsert(&mut tests, &mut by_name, TestCase::new(name.trim(), TestStatus::Unknown));
                continue;
            }
        }

        if let Some(name) = &current {
            let idx = match by_name.get(name) {
                Some(&idx) => idx,
                None => {
                    let case = TestCase::new(name.clone(), TestStatus::Failed);
                    upsert(&mut tests, &mut by_name, case);
                    tests.len() - 1
                }
            };
            apply_detail(&mut tests[idx], line);
        }
    }

    if tests.is_empty() && summaries.is_empty() && runs == 0 {
        return Err(ParseError::Unrecognized);
    }

    if (summaries.len() as u32) < runs || summaries.is_empty() {
        return Ok(NormalizedResult::truncated_from(tests, announced));
    }

    let summary = summaries.into_iter().fold(Summary::default(), Summary::merge);

    Ok(NormalizedResult {
        summary,
        tests,
        artifacts: Vec::new(),
        truncated: false,
    })
}

fn upsert(tests: &mut Vec<TestCase>, by_name: &mut HashMap<String, usize>, case: TestCase) {
    match by_name.get(&case.name) {
        Some(&idx) => tests[idx].status = case.status,
        None => {
            by_name.insert(case.name.clone(), tests.len());
            tests.push(case);
        }
    }
}

fn parse_running(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("running ")?;
    let count = rest
        .strip_suffix(" tests")
        .or_else(|| rest.strip_suffix(" test"))?;
    count.trim().parse().ok()
}

/// `ok. 5 passed; 0 failed; 1 ignored; 0 measured; 0 filtered out; finished in 0.01s`
fn parse_summary(rest: &str) -> Option<Summary> {
    let (_, counts) = rest.split_once(". ")?;
    let mut summary = Summary::default();
    let mut matched = false;
    for part in counts.split(';') {
        let mut words = part.split_whitespace();
        let (Some(n), Some(label)) = (words.next(), words.next()) else {
            continue;
        };
        let Ok(n) = n.parse::<u32>() else { continue };
        match label {
            "passed" => summary.passed = n,
            "failed" => summary.failed = n,
            "ignored" => summary.skipped = n,
            _ => continue,
        }
        matched = true;
    }
    if !matched {
        return None;
    }
    summary.recount();
    Some(summary)
}

fn apply_detail(case: &mut TestCase, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty()
        || trimmed.starts_with("note: ")
        || trimmed.starts_with("stack backtrace")
    {
        return;
    }

    if let Some(idx) = trimmed.find("panicked at ") {
        let rest = &trimmed[idx + "panicked at ".len()..];
        if let Some(quoted) = rest.strip_prefix('\'') {
            // Pre-1.73 format: panicked at 'message', src/lib.rs:10:5
            if let Some((message, location)) = quoted.rsplit_once("', ") {
                case.message.get_or_insert_with(|| message.to_string());
                case.location = Some(location.trim_end_matches(':').to_string());
            }
        } else {
            case.location = Some(rest.trim_end_matches(':').to_string());
        }
        return;
    }

    if let Some(value) = trimmed.strip_prefix("left:") {
        case.actual = Some(clean_value(value));
        return;
    }
    if let Some(value) = trimmed.strip_prefix("right:") {
        // The old format closes the panic message on this line: `2`', src/lib.rs:7:5
        let value = match value.rsplit_once("', ") {
            Some((value, location)) => {
                case.location = Some(location.trim().to_string());
                value
            }
            None => value,
        };
        case.expected = Some(clean_value(value));
        return;
    }

    if case.message.is_none() {
        case.message = Some(trimmed.to_string());
    }
}

fn clean_value(value: &str) -> String {
    value
        .trim()
        .trim_end_matches(',')
        .trim_matches('`')
        .to_string()
}
