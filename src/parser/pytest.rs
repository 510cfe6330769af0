//! pytest text output. Works best with `-v -rA`, which prints one line per
//! test and a short summary of every outcome.

use super::{NormalizedResult, ParseError, Summary, TestCase, TestStatus};

pub fn parse(raw: &str) -> Result<NormalizedResult, ParseError> {
    let mut tests: Vec<TestCase> = Vec::new();
    let mut announced: u32 = 0;
    let mut summary: Option<Summary> = None;
    let mut current: Option<usize> = None;

    for line in raw.lines() {
        let line = line.trim_end();

        if let Some(count) = parse_collected(line) {
            announced = count;
            continue;
        }

        if line.starts_with('=') {
            current = None;
            if let Some(parsed) = parse_final_summary(line) {
                summary = Some(parsed);
            }
            continue;
        }

        if let Some(name) = section_header(line) {
            let idx = find_or_insert(&mut tests, name);
            current = Some(idx);
            continue;
        }

        if let Some((status, node_id, message)) = parse_short_summary(line) {
            let idx = find_or_insert(&mut tests, node_id);
            tests[idx].status = status;
            if let Some(message) = message {
                tests[idx].message.get_or_insert(message);
            }
            continue;
        }

        if let Some((node_id, status)) = parse_verbose(line) {
            let idx = find_or_insert(&mut tests, node_id);
            tests[idx].status = status;
            continue;
        }

        if let Some(idx) = current {
            apply_detail(&mut tests[idx], line);
        }
    }

    if tests.is_empty() && summary.is_none() && announced == 0 {
        return Err(ParseError::Unrecognized);
    }

    match summary {
        Some(summary) => Ok(NormalizedResult {
            summary,
            tests,
            artifacts: Vec::new(),
            truncated: false,
        }),
        None => Ok(NormalizedResult::truncated_from(tests, announced)),
    }
}

fn parse_collected(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("collected ")?;
    rest.split_whitespace().next()?.parse().ok()
}

fn status_from(word: &str) -> Option<TestStatus> {
    match word {
        "PASSED" | "XPASS" => Some(TestStatus::Passed),
        "FAILED" | "ERROR" => Some(TestStatus::Failed),
        "SKIPPED" | "XFAIL" => Some(TestStatus::Skipped),
        _ => None,
    }
}

/// `tests/test_math.py::test_add PASSED   [ 25%]`
fn parse_verbose(line: &str) -> Option<(&str, TestStatus)> {
    let mut words = line.split_whitespace();
    let node_id = words.next()?;
    if !node_id.contains("::") {
        return None;
    }
    // A node id without a status is a test that was still running when the
    // output stopped.
    let status = words.next().and_then(status_from).unwrap_or(TestStatus::Unknown);
    Some((node_id, status))
}

/// `FAILED tests/test_math.py::test_sub - assert 2 == 3`
fn parse_short_summary(line: &str) -> Option<(TestStatus, &str, Option<String>)> {
    let (word, rest) = line.split_once(' ')?;
    let status = status_from(word)?;
    let (node_id, message) = match rest.split_once(" - ") {
        Some((node_id, message)) => (node_id.trim(), Some(message.trim().to_string())),
        None => (rest.trim(), None),
    };
    if !node_id.contains("::") {
        return None;
    }
    Some((status, node_id, message))
}

/// `______ test_sub ______` or `______ TestMath.test_sub ______`
fn section_header(line: &str) -> Option<&str> {
    if !line.starts_with("__") || !line.ends_with("__") {
        return None;
    }
    let name = line.trim_matches('_').trim();
    if name.is_empty() || name.starts_with("ERROR") {
        return None;
    }
    Some(name)
}

/// `==== 1 failed, 2 passed, 1 skipped in 0.05s ====`
fn parse_final_summary(line: &str) -> Option<Summary> {
    let inner = line.trim_matches('=').trim();
    let (counts, _) = inner.rsplit_once(" in ")?;
    let mut summary = Summary::default();
    let mut matched = false;
    for part in counts.split(',') {
        let mut words = part.split_whitespace();
        let (Some(n), Some(label)) = (words.next(), words.next()) else {
            continue;
        };
        let Ok(n) = n.parse::<u32>() else { continue };
        match label {
            "passed" | "xpassed" => summary.passed = summary.passed.saturating_add(n),
            "failed" | "error" | "errors" => summary.failed = summary.failed.saturating_add(n),
            "skipped" | "xfailed" => summary.skipped = summary.skipped.saturating_add(n),
            _ => continue,
        }
        matched = true;
    }
    if !matched && !counts.contains("no tests ran") {
        return None;
    }
    summary.recount();
    Some(summary)
}

fn find_or_insert(tests: &mut Vec<TestCase>, name: &str) -> usize {
    let dotted = name.replace('.', "::");
    let suffix = format!("::{dotted}");
    if let Some(idx) = tests
        .iter()
        .position(|t| t.name == name || t.name.ends_with(&suffix))
    {
        return idx;
    }
    // A detail header seen before its node id: later lines will rename it.
    if let Some(idx) = tests
        .iter()
        .position(|t| name.ends_with(&format!("::{}", t.name)))
    {
        tests[idx].name = name.to_string();
        return idx;
    }
    tests.push(TestCase::new(name, TestStatus::Failed));
    tests.len() - 1
}

fn apply_detail(case: &mut TestCase, line: &str) {
    if let Some(error) = line.strip_prefix('E') {
        let error = error.trim();
        if error.is_empty() || error.starts_with('+') {
            return;
        }
        if case.message.is_none() {
            case.message = Some(error.to_string());
        }
        if let Some(expr) = error.strip_prefix("assert ") {
            if let Some((actual, expected)) = expr.split_once(" == ") {
                case.actual.get_or_insert_with(|| actual.trim().to_string());
                case.expected.get_or_insert_with(|| expected.trim().to_string());
            }
        }
        return;
    }

    // `tests/test_math.py:8: AssertionError`
    if let Some((location, _)) = line.split_once(": ") {
        if let Some((file, line_no)) = location.rsplit_once(':') {
            if file.ends_with(".py") && line_no.chars().all(|c| c.is_ascii_digit()) {
                case.location = Some(location.to_string());
            }
        }
    }
}
