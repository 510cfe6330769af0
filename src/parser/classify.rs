//! Turns an exited runner into a [`FailureClassification`].
//!
//! Supervisor-level outcomes (timeout, stall, cancellation, spawn failure)
//! are classified by the coordinator before this point; here we only look at
//! how the process exited, what the parser made of its output, and keywords
//! in the raw output.

use std::time::Duration;

use super::{NormalizedResult, OutputFormat, ParseError, clip};
use crate::state_machine::FailureClassification;

const MESSAGE_LIMIT: usize = 300;

/// How the runner process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A classified failure with the diagnostic line that triggered it.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    pub classification: FailureClassification,
    pub message: String,
    /// Provider-supplied wait for rate-limited runs.
    pub retry_after: Option<Duration>,
}

impl Diagnosis {
    pub fn new(classification: FailureClassification, message: impl Into<String>) -> Self {
        Self {
            classification,
            message: clip(&message.into(), MESSAGE_LIMIT),
            retry_after: None,
        }
    }
}

/// Keyword table, checked in order. The first class with a hit wins.
const KEYWORDS: &[(FailureClassification, &[&str])] = &[
    (
        FailureClassification::GitConflict,
        &["conflict (content)", "merge conflict in", "<<<<<<< ", "unmerged paths", "needs merge"],
    ),
    (
        FailureClassification::PermissionError,
        &["permission denied", "eacces", "operation not permitted", "eperm"],
    ),
    (
        FailureClassification::MissingDependency,
        &[
            "command not found",
            "modulenotfounderror",
            "no module named",
            "cannot find module",
            "no such command",
            "is not installed",
            "package not found",
        ],
    ),
    (
        FailureClassification::RateLimited,
        &["rate limit", "rate-limited", "too many requests", "status 429", "http 429"],
    ),
    (
        FailureClassification::ResourceExhausted,
        &[
            "out of memory",
            "cannot allocate memory",
            "memory allocation of",
            "no space left on device",
            "enospc",
            "enomem",
            "too many open files",
        ],
    ),
    (
        FailureClassification::CompilationError,
        &[
            "error[e",
            "could not compile",
            "syntaxerror",
            "compilation failed",
            "compile error",
            "cannot find symbol",
            "undefined reference",
            "error ts",
        ],
    ),
    (
        FailureClassification::RuntimeCrash,
        &[
            "segmentation fault",
            "core dumped",
            "sigsegv",
            "sigabrt",
            "stack overflow",
            "fatal runtime error",
            "panicked at",
            "traceback (most recent call last)",
        ],
    ),
];

/// Scan raw output for a known failure signature.
pub fn scan_output(output: &str) -> Option<Diagnosis> {
    let lowered: Vec<(String, &str)> = output
        .lines()
        .map(|line| (line.to_lowercase(), line))
        .collect();

    for (classification, needles) in KEYWORDS {
        let hit = lowered
            .iter()
            .find(|(lower, _)| needles.iter().any(|needle| lower.contains(needle)));
        if let Some((_, line)) = hit {
            let mut diagnosis = Diagnosis::new(*classification, line.trim());
            if *classification == FailureClassification::RateLimited {
                diagnosis.retry_after = parse_retry_after(output);
            }
            return Some(diagnosis);
        }
    }
    None
}

/// Find a provider retry hint such as `Retry-After: 30` or `retry after 12s`.
pub fn parse_retry_after(output: &str) -> Option<Duration> {
    let lower = output.to_lowercase();
    for marker in ["retry-after", "retry after", "retry in"] {
        let mut search = lower.as_str();
        while let Some(idx) = search.find(marker) {
            let rest = &search[idx + marker.len()..];
            let digits: String = rest
                .trim_start_matches([':', ' ', '='])
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(secs) = digits.parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
            search = rest;
        }
    }
    None
}

/// Classify an attempt whose runner exited on its own. `None` means success.
///
/// A clean exit with no recognisable report counts as success when the
/// framework did not declare a structured format; plain scripts are judged by
/// their exit code alone.
pub fn classify_exit(
    exit: ExitInfo,
    parsed: &Result<NormalizedResult, ParseError>,
    format: OutputFormat,
    output: &str,
) -> Option<Diagnosis> {
    if let Ok(result) = parsed {
        if result.summary.failed > 0 {
            let names: Vec<&str> = result
                .failing_tests()
                .take(5)
                .map(|t| t.name.as_str())
                .collect();
            let mut message = format!(
                "{} of {} tests failed",
                result.summary.failed, result.summary.total
            );
            if !names.is_empty() {
                message.push_str(": ");
                message.push_str(&names.join(", "));
            }
            return Some(Diagnosis::new(FailureClassification::TestFailure, message));
        }
        if exit.success() {
            return None;
        }
    }
    if exit.success()
        && format == OutputFormat::Auto
        && matches!(parsed, Err(ParseError::Unrecognized))
    {
        return None;
    }

    if let Some(signal) = exit.signal {
        // Nobody in this process sent it, so assume the OOM killer.
        if signal == 9 {
            return Some(Diagnosis::new(
                FailureClassification::ResourceExhausted,
                "runner killed by SIGKILL (likely out of memory)",
            ));
        }
        return Some(Diagnosis::new(
            FailureClassification::RuntimeCrash,
            format!("runner terminated by signal {signal}"),
        ));
    }

    if let Some(diagnosis) = scan_output(output) {
        return Some(diagnosis);
    }

    match parsed {
        Err(err) => Some(Diagnosis::new(
            FailureClassification::Unknown,
            format!("could not parse runner output: {err}"),
        )),
        Ok(_) => Some(Diagnosis::new(
            FailureClassification::Unknown,
            format!("runner exited with code {}", exit.code.unwrap_or(-1)),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Summary, TestCase, TestStatus};

    fn exited(code: i32) -> ExitInfo {
        ExitInfo {
            code: Some(code),
            signal: None,
        }
    }

    fn result_with(passed: u32, failed: u32) -> NormalizedResult {
        let mut tests = Vec::new();
        for i in 0..passed {
            tests.push(TestCase::new(format!("ok_{i}"), TestStatus::Passed));
        }
        for i in 0..failed {
            tests.push(TestCase::new(format!("bad_{i}"), TestStatus::Failed));
        }
        NormalizedResult {
            summary: Summary::tally(&tests),
            tests,
            ..Default::default()
        }
    }

    #[test]
    fn clean_exit_is_success() {
        assert_eq!(classify_exit(exited(0), &Ok(result_with(5, 0)), OutputFormat::Auto, ""), None);
    }

    #[test]
    fn failed_tests_win_over_keywords() {
        let parsed = Ok(result_with(3, 2));
        let diagnosis =
            classify_exit(exited(1), &parsed, OutputFormat::Libtest, "permission denied").unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::TestFailure);
        assert_eq!(diagnosis.message, "2 of 5 tests failed: bad_0, bad_1");
    }

    #[test]
    fn compile_errors_from_output() {
        let output = "error[E0425]: cannot find value `x` in this scope\nerror: could not compile `app`";
        let diagnosis =
            classify_exit(exited(101), &Err(ParseError::Unrecognized), OutputFormat::Auto, output)
                .unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::CompilationError);
        assert!(diagnosis.message.starts_with("error[E0425]"));
    }

    #[test]
    fn missing_binary_from_shell() {
        let diagnosis = classify_exit(
            exited(127),
            &Err(ParseError::Unrecognized),
            OutputFormat::Auto,
            "sh: 1: pytest: command not found",
        )
        .unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::MissingDependency);
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let output = "upstream said: 429 Too Many Requests\nRetry-After: 42";
        let diagnosis = scan_output(output).unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::RateLimited);
        assert_eq!(diagnosis.retry_after, Some(Duration::from_secs(42)));
    }

    #[test]
    fn retry_after_variants() {
        assert_eq!(parse_retry_after("please retry after 7s"), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("retry-after=3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("retry later"), None);
    }

    #[test]
    fn sigkill_means_resource_exhaustion() {
        let exit = ExitInfo {
            code: None,
            signal: Some(9),
        };
        let diagnosis =
            classify_exit(exit, &Err(ParseError::Unrecognized), OutputFormat::Auto, "").unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::ResourceExhausted);

        let exit = ExitInfo {
            code: None,
            signal: Some(11),
        };
        let diagnosis =
            classify_exit(exit, &Err(ParseError::Unrecognized), OutputFormat::Auto, "").unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::RuntimeCrash);
    }

    #[test]
    fn plain_script_exiting_zero_succeeds() {
        let unrecognized = Err(ParseError::Unrecognized);
        assert_eq!(classify_exit(exited(0), &unrecognized, OutputFormat::Auto, ""), None);
        assert_eq!(
            classify_exit(exited(0), &unrecognized, OutputFormat::Auto, "deployed ok\n"),
            None
        );
    }

    #[test]
    fn unparseable_output_degrades_to_unknown() {
        // A declared structured format that produced nothing is suspicious.
        let diagnosis =
            classify_exit(exited(0), &Err(ParseError::Unrecognized), OutputFormat::Pytest, "hello")
                .unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::Unknown);

        let diagnosis =
            classify_exit(exited(2), &Err(ParseError::Unrecognized), OutputFormat::Auto, "hello")
                .unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::Unknown);

        let diagnosis =
            classify_exit(exited(3), &Ok(result_with(2, 0)), OutputFormat::Auto, "").unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::Unknown);
        assert_eq!(diagnosis.message, "runner exited with code 3");
    }

    #[test]
    fn merge_markers_are_git_conflicts() {
        let diagnosis = scan_output("src/lib.rs:\n<<<<<<< HEAD\nfn a() {}").unwrap();
        assert_eq!(diagnosis.classification, FailureClassification::GitConflict);
    }
}
