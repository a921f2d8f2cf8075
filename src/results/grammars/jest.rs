use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::{split_message, strip_ansi};
use crate::results::{Framework, ParsedFailure, ParsedTestResult};

/// `at fn (path/to/file.test.ts:12:5)` or `at path/to/file.test.ts:12:5`
static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"at (?:.*?\()?([^\s()]+):(\d+):\d+\)?").expect("FRAME_RE regex should compile")
});

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestReport {
    #[serde(default)]
    num_total_tests: Option<u32>,
    #[serde(default)]
    num_passed_tests: u32,
    #[serde(default)]
    num_failed_tests: u32,
    #[serde(default)]
    num_pending_tests: u32,
    #[serde(default)]
    num_todo_tests: u32,
    #[serde(default)]
    test_results: Vec<JestSuite>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestSuite {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    assertion_results: Vec<JestAssertion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestAssertion {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    failure_messages: Vec<String>,
    #[serde(default)]
    location: Option<JestLocation>,
}

#[derive(Debug, Deserialize)]
struct JestLocation {
    line: u32,
}

/// Whether `raw` carries a Jest/Vitest `--json` envelope.
pub fn detect(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    (trimmed.starts_with('{') || raw.contains("\n{"))
        && raw.contains("\"testResults\"")
        && (raw.contains("\"numTotalTests\"") || raw.contains("\"assertionResults\""))
}

pub fn parse(raw: &str) -> Option<ParsedTestResult> {
    let report = extract_report(raw)?;

    let mut failures = Vec::new();
    for suite in &report.test_results {
        let mut suite_failures = 0;
        for assertion in &suite.assertion_results {
            if assertion.status != "failed" {
                continue;
            }
            suite_failures += 1;
            failures.push(assertion_failure(&suite.name, assertion));
        }

        // A suite can fail before any assertion runs (syntax error, missing module).
        if suite.status == "failed" && suite_failures == 0 {
            let (message, stack) = split_message(&strip_ansi(&suite.message));
            let message = if message.is_empty() {
                "test suite failed to run".to_string()
            } else {
                message
            };
            failures.push(
                ParsedFailure::new(suite.name.clone(), message)
                    .with_location(Some(suite.name.clone()))
                    .with_stack(stack),
            );
        }
    }

    Some(ParsedTestResult::new(
        Framework::Jest,
        report.num_passed_tests,
        report.num_failed_tests,
        report.num_pending_tests.saturating_add(report.num_todo_tests),
        report.num_total_tests,
        failures,
    ))
}

fn assertion_failure(suite_file: &str, assertion: &JestAssertion) -> ParsedFailure {
    let name = if assertion.full_name.is_empty() {
        assertion.title.clone()
    } else {
        assertion.full_name.clone()
    };

    let text = strip_ansi(&assertion.failure_messages.join("\n"));
    let (message, stack) = split_message(&text);
    let message = if message.is_empty() {
        "test failed".to_string()
    } else {
        message
    };

    let location = stack
        .as_deref()
        .and_then(|s| frame_in_file(s, suite_file))
        .or_else(|| {
            assertion
                .location
                .as_ref()
                .map(|l| format!("{suite_file}:{}", l.line))
        });

    ParsedFailure::new(name, message)
        .with_location(location)
        .with_stack(stack)
}

/// First stack frame pointing into the suite file, falling back to the first frame.
fn frame_in_file(stack: &str, suite_file: &str) -> Option<String> {
    let frames: Vec<String> = FRAME_RE
        .captures_iter(stack)
        .map(|c| format!("{}:{}", &c[1], &c[2]))
        .collect();
    frames
        .iter()
        .find(|f| !suite_file.is_empty() && f.starts_with(suite_file))
        .or_else(|| frames.iter().find(|f| !f.contains("node_modules")))
        .cloned()
}

/// Jest often prints banners around the JSON; take the outermost object.
fn extract_report(raw: &str) -> Option<JestReport> {
    if let Ok(report) = serde_json::from_str::<JestReport>(raw.trim()) {
        return Some(report);
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<JestReport>(&raw[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(passed: usize, failed: usize) -> String {
        let mut assertions = Vec::new();
        for i in 0..passed {
            assertions.push(serde_json::json!({
                "fullName": format!("math passes {i}"),
                "title": format!("passes {i}"),
                "status": "passed",
                "failureMessages": []
            }));
        }
        for i in 0..failed {
            assertions.push(serde_json::json!({
                "fullName": format!("math fails {i}"),
                "title": format!("fails {i}"),
                "status": "failed",
                "failureMessages": [format!(
                    "Error: expect(received).toBe(expected)\n\nExpected: {i}\nReceived: 99\n    at Object.<anonymous> (/app/src/math.test.js:{}:17)\n    at node_modules/jest-circus/build/utils.js:298:28",
                    10 + i
                )]
            }));
        }
        let status = if failed == 0 { "passed" } else { "failed" };
        serde_json::json!({
            "numTotalTests": passed + failed,
            "numPassedTests": passed,
            "numFailedTests": failed,
            "numPendingTests": 0,
            "numTodoTests": 0,
            "success": failed == 0,
            "testResults": [{
                "name": "/app/src/math.test.js",
                "status": status,
                "message": "",
                "assertionResults": assertions
            }]
        })
        .to_string()
    }

    #[test]
    fn test_ten_passed_two_failed() {
        let raw = report(10, 2);
        assert!(detect(&raw));

        let r = parse(&raw).unwrap();
        assert_eq!(r.framework, Framework::Jest);
        assert_eq!(r.total, 12);
        assert_eq!(r.passed, 10);
        assert_eq!(r.failed, 2);
        assert_eq!(r.failures.len(), 2);
        assert_eq!(r.failures[0].name, "math fails 0");
        assert_eq!(r.failures[1].name, "math fails 1");
        assert_eq!(r.failures[0].message, "Error: expect(received).toBe(expected)");
        assert_eq!(
            r.failures[0].location.as_deref(),
            Some("/app/src/math.test.js:10")
        );
        assert!(r.failures[0].stack.as_deref().unwrap().contains("Received: 99"));
        assert!(!r.partial);
    }

    #[test]
    fn test_banner_around_json() {
        let raw = format!("> app@1.0.0 test\n> jest --json\n\n{}\nDone in 3.2s\n", report(1, 1));
        let r = parse(&raw).unwrap();
        assert_eq!(r.total, 2);
        assert_eq!(r.failures.len(), 1);
    }

    #[test]
    fn test_suite_failed_to_run() {
        let raw = serde_json::json!({
            "numTotalTests": 0,
            "numPassedTests": 0,
            "numFailedTests": 0,
            "testResults": [{
                "name": "/app/src/broken.test.js",
                "status": "failed",
                "message": "\u{1b}[1mTest suite failed to run\u{1b}[22m\n\n    Cannot find module './missing'",
                "assertionResults": []
            }]
        })
        .to_string();

        let r = parse(&raw).unwrap();
        assert_eq!(r.failed, 1);
        assert_eq!(r.failures[0].name, "/app/src/broken.test.js");
        assert_eq!(r.failures[0].message, "Test suite failed to run");
    }

    #[test]
    fn test_not_json() {
        assert!(parse("PASS src/a.test.js").is_none());
    }
}
