use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::strip_ansi;
use crate::results::{Framework, ParsedFailure, ParsedTestResult};

static RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*--- (FAIL|PASS|SKIP): (\S+) \([\d.]+s\)").expect("RESULT_RE regex should compile")
});

static RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^=== (?:RUN|CONT|PAUSE)\s+(\S+)").expect("RUN_RE regex should compile"));

/// `ok  	example.com/pkg	0.01s` / `FAIL	example.com/pkg [build failed]`
static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(ok|FAIL)\s+(\S+)\s+(?:[\d.]+s|\(cached\)|\[build failed\]|\[setup failed\])")
        .expect("PACKAGE_RE regex should compile")
});

/// `    add_test.go:10: expected 3, got 4`
static LOG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+(\S+\.go):(\d+): (.*)$").expect("LOG_RE regex should compile")
});

pub fn detect(raw: &str) -> bool {
    raw.lines()
        .any(|l| RESULT_RE.is_match(l) || PACKAGE_RE.is_match(l) || l.starts_with("=== RUN"))
}

#[derive(Default)]
struct TestLog {
    location: Option<String>,
    message: Option<String>,
    lines: Vec<String>,
}

pub fn parse(raw: &str) -> Option<ParsedTestResult> {
    let text = strip_ansi(raw);

    let mut passed = 0;
    let mut skipped = 0;
    let mut failed_names: Vec<String> = Vec::new();
    let mut failed_packages: Vec<(String, Vec<String>)> = Vec::new();
    let mut logs: HashMap<String, TestLog> = HashMap::new();
    let mut current: Option<String> = None;
    let mut pending_build_errors: Vec<String> = Vec::new();
    let mut matched = false;

    for line in text.lines() {
        if let Some(c) = RUN_RE.captures(line) {
            matched = true;
            current = Some(c[1].to_string());
            continue;
        }
        if let Some(c) = RESULT_RE.captures(line) {
            matched = true;
            let name = c[2].to_string();
            match &c[1] {
                "PASS" => passed += 1,
                "SKIP" => skipped += 1,
                _ => {
                    if !failed_names.contains(&name) {
                        failed_names.push(name.clone());
                    }
                }
            }
            // Without -v, the log lines follow the result line.
            current = Some(name);
            continue;
        }
        if let Some(c) = PACKAGE_RE.captures(line) {
            matched = true;
            if &c[1] == "FAIL" && line.contains("failed]") {
                failed_packages.push((c[2].to_string(), std::mem::take(&mut pending_build_errors)));
            }
            current = None;
            continue;
        }
        if line.starts_with("# ") {
            pending_build_errors.clear();
            continue;
        }
        if line.starts_with("./") || line.starts_with("../") {
            pending_build_errors.push(line.to_string());
            continue;
        }

        let Some(name) = current.as_ref() else {
            continue;
        };
        let log = logs.entry(name.clone()).or_default();
        if let Some(c) = LOG_RE.captures(line) {
            if log.location.is_none() {
                log.location = Some(format!("{}:{}", &c[1], &c[2]));
                log.message = Some(c[3].trim().to_string());
            }
        } else if let Some(panic) = line.strip_prefix("panic: ") {
            if log.message.is_none() {
                log.message = Some(format!("panic: {}", panic.trim()));
            }
        }
        log.lines.push(line.to_string());
    }

    if !matched {
        return None;
    }

    let mut failures: Vec<ParsedFailure> = failed_names
        .into_iter()
        .map(|name| {
            let log = logs.remove(&name).unwrap_or_default();
            let message = log.message.unwrap_or_else(|| "test failed".to_string());
            let stack = if log.lines.is_empty() {
                None
            } else {
                Some(log.lines.join("\n"))
            };
            ParsedFailure::new(name, message)
                .with_location(log.location)
                .with_stack(stack)
        })
        .collect();

    for (package, errors) in failed_packages {
        let message = errors
            .first()
            .cloned()
            .unwrap_or_else(|| "build failed".to_string());
        let location = errors
            .first()
            .map(|e| e.splitn(3, ':').take(2).collect::<Vec<_>>().join(":"));
        let stack = if errors.len() > 1 {
            Some(errors.join("\n"))
        } else {
            None
        };
        failures.push(
            ParsedFailure::new(package, message)
                .with_location(location)
                .with_stack(stack),
        );
    }

    let failed = failures.len() as u32;
    Some(ParsedTestResult::new(
        Framework::Go,
        passed,
        failed,
        skipped,
        None,
        failures,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_output() {
        let raw = "\
=== RUN   TestAdd
    add_test.go:10: expected 3, got 4
--- FAIL: TestAdd (0.00s)
=== RUN   TestSub
--- PASS: TestSub (0.00s)
=== RUN   TestSkip
    add_test.go:30: not on this platform
--- SKIP: TestSkip (0.00s)
FAIL
FAIL	example.com/calc	0.002s
";
        assert!(detect(raw));
        let r = parse(raw).unwrap();
        assert_eq!((r.total, r.passed, r.failed, r.skipped), (3, 1, 1, 1));
        assert_eq!(r.failures[0].name, "TestAdd");
        assert_eq!(r.failures[0].message, "expected 3, got 4");
        assert_eq!(r.failures[0].location.as_deref(), Some("add_test.go:10"));
    }

    #[test]
    fn test_terse_output_logs_after_result() {
        let raw = "\
--- FAIL: TestMul (0.00s)
    mul_test.go:7: want 6, got 5
FAIL
FAIL	example.com/calc	0.001s
";
        let r = parse(raw).unwrap();
        assert_eq!(r.failed, 1);
        assert_eq!(r.failures[0].message, "want 6, got 5");
    }

    #[test]
    fn test_build_failure() {
        let raw = "\
# example.com/calc
./calc.go:3:2: undefined: missing
FAIL	example.com/calc [build failed]
";
        let r = parse(raw).unwrap();
        assert_eq!(r.failed, 1);
        assert_eq!(r.failures[0].name, "example.com/calc");
        assert_eq!(r.failures[0].message, "./calc.go:3:2: undefined: missing");
        assert_eq!(r.failures[0].location.as_deref(), Some("./calc.go:3"));
    }
}
