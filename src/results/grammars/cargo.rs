use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::{parse_count, strip_ansi};
use crate::results::{Framework, ParsedFailure, ParsedTestResult};

static RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^test result: (?:ok|FAILED)\. (\d+) passed; (\d+) failed; (\d+) ignored")
        .expect("RESULT_RE regex should compile")
});

static TEST_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test (\S+)(?: - should panic)? \.\.\. (ok|FAILED|ignored)")
        .expect("TEST_LINE_RE regex should compile")
});

static STDOUT_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^---- (\S+) stdout ----$").expect("STDOUT_HEADER_RE regex should compile")
});

/// Rust >= 1.73: `thread 'name' panicked at src/lib.rs:10:5:` with the message on the next line.
static PANIC_NEW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^thread '.*' panicked at (\S+?):(\d+):\d+:$").expect("PANIC_NEW_RE regex should compile")
});

/// Older toolchains: `thread 'name' panicked at 'message', src/lib.rs:10:5`
static PANIC_OLD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^thread '.*' panicked at '(.*)', (\S+?):(\d+):\d+$").expect("PANIC_OLD_RE regex should compile")
});

pub fn detect(raw: &str) -> bool {
    RESULT_RE.is_match(raw) || raw.lines().any(|l| l.starts_with("running ") && l.ends_with(" tests"))
}

#[derive(Default)]
struct Detail {
    message: Option<String>,
    location: Option<String>,
    body: String,
}

pub fn parse(raw: &str) -> Option<ParsedTestResult> {
    let text = strip_ansi(raw);

    let mut passed = 0;
    let mut failed = 0;
    let mut ignored = 0;
    let mut saw_summary = false;
    for c in RESULT_RE.captures_iter(&text) {
        saw_summary = true;
        passed = parse_count(&c[1]).saturating_add(passed);
        failed = parse_count(&c[2]).saturating_add(failed);
        ignored = parse_count(&c[3]).saturating_add(ignored);
    }

    let mut failed_names = Vec::new();
    let mut line_counts = (0, 0, 0);
    for line in text.lines() {
        if let Some(c) = TEST_LINE_RE.captures(line) {
            match &c[2] {
                "ok" => line_counts.0 += 1,
                "FAILED" => {
                    line_counts.1 += 1;
                    failed_names.push(c[1].to_string());
                }
                _ => line_counts.2 += 1,
            }
        }
    }

    if !saw_summary {
        if line_counts == (0, 0, 0) {
            return None;
        }
        // Truncated output: fall back to per-test lines.
        (passed, failed, ignored) = line_counts;
    }

    let details = parse_details(&text);
    let failures = failed_names
        .into_iter()
        .map(|name| {
            let detail = details.get(&name);
            let message = detail
                .and_then(|d| d.message.clone())
                .unwrap_or_else(|| "test failed".to_string());
            ParsedFailure::new(name, message)
                .with_location(detail.and_then(|d| d.location.clone()))
                .with_stack(detail.map(|d| d.body.clone()))
        })
        .collect();

    Some(ParsedTestResult::new(
        Framework::Cargo,
        passed,
        failed,
        ignored,
        None,
        failures,
    ))
}

fn parse_details(text: &str) -> HashMap<String, Detail> {
    let mut details: HashMap<String, Detail> = HashMap::new();
    let mut current: Option<(String, Detail)> = None;
    let mut expect_message = false;

    for line in text.lines() {
        if let Some(c) = STDOUT_HEADER_RE.captures(line) {
            if let Some((name, detail)) = current.take() {
                details.insert(name, detail);
            }
            current = Some((c[1].to_string(), Detail::default()));
            expect_message = false;
            continue;
        }
        // The `failures:` name list or the next summary ends a detail block.
        if line == "failures:" || line.starts_with("test result:") {
            if let Some((name, detail)) = current.take() {
                details.insert(name, detail);
            }
            continue;
        }
        let Some((_, detail)) = current.as_mut() else {
            continue;
        };

        if expect_message {
            detail.message = Some(line.trim().to_string());
            expect_message = false;
        } else if let Some(c) = PANIC_NEW_RE.captures(line) {
            detail.location = Some(format!("{}:{}", &c[1], &c[2]));
            expect_message = true;
        } else if let Some(c) = PANIC_OLD_RE.captures(line) {
            detail.message = Some(c[1].to_string());
            detail.location = Some(format!("{}:{}", &c[2], &c[3]));
        }
        detail.body.push_str(line);
        detail.body.push('\n');
    }
    if let Some((name, detail)) = current {
        details.insert(name, detail);
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
   Compiling demo v0.1.0 (/work/demo)
    Finished `test` profile [unoptimized + debuginfo] target(s) in 1.02s
     Running unittests src/lib.rs (target/debug/deps/demo-1234)

running 4 tests
test tests::adds ... ok
test tests::subtracts ... FAILED
test tests::divides ... FAILED
test tests::slow ... ignored

failures:

---- tests::subtracts stdout ----

thread 'tests::subtracts' panicked at src/lib.rs:21:9:
assertion `left == right` failed
  left: 1
 right: 2
note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace

---- tests::divides stdout ----
thread 'tests::divides' panicked at 'attempt to divide by zero', src/lib.rs:30:5


failures:
    tests::subtracts
    tests::divides

test result: FAILED. 1 passed; 2 failed; 1 ignored; 0 measured; 0 filtered out; finished in 0.00s
";

    #[test]
    fn test_failed_run() {
        assert!(detect(OUTPUT));
        let r = parse(OUTPUT).unwrap();

        assert_eq!((r.total, r.passed, r.failed, r.skipped), (4, 1, 2, 1));
        assert_eq!(r.failures.len(), 2);

        assert_eq!(r.failures[0].name, "tests::subtracts");
        assert_eq!(r.failures[0].message, "assertion `left == right` failed");
        assert_eq!(r.failures[0].location.as_deref(), Some("src/lib.rs:21"));
        assert!(r.failures[0].stack.as_deref().unwrap().contains("left: 1"));

        assert_eq!(r.failures[1].name, "tests::divides");
        assert_eq!(r.failures[1].message, "attempt to divide by zero");
        assert_eq!(r.failures[1].location.as_deref(), Some("src/lib.rs:30"));
    }

    #[test]
    fn test_summaries_are_summed_across_binaries() {
        let raw = "\
running 2 tests
test a ... ok
test b ... ok

test result: ok. 2 passed; 0 failed; 0 ignored; 0 measured; 0 filtered out; finished in 0.00s

running 1 test
test c ... ok

test result: ok. 1 passed; 0 failed; 0 ignored; 0 measured; 0 filtered out; finished in 0.00s
";
        let r = parse(raw).unwrap();
        assert_eq!((r.total, r.passed, r.failed), (3, 3, 0));
        assert!(r.all_passed());
    }

    #[test]
    fn test_truncated_output_uses_test_lines() {
        let raw = "running 2 tests\ntest a ... ok\ntest b ... FAILED\n";
        let r = parse(raw).unwrap();
        assert_eq!((r.passed, r.failed), (1, 1));
        assert_eq!(r.failures[0].message, "test failed");
    }
}
