use std::sync::LazyLock;

use regex::Regex;

use super::{parse_count, strip_ansi};
use crate::results::{Framework, ParsedFailure, ParsedTestResult};

static FAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[✗✕×]|(?:not ok|fail(?:ed|ure)?|error)\b(?:\[[^\]]*\])?)[:\s]+(.+)$")
        .expect("FAIL_RE regex should compile")
});

static PASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[✓✔]|(?:ok|pass(?:ed)?)\b)[:\s]+\S").expect("PASS_RE regex should compile")
});

static SKIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:skip(?:ped)?|pending|todo)\b[:\s]+\S").expect("SKIP_RE regex should compile")
});

/// Mocha/TAP style summaries: `12 passing`, `2 failing`, `# pass 3`.
static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:#\s*)?(?:(\d+)\s+(passing|passed|failing|failed|pending|skipped)|(pass|fail|skip)\s+(\d+))\b")
        .expect("SUMMARY_RE regex should compile")
});

/// ` --> src/main.rs:2:5` or `at file.ext:12`
static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:-->|\bat)\s*([^\s:()]+\.[A-Za-z0-9]+):(\d+)").expect("LOCATION_RE regex should compile")
});

/// Lines marked PASS/FAIL/ERROR; `None` when nothing looks like a test result.
pub fn parse(raw: &str) -> Option<ParsedTestResult> {
    let text = strip_ansi(raw);
    let lines: Vec<&str> = text.lines().collect();

    let mut failures: Vec<ParsedFailure> = Vec::new();
    let mut passed = 0;
    let mut skipped = 0;

    for (i, line) in lines.iter().enumerate() {
        // Summary lines are counted below, not as individual results.
        if SUMMARY_RE.is_match(line) && !FAIL_RE.is_match(line) {
            continue;
        }
        if let Some(c) = FAIL_RE.captures(line) {
            let detail = c[1].trim();
            let (name, message) = split_detail(detail);
            let location = lines
                .get(i + 1)
                .and_then(|next| LOCATION_RE.captures(next))
                .or_else(|| LOCATION_RE.captures(line))
                .map(|l| format!("{}:{}", &l[1], &l[2]));
            failures.push(ParsedFailure::new(name, message).with_location(location));
        } else if PASS_RE.is_match(line) {
            passed += 1;
        } else if SKIP_RE.is_match(line) {
            skipped += 1;
        }
    }

    let mut summary_passed = 0;
    let mut summary_failed = 0;
    let mut summary_skipped = 0;
    for c in SUMMARY_RE.captures_iter(&text) {
        let (count, kind) = match (c.get(1), c.get(2), c.get(3), c.get(4)) {
            (Some(n), Some(k), _, _) => (parse_count(n.as_str()), k.as_str().to_ascii_lowercase()),
            (_, _, Some(k), Some(n)) => (parse_count(n.as_str()), k.as_str().to_ascii_lowercase()),
            _ => continue,
        };
        let slot = match kind.as_str() {
            "passing" | "passed" | "pass" => &mut summary_passed,
            "failing" | "failed" | "fail" => &mut summary_failed,
            _ => &mut summary_skipped,
        };
        *slot = count.saturating_add(*slot);
    }

    if failures.is_empty() && passed == 0 && skipped == 0 && summary_passed == 0 && summary_failed == 0 {
        return None;
    }

    Some(ParsedTestResult::new(
        Framework::Generic,
        passed.max(summary_passed),
        summary_failed,
        skipped.max(summary_skipped),
        None,
        failures,
    ))
}

/// `name - message`, `name: message`, or the whole text as both.
fn split_detail(detail: &str) -> (String, String) {
    for sep in [" - ", ": "] {
        if let Some((name, message)) = detail.split_once(sep) {
            let (name, message) = (name.trim(), message.trim());
            if !name.is_empty() && !message.is_empty() {
                return (name.to_string(), message.to_string());
            }
        }
    }
    (detail.to_string(), detail.to_string())
}
