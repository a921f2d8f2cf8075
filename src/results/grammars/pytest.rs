use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::{parse_count, strip_ansi};
use crate::results::{Framework, ParsedFailure, ParsedTestResult};

/// `==== 2 failed, 10 passed, 1 skipped in 0.12s ====` (or the bare `-q` form).
static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^=*\s*((?:\d+ [a-z]+,? ?)+) in [\d.]+s\b").expect("SUMMARY_RE regex should compile")
});

static COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) ([a-z]+)").expect("COUNT_RE regex should compile"));

/// `FAILED tests/test_x.py::test_name - AssertionError: boom`
static SHORT_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(FAILED|ERROR) (\S+)(?: - (.*))?$").expect("SHORT_SUMMARY_RE regex should compile")
});

/// `_____________ test_name _____________` or `___ ERROR at setup of test_x ___`
static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^_{3,} (.+?) _{3,}$").expect("SECTION_RE regex should compile")
});

/// `tests/test_x.py:12: AssertionError`
static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+\.py):(\d+): ").expect("LOCATION_RE regex should compile")
});

static BANNER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^={3,} .* ={3,}$").expect("BANNER_RE regex should compile")
});

pub fn detect(raw: &str) -> bool {
    raw.contains("test session starts")
        || raw.contains("short test summary info")
        || raw.lines().any(|l| SHORT_SUMMARY_RE.is_match(l.trim_end()) && l.contains("::"))
        || (SUMMARY_RE.is_match(raw) && raw.contains(".py"))
}

struct Section {
    title: String,
    location: Option<String>,
    message: Option<String>,
    body: String,
}

pub fn parse(raw: &str) -> Option<ParsedTestResult> {
    let text = strip_ansi(raw);

    let summary = SUMMARY_RE.captures_iter(&text).last().map(|c| c[1].to_string());
    let shorts: Vec<(String, Option<String>)> = text
        .lines()
        .filter_map(|l| SHORT_SUMMARY_RE.captures(l.trim_end()))
        .map(|c| (c[2].to_string(), c.get(3).map(|m| m.as_str().to_string())))
        .collect();
    let sections = parse_sections(&text);

    if summary.is_none() && shorts.is_empty() && sections.is_empty() {
        return None;
    }

    let mut counts: HashMap<String, u32> = HashMap::new();
    if let Some(summary) = &summary {
        for c in COUNT_RE.captures_iter(summary) {
            let key = c[2].trim_end_matches('s').to_string();
            let entry = counts.entry(key).or_default();
            *entry = entry.saturating_add(parse_count(&c[1]));
        }
    }
    let count = |k: &str| counts.get(k).copied().unwrap_or(0);

    let mut failures = Vec::new();
    if shorts.is_empty() {
        for section in &sections {
            failures.push(section_failure(&section.title, None, Some(section)));
        }
    } else {
        for (node_id, message) in &shorts {
            let section = sections.iter().find(|s| section_matches(&s.title, node_id));
            failures.push(section_failure(node_id, message.as_deref(), section));
        }
    }

    Some(ParsedTestResult::new(
        Framework::Pytest,
        count("passed").saturating_add(count("xpassed")),
        count("failed").saturating_add(count("error")),
        count("skipped")
            .saturating_add(count("xfailed"))
            .saturating_add(count("deselected")),
        None,
        failures,
    ))
}

fn section_failure(name: &str, message: Option<&str>, section: Option<&Section>) -> ParsedFailure {
    let message = message
        .map(str::to_string)
        .or_else(|| section.and_then(|s| s.message.clone()))
        .unwrap_or_else(|| "test failed".to_string());
    ParsedFailure::new(name, message)
        .with_location(section.and_then(|s| s.location.clone()))
        .with_stack(section.map(|s| s.body.clone()))
}

/// Section titles use `Class.test_name`, node ids use `file.py::Class::test_name`.
fn section_matches(title: &str, node_id: &str) -> bool {
    let title = title
        .trim_start_matches("ERROR at setup of ")
        .trim_start_matches("ERROR at teardown of ")
        .replace('.', "::");
    node_id == title || node_id.ends_with(&format!("::{title}"))
}

fn parse_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut current: Option<Section> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if let Some(c) = SECTION_RE.captures(line) {
            sections.extend(current.take());
            current = Some(Section {
                title: c[1].to_string(),
                location: None,
                message: None,
                body: String::new(),
            });
            continue;
        }
        if BANNER_RE.is_match(line) {
            sections.extend(current.take());
            continue;
        }
        let Some(section) = current.as_mut() else {
            continue;
        };
        if let Some(rest) = line.strip_prefix("E ") {
            if section.message.is_none() {
                section.message = Some(rest.trim().to_string());
            }
        }
        if let Some(c) = LOCATION_RE.captures(line) {
            section.location = Some(format!("{}:{}", &c[1], &c[2]));
        }
        section.body.push_str(line);
        section.body.push('\n');
    }
    sections.extend(current);
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
============================= test session starts ==============================
platform linux -- Python 3.12.1, pytest-8.0.0
collected 4 items

tests/test_math.py .F.F                                                  [100%]

=================================== FAILURES ===================================
___________________________________ test_add ___________________________________

    def test_add():
>       assert add(1, 2) == 4
E       assert 3 == 4
E        +  where 3 = add(1, 2)

tests/test_math.py:8: AssertionError
_____________________________ TestDiv.test_by_zero _____________________________

self = <tests.test_math.TestDiv object at 0x7f>

    def test_by_zero(self):
>       div(1, 0)
E       ZeroDivisionError: division by zero

tests/test_math.py:20: ZeroDivisionError
=========================== short test summary info ============================
FAILED tests/test_math.py::test_add - assert 3 == 4
FAILED tests/test_math.py::TestDiv::test_by_zero - ZeroDivisionError: division by zero
========================= 2 failed, 2 passed in 0.05s ==========================
";

    #[test]
    fn test_full_report() {
        assert!(detect(OUTPUT));
        let r = parse(OUTPUT).unwrap();

        assert_eq!(r.framework, Framework::Pytest);
        assert_eq!((r.total, r.passed, r.failed, r.skipped), (4, 2, 2, 0));
        assert_eq!(r.failures.len(), 2);

        assert_eq!(r.failures[0].name, "tests/test_math.py::test_add");
        assert_eq!(r.failures[0].message, "assert 3 == 4");
        assert_eq!(r.failures[0].location.as_deref(), Some("tests/test_math.py:8"));

        assert_eq!(r.failures[1].name, "tests/test_math.py::TestDiv::test_by_zero");
        assert_eq!(r.failures[1].location.as_deref(), Some("tests/test_math.py:20"));
        assert!(r.failures[1].stack.as_deref().unwrap().contains("div(1, 0)"));
    }

    #[test]
    fn test_quiet_summary_only() {
        let r = parse("....s\n4 passed, 1 skipped in 0.01s\n").unwrap();
        assert_eq!((r.total, r.passed, r.failed, r.skipped), (5, 4, 0, 1));
        assert!(r.failures.is_empty());
    }

    #[test]
    fn test_errors_count_as_failures() {
        let raw = "ERROR tests/test_db.py::test_conn - ConnectionRefusedError\n=== 1 passed, 1 error in 0.3s ===\n";
        let r = parse(raw).unwrap();
        assert_eq!(r.failed, 1);
        assert_eq!(r.failures[0].message, "ConnectionRefusedError");
    }
}
