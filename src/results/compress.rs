use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::results::{Framework, ParsedFailure, ParsedTestResult};

/// Roughly 4 bytes of English/code text per token.
const BYTES_PER_TOKEN: usize = 4;

/// Size limit for a rendered failure payload, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    bytes: usize,
}

impl Budget {
    pub fn bytes(bytes: usize) -> Self {
        Self { bytes }
    }

    pub fn tokens(tokens: usize) -> Self {
        Self {
            bytes: tokens.saturating_mul(BYTES_PER_TOKEN),
        }
    }

    pub fn as_bytes(&self) -> usize {
        self.bytes
    }
}

/// A failure report bounded by a [`Budget`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedPayload {
    pub framework: Framework,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Retained failures, highest priority first.
    pub failures: Vec<ParsedFailure>,
    /// Rendered size in bytes.
    pub budget_used: usize,
    pub truncated: bool,
    /// Failures dropped entirely; always reported in the rendered summary line.
    pub omitted: usize,
}

impl CompressedPayload {
    pub fn render(&self) -> String {
        let mut out = render_header(self.framework, self.total, self.passed, self.failed, self.skipped);
        for failure in &self.failures {
            out.push_str(&render_failure(failure));
        }
        if self.omitted > 0 {
            out.push_str(&omitted_line(self.omitted));
        }
        out
    }

    pub fn summary_line(&self) -> Option<String> {
        (self.omitted > 0).then(|| omitted_line(self.omitted).trim().to_string())
    }
}

/// Compress with position as the only priority signal.
pub fn compress(result: &ParsedTestResult, budget: Budget) -> CompressedPayload {
    compress_with_history(result, budget, None)
}

/// Fit `result` into `budget`.
///
/// Names and messages of retained failures are never altered. Stack excerpts
/// go first, lowest priority upward; whole entries are dropped after that and
/// counted in a summary line. Room freed by dropping goes back to stacks,
/// highest priority first. With `previous` failure names, failures not seen
/// on the previous run outrank the rest; otherwise earlier failures outrank
/// later ones.
pub fn compress_with_history(
    result: &ParsedTestResult,
    budget: Budget,
    previous: Option<&HashSet<String>>,
) -> CompressedPayload {
    let header = render_header(
        result.framework,
        result.total,
        result.passed,
        result.failed,
        result.skipped,
    );
    let limit = budget.as_bytes();

    let full_size = header.len() + result.failures.iter().map(|f| render_failure(f).len()).sum::<usize>();
    if full_size <= limit {
        return payload(result, result.failures.clone(), full_size, false, 0);
    }

    let ranked = prioritise(&result.failures, previous);
    let mut entries = ranked.clone();
    let mut sizes: Vec<usize> = entries.iter().map(|f| render_failure(f).len()).collect();
    let mut size = header.len() + sizes.iter().sum::<usize>();

    for i in (0..entries.len()).rev() {
        if size <= limit {
            break;
        }
        if entries[i].stack.take().is_some() {
            let stripped = render_failure(&entries[i]).len();
            size = size - sizes[i] + stripped;
            sizes[i] = stripped;
        }
    }

    let mut omitted = 0;
    while size > limit && !entries.is_empty() {
        entries.pop();
        let dropped = sizes.pop().unwrap_or(0);
        let previous_summary = if omitted > 0 { omitted_line(omitted).len() } else { 0 };
        omitted += 1;
        size = size - dropped - previous_summary + omitted_line(omitted).len();
    }

    // Entries are a prefix of `ranked`.
    for (i, original) in ranked.iter().enumerate().take(entries.len()) {
        if entries[i].stack.is_some() || original.stack.is_none() {
            continue;
        }
        let full = render_failure(original).len();
        if size - sizes[i] + full > limit {
            break;
        }
        size = size - sizes[i] + full;
        sizes[i] = full;
        entries[i].stack = original.stack.clone();
    }

    tracing::debug!(
        retained = entries.len(),
        omitted,
        size,
        limit,
        "Compressed test failures"
    );

    payload(result, entries, size, true, omitted)
}

fn payload(
    result: &ParsedTestResult,
    failures: Vec<ParsedFailure>,
    budget_used: usize,
    truncated: bool,
    omitted: usize,
) -> CompressedPayload {
    CompressedPayload {
        framework: result.framework,
        total: result.total,
        passed: result.passed,
        failed: result.failed,
        skipped: result.skipped,
        failures,
        budget_used,
        truncated,
        omitted,
    }
}

/// Newly introduced failures first (stable), then the rest in original order.
fn prioritise(failures: &[ParsedFailure], previous: Option<&HashSet<String>>) -> Vec<ParsedFailure> {
    let Some(previous) = previous else {
        return failures.to_vec();
    };
    let (new, seen): (Vec<_>, Vec<_>) = failures
        .iter()
        .cloned()
        .partition(|f| !previous.contains(&f.name));
    new.into_iter().chain(seen).collect()
}

pub(crate) fn render_header(framework: Framework, total: u32, passed: u32, failed: u32, skipped: u32) -> String {
    format!("{framework} results: {total} total, {passed} passed, {failed} failed, {skipped} skipped\n")
}

pub(crate) fn render_failure(failure: &ParsedFailure) -> String {
    let mut out = format!("\nFAIL {}\n{}\n", failure.name, failure.message);
    if let Some(location) = &failure.location {
        out.push_str(&format!("at {location}\n"));
    }
    if let Some(stack) = &failure.stack {
        for line in stack.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

pub(crate) fn omitted_line(omitted: usize) -> String {
    if omitted == 1 {
        "\n1 additional failure omitted\n".to_string()
    } else {
        format!("\n{omitted} additional failures omitted\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_result(count: usize) -> ParsedTestResult {
        let failures = (0..count)
            .map(|i| {
                ParsedFailure::new(format!("test_{i:02}"), "assertion failed: left == right")
                    .with_location(Some(format!("src/lib.rs:{}", 10 + i % 10)))
                    .with_stack(Some("frame one\nframe two\nframe three".to_string()))
            })
            .collect();
        ParsedTestResult::new(Framework::Cargo, 7, count as u32, 0, None, failures)
    }

    fn header_len(r: &ParsedTestResult) -> usize {
        render_header(r.framework, r.total, r.passed, r.failed, r.skipped).len()
    }

    fn stripped_len(f: &ParsedFailure) -> usize {
        let mut f = f.clone();
        f.stack = None;
        render_failure(&f).len()
    }

    #[test]
    fn test_under_budget_is_identity() {
        let r = failing_result(3);
        let p = compress(&r, Budget::bytes(1_000_000));

        assert!(!p.truncated);
        assert_eq!(p.omitted, 0);
        assert_eq!(p.failures, r.failures);
        assert_eq!(p.budget_used, p.render().len());
        assert!(p.summary_line().is_none());
    }

    #[test]
    fn test_fifty_failures_budget_for_five() {
        let r = failing_result(50);
        let budget = header_len(&r)
            + r.failures[..5].iter().map(stripped_len).sum::<usize>()
            + omitted_line(45).len();

        let p = compress(&r, Budget::bytes(budget));

        assert!(p.truncated);
        assert_eq!(p.failures.len(), 5);
        assert_eq!(p.omitted, 45);
        let names: Vec<&str> = p.failures.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["test_00", "test_01", "test_02", "test_03", "test_04"]);
        assert_eq!(p.summary_line().as_deref(), Some("45 additional failures omitted"));
        assert!(p.render().contains("45 additional failures omitted"));
        assert_eq!(p.render().len(), p.budget_used);
        assert!(p.budget_used <= budget);
    }

    #[test]
    fn test_stacks_stripped_from_lowest_priority_first() {
        let r = failing_result(4);
        let full = header_len(&r) + r.failures.iter().map(|f| render_failure(f).len()).sum::<usize>();
        // Room for everything except the last failure's stack.
        let budget = full - (render_failure(&r.failures[3]).len() - stripped_len(&r.failures[3]));

        let p = compress(&r, Budget::bytes(budget));

        assert!(p.truncated);
        assert_eq!(p.omitted, 0);
        assert_eq!(p.failures.len(), 4);
        assert!(p.failures[..3].iter().all(|f| f.stack.is_some()));
        assert!(p.failures[3].stack.is_none());
    }

    #[test]
    fn test_freed_room_restores_top_stack() {
        let r = failing_result(50);
        let stack_len = render_failure(&r.failures[0]).len() - stripped_len(&r.failures[0]);
        // Five stripped entries plus one stack, too little for a sixth entry.
        let budget = header_len(&r)
            + r.failures[..5].iter().map(stripped_len).sum::<usize>()
            + omitted_line(45).len()
            + stack_len;

        let p = compress(&r, Budget::bytes(budget));

        assert_eq!(p.failures.len(), 5);
        assert_eq!(p.omitted, 45);
        assert_eq!(p.failures[0].stack, r.failures[0].stack);
        assert!(p.failures[1..].iter().all(|f| f.stack.is_none()));
        assert_eq!(p.render().len(), p.budget_used);
        assert!(p.budget_used <= budget);
    }

    #[test]
    fn test_new_failures_take_priority() {
        let r = failing_result(50);
        let previous: HashSet<String> = (0..48).map(|i| format!("test_{i:02}")).collect();
        let budget = header_len(&r)
            + r.failures[..3].iter().map(stripped_len).sum::<usize>()
            + omitted_line(47).len();

        let p = compress_with_history(&r, Budget::bytes(budget), Some(&previous));

        let names: Vec<&str> = p.failures.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["test_48", "test_49", "test_00"]);
        assert_eq!(p.omitted, 47);
    }

    #[test]
    fn test_never_fabricates_and_counts_drops() {
        let r = failing_result(20);
        for budget in [0, 10, 100, 300, 700, 1_500, 3_000, 100_000] {
            let p = compress(&r, Budget::bytes(budget));
            for kept in &p.failures {
                assert!(r
                    .failures
                    .iter()
                    .any(|f| f.name == kept.name && f.message == kept.message));
            }
            assert_eq!(p.omitted, r.failures.len() - p.failures.len());
            if p.omitted > 0 {
                let expected = format!("{} additional failure", p.omitted);
                assert!(p.render().contains(&expected));
            }
        }
    }

    #[test]
    fn test_single_omission_is_singular() {
        assert_eq!(omitted_line(1).trim(), "1 additional failure omitted");
    }

    #[test]
    fn test_token_budget() {
        assert_eq!(Budget::tokens(100).as_bytes(), 400);
    }
}
