//! Structured test results: parsing raw runner output and compressing it
//! into a bounded payload for fix attempts.

pub mod compress;
mod grammars;
pub mod parser;

use serde::{Deserialize, Serialize};

pub use compress::{compress, compress_with_history, Budget, CompressedPayload};
pub use parser::parse;

/// Maximum number of stack lines kept per failure.
pub const STACK_LINE_CAP: usize = 20;

/// Maximum bytes of raw output carried by a synthetic failure.
pub const RAW_EXCERPT_BYTES: usize = 2_000;

/// Test output grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Jest,
    Pytest,
    Cargo,
    Go,
    /// Line-pattern heuristic used when no specific grammar matches.
    Generic,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Jest => "jest",
            Framework::Pytest => "pytest",
            Framework::Cargo => "cargo",
            Framework::Go => "go",
            Framework::Generic => "generic",
        }
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jest" | "vitest" => Ok(Framework::Jest),
            "pytest" => Ok(Framework::Pytest),
            "cargo" | "rust" => Ok(Framework::Cargo),
            "go" | "gotest" => Ok(Framework::Go),
            "generic" => Ok(Framework::Generic),
            other => Err(format!("unknown test framework: {other}")),
        }
    }
}

/// One failing test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedFailure {
    pub name: String,
    pub message: String,
    /// `file:line` when the runner reported one.
    pub location: Option<String>,
    /// Truncated stack excerpt.
    pub stack: Option<String>,
    /// Set when the entry stands in for output that could not be parsed.
    #[serde(default)]
    pub synthetic: bool,
}

impl ParsedFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            location: None,
            stack: None,
            synthetic: false,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack.map(|s| truncate_stack(&s)).filter(|s| !s.is_empty());
        self
    }
}

/// Immutable result of parsing one raw test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTestResult {
    pub framework: Framework,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub failures: Vec<ParsedFailure>,
    /// The failure list does not account for every failed test.
    pub partial: bool,
}

impl ParsedTestResult {
    /// Build a result, reconciling counts so that
    /// `passed + failed + skipped <= total` and marking the failure list partial
    /// when it disagrees with the failed count.
    pub fn new(
        framework: Framework,
        passed: u32,
        failed: u32,
        skipped: u32,
        total: Option<u32>,
        failures: Vec<ParsedFailure>,
    ) -> Self {
        let failed = failed.max(failures.len() as u32);
        let counted = passed.saturating_add(failed).saturating_add(skipped);
        let total = total.map_or(counted, |t| t.max(counted));
        let partial = failures.len() as u32 != failed;
        Self {
            framework,
            total,
            passed,
            failed,
            skipped,
            failures,
            partial,
        }
    }

    /// Fallback for output nothing could make sense of.
    pub fn unparseable(framework: Framework, raw: &str) -> Self {
        let failure = ParsedFailure {
            name: "unparsed test output".to_string(),
            message: raw_excerpt(raw),
            location: None,
            stack: None,
            synthetic: true,
        };
        Self::new(framework, 0, 1, 0, None, vec![failure])
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.total > 0
    }

    /// True when the only content is a synthetic stand-in for unreadable output.
    pub fn is_unclassified(&self) -> bool {
        self.passed == 0 && !self.failures.is_empty() && self.failures.iter().all(|f| f.synthetic)
    }

    pub fn failure_names(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.name.clone()).collect()
    }
}

fn truncate_stack(stack: &str) -> String {
    let lines: Vec<&str> = stack.trim_end().lines().collect();
    if lines.len() <= STACK_LINE_CAP {
        return lines.join("\n");
    }
    let mut kept = lines[..STACK_LINE_CAP].join("\n");
    kept.push_str(&format!("\n... ({} more lines)", lines.len() - STACK_LINE_CAP));
    kept
}

/// First `RAW_EXCERPT_BYTES` of `raw`, cut on a char boundary.
pub(crate) fn raw_excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "(no output)".to_string();
    }
    if trimmed.len() <= RAW_EXCERPT_BYTES {
        return trimmed.to_string();
    }
    let mut end = RAW_EXCERPT_BYTES;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &trimmed[..end])
}
