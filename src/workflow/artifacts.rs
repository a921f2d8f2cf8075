//! Strict extraction of workflow artifacts from free-text model replies.
//!
//! Each extractor either returns a validated value or fails closed with
//! [`AppError::Content`]; nothing here guesses at what the model meant.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::workflow::state::{IssueClass, RunId};

const MAX_SLUG_LEN: usize = 40;
const MAX_SUBJECT_LEN: usize = 72;

static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|\s|`)/(bug|feature|chore)\b").expect("CLASS_RE regex should compile")
});

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[a-zA-Z]*\s*\n(.*?)\n```").expect("FENCE_RE regex should compile")
});

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^#{1,6} \S").expect("HEADING_RE regex should compile")
});

static BRANCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(bug|feature|chore)-\d+-[0-9a-f]{8}-[a-z0-9]+(?:-[a-z0-9]+)*$")
        .expect("BRANCH_RE regex should compile")
});

pub fn parse_classification(reply: &str) -> Result<IssueClass> {
    let caps = CLASS_RE
        .captures(reply)
        .ok_or_else(|| AppError::content("classification", "no /bug, /feature or /chore marker"))?;
    match caps[1].to_ascii_lowercase().as_str() {
        "bug" => Ok(IssueClass::Bug),
        "feature" => Ok(IssueClass::Feature),
        _ => Ok(IssueClass::Chore),
    }
}

/// Normalise the first line of `reply` into a lowercase hyphenated slug.
pub fn parse_branch_slug(reply: &str) -> Result<String> {
    let line = first_line(reply).ok_or_else(|| AppError::content("branch name", "empty reply"))?;

    let mut slug = String::new();
    for c in line.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_matches('-').to_string();

    if slug.is_empty() {
        return Err(AppError::content(
            "branch name",
            format!("no usable characters in {line:?}"),
        ));
    }
    Ok(slug)
}

/// `{class}-{number}-{run_id}-{slug}`, validated.
pub fn branch_name(class: IssueClass, number: u64, run_id: &RunId, slug: &str) -> Result<String> {
    let name = format!("{class}-{number}-{run_id}-{slug}");
    if !BRANCH_RE.is_match(&name) {
        return Err(AppError::content("branch name", format!("invalid branch {name:?}")));
    }
    Ok(name)
}

/// A plan must be non-empty markdown with at least one heading.
pub fn validate_plan(reply: &str) -> Result<String> {
    let plan = unfence(reply).trim();
    if plan.is_empty() {
        return Err(AppError::content("plan", "empty reply"));
    }
    if !HEADING_RE.is_match(plan) {
        return Err(AppError::content("plan", "no markdown heading"));
    }
    Ok(format!("{plan}\n"))
}

/// Subject line plus optional body, quotes and fences removed.
pub fn parse_commit_message(reply: &str) -> Result<String> {
    let text = unfence(reply).trim();
    let mut lines = text.lines();
    let subject = lines
        .next()
        .map(|l| l.trim().trim_matches(|c| c == '"' || c == '`' || c == '\''))
        .filter(|l| !l.is_empty())
        .ok_or_else(|| AppError::content("commit message", "empty reply"))?;

    let subject: String = subject.chars().take(MAX_SUBJECT_LEN).collect();
    let body = lines.collect::<Vec<_>>().join("\n");
    let body = body.trim();
    if body.is_empty() {
        Ok(subject)
    } else {
        Ok(format!("{subject}\n\n{body}"))
    }
}

/// One file change proposed by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSet {
    pub files: Vec<FileEdit>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl EditSet {
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

pub fn parse_edit_set(reply: &str, artifact: &str) -> Result<EditSet> {
    let json = extract_json(reply).ok_or_else(|| AppError::content(artifact, "no JSON object"))?;
    let edits: EditSet = serde_json::from_str(json)
        .map_err(|e| AppError::content(artifact, format!("malformed edit set: {e}")))?;

    if edits.files.is_empty() {
        return Err(AppError::content(artifact, "edit set has no files"));
    }
    for edit in &edits.files {
        validate_edit_path(&edit.path).map_err(|detail| AppError::content(artifact, detail))?;
        match (&edit.content, edit.delete) {
            (Some(_), true) => {
                return Err(AppError::content(
                    artifact,
                    format!("{} both writes and deletes", edit.path),
                ))
            }
            (None, false) => {
                return Err(AppError::content(
                    artifact,
                    format!("{} has neither content nor delete", edit.path),
                ))
            }
            _ => {}
        }
    }
    Ok(edits)
}

fn validate_edit_path(path: &str) -> std::result::Result<(), String> {
    if path.trim().is_empty() {
        return Err("empty path".to_string());
    }
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(part) if part == ".git" => {
                return Err(format!("{path} touches .git"));
            }
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(format!("{path} is not a plain relative path")),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocker,
    TechDebt,
    Skippable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub description: String,
    #[serde(default)]
    pub resolution: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub success: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

impl ReviewReport {
    pub fn blockers(&self) -> Vec<&ReviewIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Blocker)
            .collect()
    }

    /// Blockers to resolve before the change can land. A report that claims
    /// failure without naming one yields its summary as the single blocker.
    pub fn blocking_issues(&self) -> Vec<ReviewIssue> {
        let blockers: Vec<ReviewIssue> = self.blockers().into_iter().cloned().collect();
        if blockers.is_empty() && !self.success {
            return vec![ReviewIssue {
                description: self.summary.clone(),
                resolution: String::new(),
                severity: Severity::Blocker,
            }];
        }
        blockers
    }
}

pub fn parse_review(reply: &str) -> Result<ReviewReport> {
    let json = extract_json(reply).ok_or_else(|| AppError::content("review", "no JSON object"))?;
    serde_json::from_str(json).map_err(|e| AppError::content("review", format!("malformed review: {e}")))
}

/// Fenced block contents if the reply is wrapped in one, else the reply.
fn unfence(reply: &str) -> &str {
    let trimmed = reply.trim();
    if trimmed.starts_with("```") {
        if let Some(c) = FENCE_RE.captures(trimmed) {
            if let Some(m) = c.get(1) {
                return m.as_str();
            }
        }
    }
    trimmed
}

/// First fenced block holding an object, else the outermost `{...}` span.
fn extract_json(reply: &str) -> Option<&str> {
    for c in FENCE_RE.captures_iter(reply) {
        if let Some(m) = c.get(1) {
            let body = m.as_str().trim();
            if body.starts_with('{') {
                return Some(body);
            }
        }
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

fn first_line(text: &str) -> Option<&str> {
    unfence(text)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_markers() {
        assert_eq!(parse_classification("/bug").unwrap(), IssueClass::Bug);
        assert_eq!(
            parse_classification("This is clearly a /Feature request").unwrap(),
            IssueClass::Feature
        );
        assert_eq!(parse_classification("`/chore`").unwrap(), IssueClass::Chore);
        assert!(parse_classification("feature").is_err());
        assert!(parse_classification("path/bugfix").is_err());
    }

    #[test]
    fn test_branch_slug_normalisation() {
        assert_eq!(
            parse_branch_slug("`Fix Login Redirect!`").unwrap(),
            "fix-login-redirect"
        );
        assert_eq!(parse_branch_slug("\n\n  add_retry--logic  \nmore").unwrap(), "add-retry-logic");
        assert!(parse_branch_slug("!!!").is_err());
        assert!(parse_branch_slug("   ").is_err());

        let long = "a".repeat(100);
        assert_eq!(parse_branch_slug(&long).unwrap().len(), MAX_SLUG_LEN);
    }

    #[test]
    fn test_branch_name_format() {
        let run_id = RunId::parse("0a1b2c3d").unwrap();
        assert_eq!(
            branch_name(IssueClass::Bug, 42, &run_id, "fix-login").unwrap(),
            "bug-42-0a1b2c3d-fix-login"
        );
        assert!(branch_name(IssueClass::Bug, 42, &run_id, "Bad Slug").is_err());
    }

    #[test]
    fn test_plan_validation() {
        assert!(validate_plan("").is_err());
        assert!(validate_plan("just prose, no structure").is_err());
        let plan = validate_plan("```markdown\n# Plan\n\n1. Do it\n```").unwrap();
        assert!(plan.starts_with("# Plan"));
        assert!(plan.ends_with('\n'));
    }

    #[test]
    fn test_edit_set_parsing() {
        let reply = r#"Here you go:
```json
{"files": [{"path": "src/lib.rs", "content": "pub fn f() {}\n"}, {"path": "old.rs", "delete": true}], "summary": "add f"}
```"#;
        let edits = parse_edit_set(reply, "implementation").unwrap();
        assert_eq!(edits.paths(), vec!["src/lib.rs", "old.rs"]);
        assert_eq!(edits.summary.as_deref(), Some("add f"));
    }

    #[test]
    fn test_edit_set_rejects_escapes_and_ambiguity() {
        for bad in [
            r#"{"files": [{"path": "../etc/passwd", "content": "x"}]}"#,
            r#"{"files": [{"path": "/abs", "content": "x"}]}"#,
            r#"{"files": [{"path": ".git/config", "content": "x"}]}"#,
            r#"{"files": [{"path": "a.rs", "content": "x", "delete": true}]}"#,
            r#"{"files": [{"path": "a.rs"}]}"#,
            r#"{"files": []}"#,
            "no json at all",
        ] {
            let err = parse_edit_set(bad, "implementation").unwrap_err();
            assert!(matches!(err, AppError::Content { .. }), "{bad}");
        }
    }

    #[test]
    fn test_review_parsing() {
        let reply = r#"{"success": false, "summary": "needs work", "issues": [
            {"description": "panics on empty input", "resolution": "guard it", "severity": "blocker"},
            {"description": "naming", "resolution": "", "severity": "skippable"}
        ]}"#;
        let report = parse_review(reply).unwrap();
        assert_eq!(report.blockers().len(), 1);
        assert_eq!(report.blocking_issues()[0].description, "panics on empty input");

        let clean = parse_review(r#"{"success": true, "summary": "ok", "issues": []}"#).unwrap();
        assert!(clean.blocking_issues().is_empty());

        let vague = parse_review(r#"{"success": false, "summary": "broken build"}"#).unwrap();
        assert_eq!(vague.blocking_issues()[0].description, "broken build");

        assert!(parse_review(r#"{"success": true, "issues": [{"description": "x", "severity": "urgent"}]}"#).is_err());
    }

    #[test]
    fn test_commit_message() {
        assert_eq!(
            parse_commit_message("\"Add retry to login\"").unwrap(),
            "Add retry to login"
        );
        assert_eq!(
            parse_commit_message("Fix parser\n\nHandles empty input.").unwrap(),
            "Fix parser\n\nHandles empty input."
        );
        assert!(parse_commit_message("  ").is_err());
    }
}
