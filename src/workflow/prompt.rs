use crate::llm::Prompt;
use crate::workflow::artifacts::ReviewIssue;
use crate::workflow::collaborators::WorkItem;
use crate::workflow::state::WorkItemKey;

const EDIT_SET_FORMAT: &str = r#"Respond with a single JSON object and nothing else:
{"files": [{"path": "relative/path", "content": "full new file contents"}, {"path": "obsolete/file", "delete": true}], "summary": "one line"}
Paths are relative to the repository root. Always send complete file contents, never diffs."#;

fn issue_section(key: &WorkItemKey, item: &WorkItem) -> String {
    format!(
        "## Issue {key}\n**Title:** {}\n\n**Description:**\n{}",
        item.title,
        if item.description.trim().is_empty() {
            "(no description)"
        } else {
            item.description.as_str()
        }
    )
}

pub fn classify(key: &WorkItemKey, item: &WorkItem) -> Prompt {
    Prompt::new(
        "You are Hypha, a triage assistant. Classify GitHub issues. Answer with exactly one of /bug, /feature or /chore and nothing else.",
        issue_section(key, item),
    )
}

pub fn branch_name(key: &WorkItemKey, item: &WorkItem) -> Prompt {
    Prompt::new(
        "You are Hypha. Suggest a short git branch slug for the issue: two to five lowercase words joined by hyphens. Answer with the slug only.",
        issue_section(key, item),
    )
}

pub fn plan(key: &WorkItemKey, item: &WorkItem) -> Prompt {
    Prompt::new(
        format!(
            r#"You are Hypha, an expert software engineer working on repository `{repo}`.

Write an implementation plan for the issue below as a markdown document.

## Guidelines
- Start with a `#` heading naming the change.
- List the files to touch and what changes in each.
- Describe how the change will be tested.
- Keep the plan minimal and focused on the issue."#,
            repo = key.repo
        ),
        issue_section(key, item),
    )
}

pub fn implement(key: &WorkItemKey, plan: &str) -> Prompt {
    Prompt::new(
        format!(
            r#"You are Hypha, an expert software engineer working on repository `{repo}`.

Implement the plan you are given.

## Guidelines
- Make minimal, focused changes that follow the plan.
- Follow the existing code style and patterns in the repository.
- Add or update tests for the behaviour you change.

{EDIT_SET_FORMAT}"#,
            repo = key.repo
        ),
        format!("## Plan\n{plan}"),
    )
}

pub fn patch_failures(key: &WorkItemKey, plan: &str, failures: &str, attempt: u32) -> Prompt {
    Prompt::new(
        format!(
            r#"You are Hypha, an expert software engineer working on repository `{repo}`.

The test suite fails after implementing the plan. Fix the code so the failing tests pass. Do not delete or weaken tests to make them pass.

{EDIT_SET_FORMAT}"#,
            repo = key.repo
        ),
        format!("## Plan\n{plan}\n\n## Test failures (fix attempt {attempt})\n{failures}"),
    )
}

pub fn review(key: &WorkItemKey, plan: &str, diff: &str) -> Prompt {
    Prompt::new(
        format!(
            r#"You are Hypha, a meticulous code reviewer for repository `{repo}`.

Review the diff against the plan. Report only real problems.

Respond with a single JSON object and nothing else:
{{"success": true|false, "summary": "one paragraph", "issues": [{{"description": "...", "resolution": "...", "severity": "blocker|tech_debt|skippable"}}]}}

Use `blocker` only for defects that must be fixed before merging."#,
            repo = key.repo
        ),
        format!("## Plan\n{plan}\n\n## Diff\n```diff\n{diff}\n```"),
    )
}

pub fn patch_review(key: &WorkItemKey, plan: &str, blockers: &[ReviewIssue], attempt: u32) -> Prompt {
    let issues = blockers
        .iter()
        .map(|i| format!("- {}\n  Suggested resolution: {}", i.description, i.resolution))
        .collect::<Vec<_>>()
        .join("\n");
    Prompt::new(
        format!(
            r#"You are Hypha, an expert software engineer working on repository `{repo}`.

A code review found blocking issues. Resolve every one of them.

{EDIT_SET_FORMAT}"#,
            repo = key.repo
        ),
        format!("## Plan\n{plan}\n\n## Blocking issues (fix attempt {attempt})\n{issues}"),
    )
}

pub fn commit_message(summary: &str, paths: &[String]) -> Prompt {
    Prompt::new(
        "You are Hypha. Write a git commit message: an imperative subject line under 72 characters, optionally followed by a blank line and a short body. Answer with the message only.",
        format!("Change summary: {summary}\n\nFiles:\n{}", paths.join("\n")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WorkItemKey {
        WorkItemKey {
            installation_id: 1,
            repo: "acme/widgets".to_string(),
            number: 5,
        }
    }

    #[test]
    fn test_issue_section_handles_empty_description() {
        let item = WorkItem {
            title: "Crash".to_string(),
            description: "  ".to_string(),
            labels: vec![],
        };
        let prompt = classify(&key(), &item);
        assert!(prompt.user.contains("acme/widgets#5"));
        assert!(prompt.user.contains("(no description)"));
    }

    #[test]
    fn test_review_prompt_has_literal_braces() {
        let prompt = review(&key(), "# Plan", "+fn a() {}");
        assert!(prompt.system.contains(r#"{"success""#));
        assert!(prompt.user.contains("+fn a() {}"));
    }
}
