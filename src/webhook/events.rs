use serde::Deserialize;

/// Top-level webhook event parsed from the payload based on X-GitHub-Event header.
#[derive(Debug)]
pub enum WebhookEvent {
    Issues(IssuesEvent),
    Ping,
    Unsupported(String),
}

#[derive(Debug, Deserialize)]
pub struct IssuesEvent {
    pub action: String,
    pub issue: IssuePayload,
    pub repository: RepositoryPayload,
    pub installation: Option<InstallationPayload>,
    pub label: Option<LabelPayload>,
}

#[derive(Debug, Deserialize)]
pub struct IssuePayload {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub labels: Vec<LabelPayload>,
    pub pull_request: Option<serde_json::Value>, // Present if issue is a PR
}

#[derive(Debug, Deserialize)]
pub struct LabelPayload {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPayload {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallationPayload {
    pub id: u64,
}

impl WebhookEvent {
    pub fn parse(event_type: &str, payload: &[u8]) -> Result<Self, serde_json::Error> {
        match event_type {
            "issues" => {
                let event: IssuesEvent = serde_json::from_slice(payload)?;
                Ok(WebhookEvent::Issues(event))
            }
            "ping" => Ok(WebhookEvent::Ping),
            other => Ok(WebhookEvent::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labeled_issue() {
        let payload = br#"{
            "action": "labeled",
            "issue": {"number": 7, "title": "Crash", "labels": [{"name": "hypha"}]},
            "repository": {"full_name": "acme/widgets", "private": false},
            "installation": {"id": 99},
            "label": {"name": "hypha"}
        }"#;
        let WebhookEvent::Issues(event) = WebhookEvent::parse("issues", payload).unwrap() else {
            panic!("expected an issues event");
        };
        assert_eq!(event.action, "labeled");
        assert_eq!(event.issue.number, 7);
        assert!(event.issue.pull_request.is_none());
        assert_eq!(event.installation.unwrap().id, 99);
        assert_eq!(event.label.unwrap().name, "hypha");
    }

    #[test]
    fn test_unknown_events_are_unsupported() {
        let event = WebhookEvent::parse("pull_request", b"{}").unwrap();
        assert!(matches!(event, WebhookEvent::Unsupported(ref e) if e == "pull_request"));
        assert!(matches!(WebhookEvent::parse("ping", b"{}").unwrap(), WebhookEvent::Ping));
    }

    #[test]
    fn test_malformed_issue_payload_fails() {
        assert!(WebhookEvent::parse("issues", b"{\"action\": 1}").is_err());
    }
}
