use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::error::AppError;
use crate::server::AppState;
use crate::webhook::events::{IssuesEvent, WebhookEvent};
use crate::webhook::signature::verify_delivery;
use crate::workflow::WorkItemKey;

/// What an `issues` event asks of us.
#[derive(Debug, PartialEq, Eq)]
enum Intent {
    Start,
    Cancel,
    Ignore,
}

fn intent(event: &IssuesEvent, trigger_label: &str) -> Intent {
    // Pull requests also arrive as issues events.
    if event.issue.pull_request.is_some() {
        return Intent::Ignore;
    }
    let label_is_trigger = event
        .label
        .as_ref()
        .is_some_and(|l| l.name == trigger_label);

    match event.action.as_str() {
        "labeled" if label_is_trigger => Intent::Start,
        "unlabeled" if label_is_trigger => Intent::Cancel,
        "closed" => Intent::Cancel,
        _ => Intent::Ignore,
    }
}

pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let event_type = match headers.get("x-github-event").and_then(|v| v.to_str().ok()) {
        Some(et) => et.to_string(),
        None => {
            tracing::warn!("Missing X-GitHub-Event header");
            return StatusCode::BAD_REQUEST;
        }
    };

    match verify_delivery(state.config.webhook_secret(), &headers, &body) {
        Ok(()) => {}
        Err(AppError::Config(detail)) => {
            tracing::error!(%detail, "Cannot verify webhook deliveries");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        Err(e) => {
            tracing::warn!(error = %e, event_type = %event_type, "Rejected webhook delivery");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let event = match WebhookEvent::parse(&event_type, &body) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(error = %e, event_type = %event_type, "Failed to parse webhook event");
            return StatusCode::BAD_REQUEST;
        }
    };

    tracing::info!(event_type = %event_type, "Received webhook event");

    match event {
        WebhookEvent::Issues(issues_event) => handle_issues_event(&state, issues_event).await,
        WebhookEvent::Ping => {
            tracing::info!("Received ping event");
            StatusCode::OK
        }
        WebhookEvent::Unsupported(event_type) => {
            tracing::debug!(event_type = %event_type, "Ignoring unsupported event");
            StatusCode::OK
        }
    }
}

async fn handle_issues_event(state: &Arc<AppState>, event: IssuesEvent) -> StatusCode {
    let intent = intent(&event, &state.config.github.trigger_label);
    if intent == Intent::Ignore {
        return StatusCode::OK;
    }

    let installation_id = match event.installation.as_ref() {
        Some(inst) => inst.id,
        None => {
            tracing::warn!("No installation ID in issues event");
            return StatusCode::BAD_REQUEST;
        }
    };
    let key = WorkItemKey {
        installation_id,
        repo: event.repository.full_name.clone(),
        number: event.issue.number,
    };

    match intent {
        Intent::Start => match crate::queue::start_run(state, key.clone()).await {
            Ok(Some(run_id)) => {
                tracing::info!(work_item = %key, run_id = %run_id, "Run scheduled");
                StatusCode::ACCEPTED
            }
            Ok(None) => StatusCode::OK,
            Err(e) => {
                tracing::error!(work_item = %key, error = %e, "Failed to schedule run");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
        Intent::Cancel => {
            let cancelled = state.runs.cancel(&key).await;
            tracing::info!(
                work_item = %key,
                action = %event.action,
                cancelled,
                "Issue closed or unlabeled"
            );
            StatusCode::OK
        }
        Intent::Ignore => StatusCode::OK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::events::{IssuePayload, LabelPayload, RepositoryPayload};

    fn event(action: &str, label: Option<&str>, is_pr: bool) -> IssuesEvent {
        IssuesEvent {
            action: action.to_string(),
            issue: IssuePayload {
                number: 3,
                title: "t".to_string(),
                labels: vec![],
                pull_request: is_pr.then(|| serde_json::json!({})),
            },
            repository: RepositoryPayload {
                full_name: "acme/widgets".to_string(),
            },
            installation: None,
            label: label.map(|name| LabelPayload {
                name: name.to_string(),
            }),
        }
    }

    #[test]
    fn test_trigger_label_starts() {
        assert_eq!(intent(&event("labeled", Some("hypha"), false), "hypha"), Intent::Start);
        assert_eq!(intent(&event("labeled", Some("bug"), false), "hypha"), Intent::Ignore);
    }

    #[test]
    fn test_close_or_unlabel_cancels() {
        assert_eq!(intent(&event("closed", None, false), "hypha"), Intent::Cancel);
        assert_eq!(intent(&event("unlabeled", Some("hypha"), false), "hypha"), Intent::Cancel);
        assert_eq!(intent(&event("unlabeled", Some("bug"), false), "hypha"), Intent::Ignore);
    }

    #[test]
    fn test_pull_requests_are_ignored() {
        assert_eq!(intent(&event("labeled", Some("hypha"), true), "hypha"), Intent::Ignore);
    }

    #[test]
    fn test_other_actions_are_ignored() {
        assert_eq!(intent(&event("edited", Some("hypha"), false), "hypha"), Intent::Ignore);
    }
}
