use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::error::{AppError, Result};
use crate::llm::claude::{ClaudeTransport, Message, MessageTransport, MessagesRequest};
use crate::llm::retry::RetryPolicy;
use crate::llm::routing::{ModelRoutes, ModelTier, TaskKind, TimeoutClass};

/// A system prompt and the user turn sent with it.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Caller-side reference to a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: Uuid,
    pub slot: String,
    pub tier: ModelTier,
}

struct LlmSession {
    id: Uuid,
    tier: ModelTier,
    created_at: Instant,
    last_activity: Instant,
    history: Vec<Message>,
}

impl LlmSession {
    fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.duration_since(self.last_activity) >= idle_timeout
    }
}

/// Tunables for [`LlmClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub routes: ModelRoutes,
    pub retry: RetryPolicy,
    pub max_tokens: u32,
    pub short_timeout: Duration,
    pub long_timeout: Duration,
    pub reuse_sessions: bool,
    pub idle_timeout: Duration,
}

impl From<&LlmConfig> for ClientSettings {
    fn from(config: &LlmConfig) -> Self {
        Self {
            routes: config.routes(),
            retry: config.retry.policy(),
            max_tokens: config.max_tokens,
            short_timeout: config.light_timeout(),
            long_timeout: config.heavy_timeout(),
            reuse_sessions: config.reuse_sessions,
            idle_timeout: config.session_idle_timeout(),
        }
    }
}

/// Session-scoped client for the code-generation service.
///
/// Sessions live in a registry keyed by conversation slot (`{run_id}/{task}`).
/// The registry lock is never held across a network call, so concurrent runs
/// only contend on bookkeeping.
pub struct LlmClient {
    transport: Arc<dyn MessageTransport>,
    settings: ClientSettings,
    sessions: Mutex<HashMap<String, LlmSession>>,
}

impl LlmClient {
    pub fn new(transport: Arc<dyn MessageTransport>, settings: ClientSettings) -> Self {
        Self {
            transport,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        let transport = ClaudeTransport::new(&config.api_url, &config.api_key);
        Self::new(Arc::new(transport), ClientSettings::from(config))
    }

    pub async fn create_session(&self, slot: &str, tier: ModelTier) -> SessionHandle {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        self.expire_idle(&mut sessions, now);

        if let Some(existing) = sessions.get(slot) {
            if self.settings.reuse_sessions && existing.tier == tier {
                tracing::debug!(slot = %slot, session_id = %existing.id, "Reusing LLM session");
                return SessionHandle {
                    id: existing.id,
                    slot: slot.to_string(),
                    tier,
                };
            }
            tracing::debug!(slot = %slot, session_id = %existing.id, "Closing prior session for slot");
            sessions.remove(slot);
        }

        let id = Uuid::new_v4();
        sessions.insert(
            slot.to_string(),
            LlmSession {
                id,
                tier,
                created_at: now,
                last_activity: now,
                history: Vec::new(),
            },
        );
        tracing::debug!(slot = %slot, session_id = %id, %tier, "Opened LLM session");

        SessionHandle {
            id,
            slot: slot.to_string(),
            tier,
        }
    }

    /// Send one user turn on `handle` and return the reply text.
    ///
    /// Transient failures are retried according to the retry policy; only the
    /// final error is returned.
    pub async fn send_message(
        &self,
        handle: &SessionHandle,
        prompt: &Prompt,
        timeout: TimeoutClass,
    ) -> Result<String> {
        let request = {
            let mut sessions = self.sessions.lock().await;
            self.expire_idle(&mut sessions, Instant::now());
            let session = sessions
                .get(&handle.slot)
                .filter(|s| s.id == handle.id)
                .ok_or_else(|| {
                    AppError::Session(format!("session {} for {} is closed", handle.id, handle.slot))
                })?;

            let mut messages = session.history.clone();
            messages.push(Message::user(prompt.user.clone()));
            MessagesRequest {
                model: self.settings.routes.model_for(handle.tier).to_string(),
                max_tokens: self.settings.max_tokens,
                system: prompt.system.clone(),
                messages,
            }
        };

        let limit = match timeout {
            TimeoutClass::Short => self.settings.short_timeout,
            TimeoutClass::Long => self.settings.long_timeout,
        };
        let transport = &self.transport;
        let request_ref = &request;

        let text = self
            .settings
            .retry
            .run(&handle.slot, |attempt| async move {
                tracing::debug!(
                    model = %request_ref.model,
                    attempt,
                    timeout_ms = limit.as_millis() as u64,
                    "Sending LLM request"
                );
                let response = tokio::time::timeout(limit, transport.send(request_ref))
                    .await
                    .map_err(|_| AppError::LlmTimeout(limit.as_secs()))??;
                tracing::debug!(
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    stop_reason = ?response.stop_reason,
                    "LLM response received"
                );
                Ok(response.text())
            })
            .await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&handle.slot).filter(|s| s.id == handle.id) {
            session.history.push(Message::user(prompt.user.clone()));
            session.history.push(Message::assistant(text.clone()));
            session.last_activity = Instant::now();
        }

        Ok(text)
    }

    pub async fn close(&self, handle: &SessionHandle) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(&handle.slot).is_some_and(|s| s.id == handle.id) {
            if let Some(session) = sessions.remove(&handle.slot) {
                tracing::debug!(
                    slot = %handle.slot,
                    session_id = %handle.id,
                    age_ms = session.created_at.elapsed().as_millis() as u64,
                    turns = session.history.len() / 2,
                    "Closed LLM session"
                );
            }
        }
    }

    /// Close every session belonging to `run_id`.
    pub async fn close_run(&self, run_id: &str) {
        let prefix = format!("{run_id}/");
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|slot, _| !slot.starts_with(&prefix));
        let closed = before - sessions.len();
        if closed > 0 {
            tracing::debug!(run_id, closed, "Closed run sessions");
        }
    }

    /// One-shot request for a workflow task on the run's slot for that task.
    /// The session is closed afterwards unless reuse is enabled.
    pub async fn ask(&self, run_id: &str, task: TaskKind, prompt: &Prompt) -> Result<String> {
        let slot = format!("{run_id}/{}", task.as_str());
        let handle = self.create_session(&slot, task.tier()).await;
        let result = self.send_message(&handle, prompt, task.timeout_class()).await;
        if !self.settings.reuse_sessions {
            self.close(&handle).await;
        }
        result
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn expire_idle(&self, sessions: &mut HashMap<String, LlmSession>, now: Instant) {
        let idle_timeout = self.settings.idle_timeout;
        sessions.retain(|slot, session| {
            let keep = !session.is_idle(now, idle_timeout);
            if !keep {
                tracing::debug!(slot = %slot, session_id = %session.id, "Expired idle LLM session");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::claude::{ContentBlock, MessagesResponse, Usage};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    enum Reply {
        Text(&'static str),
        Transient,
        Rejected,
        Hang,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        replies: StdMutex<VecDeque<Reply>>,
        requests: StdMutex<Vec<MessagesRequest>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies.into()),
                requests: StdMutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MessageTransport for ScriptedTransport {
        async fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Text("ok"));
            match reply {
                Reply::Text(text) => Ok(MessagesResponse {
                    id: "msg".to_string(),
                    content: vec![ContentBlock::Text {
                        text: text.to_string(),
                    }],
                    stop_reason: Some("end_turn".to_string()),
                    usage: Usage::default(),
                }),
                Reply::Transient => Err(AppError::LlmTransient("503".to_string())),
                Reply::Rejected => Err(AppError::LlmRejected("401".to_string())),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Err(AppError::Internal("unreachable".to_string()))
                }
            }
        }
    }

    fn settings(max_attempts: u32) -> ClientSettings {
        ClientSettings {
            routes: ModelRoutes {
                heavy: "heavy-model".to_string(),
                lightweight: "light-model".to_string(),
            },
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(20),
                multiplier: 2.0,
                max_delay: Duration::from_secs(1),
            },
            max_tokens: 1024,
            short_timeout: Duration::from_millis(50),
            long_timeout: Duration::from_secs(5),
            reuse_sessions: false,
            idle_timeout: Duration::from_secs(60),
        }
    }

    fn prompt() -> Prompt {
        Prompt::new("system", "hello")
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt_after_backoff() {
        let transport = ScriptedTransport::new(vec![
            Reply::Transient,
            Reply::Transient,
            Reply::Text("done"),
        ]);
        let client = LlmClient::new(transport.clone(), settings(3));

        let handle = client.create_session("run/plan", ModelTier::Heavy).await;
        let started = Instant::now();
        let text = client
            .send_message(&handle, &prompt(), TimeoutClass::Long)
            .await
            .unwrap();

        assert_eq!(text, "done");
        assert_eq!(transport.calls(), 3);
        // 20ms + 40ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_permanent_error_fails_fast() {
        let transport = ScriptedTransport::new(vec![Reply::Rejected]);
        let client = LlmClient::new(transport.clone(), settings(3));

        let handle = client.create_session("run/plan", ModelTier::Heavy).await;
        let err = client
            .send_message(&handle, &prompt(), TimeoutClass::Long)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::LlmRejected(_)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_returns_last_error() {
        let transport = ScriptedTransport::new(vec![Reply::Transient, Reply::Transient]);
        let client = LlmClient::new(transport.clone(), settings(2));

        let handle = client.create_session("run/plan", ModelTier::Heavy).await;
        let err = client
            .send_message(&handle, &prompt(), TimeoutClass::Long)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_short_timeout_applies() {
        let transport = ScriptedTransport::new(vec![Reply::Hang]);
        let client = LlmClient::new(transport, settings(1));

        let handle = client.create_session("run/classify", ModelTier::Lightweight).await;
        let err = client
            .send_message(&handle, &prompt(), TimeoutClass::Short)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::LlmTimeout(_)));
    }

    #[tokio::test]
    async fn test_tasks_route_to_tier_models() {
        let transport = ScriptedTransport::new(vec![]);
        let client = LlmClient::new(transport.clone(), settings(1));

        client.ask("r1", TaskKind::Classify, &prompt()).await.unwrap();
        client.ask("r1", TaskKind::Plan, &prompt()).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].model, "light-model");
        assert_eq!(requests[1].model, "heavy-model");
        assert_eq!(requests[1].system, "system");
    }

    #[tokio::test]
    async fn test_new_session_replaces_slot_without_reuse() {
        let transport = ScriptedTransport::new(vec![]);
        let client = LlmClient::new(transport, settings(1));

        let first = client.create_session("r1/plan", ModelTier::Heavy).await;
        let second = client.create_session("r1/plan", ModelTier::Heavy).await;

        assert_ne!(first.id, second.id);
        assert_eq!(client.session_count().await, 1);
        let err = client
            .send_message(&first, &prompt(), TimeoutClass::Long)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Session(_)));
    }

    #[tokio::test]
    async fn test_reused_session_carries_history() {
        let transport = ScriptedTransport::new(vec![]);
        let client = LlmClient::new(
            transport.clone(),
            ClientSettings {
                reuse_sessions: true,
                ..settings(1)
            },
        );

        client.ask("r1", TaskKind::PatchPlan, &prompt()).await.unwrap();
        client.ask("r1", TaskKind::PatchPlan, &prompt()).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[1].messages[1].role, "assistant");
    }

    #[tokio::test]
    async fn test_ask_closes_session_without_reuse() {
        let transport = ScriptedTransport::new(vec![]);
        let client = LlmClient::new(transport, settings(1));

        client.ask("r1", TaskKind::Review, &prompt()).await.unwrap();
        assert_eq!(client.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_run_only_touches_that_run() {
        let transport = ScriptedTransport::new(vec![]);
        let client = LlmClient::new(transport, settings(1));

        client.create_session("aaaa/plan", ModelTier::Heavy).await;
        client.create_session("aaaa/review", ModelTier::Heavy).await;
        let other = client.create_session("bbbb/plan", ModelTier::Heavy).await;

        client.close_run("aaaa").await;

        assert_eq!(client.session_count().await, 1);
        client
            .send_message(&other, &prompt(), TimeoutClass::Long)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let transport = ScriptedTransport::new(vec![]);
        let client = LlmClient::new(
            transport,
            ClientSettings {
                idle_timeout: Duration::from_millis(10),
                ..settings(1)
            },
        );

        let handle = client.create_session("r1/plan", ModelTier::Heavy).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = client
            .send_message(&handle, &prompt(), TimeoutClass::Long)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Session(_)));
        assert_eq!(client.session_count().await, 0);
    }
}
