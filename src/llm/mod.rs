//! Client for the remote code-generation service.

pub mod claude;
pub mod retry;
pub mod routing;
pub mod session;

pub use claude::{ClaudeTransport, MessageTransport};
pub use retry::RetryPolicy;
pub use routing::{ModelRoutes, ModelTier, TaskKind, TimeoutClass};
pub use session::{ClientSettings, LlmClient, Prompt, SessionHandle};
