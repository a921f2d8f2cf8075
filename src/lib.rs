pub mod config;
pub mod error;
pub mod llm;
pub mod platform;
pub mod queue;
pub mod results;
pub mod server;
pub mod shutdown;
pub mod webhook;
pub mod workflow;
pub mod workspace;
