//! Building blocks for agents that call tools hosted by external providers.
//!
//! The crate provides:
//! - A chat model abstraction (`LanguageModel`) with an OpenAI client.
//! - A tool catalog (`ToolRegistry`) fed by MCP provider connections.
//! - An `Agent` that loops between the model and tools under a bounded
//!   number of tool rounds.
//! - A sandboxed filesystem provider served over stdio.

pub mod agent;
pub mod config;
pub mod error;
pub mod extract;
pub mod filesystem;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod message;
pub mod provider;
pub mod telemetry;
pub mod tool;

pub use agent::{Agent, AgentConfig, ToolErrorPolicy, DEFAULT_SYSTEM_PROMPT, LIMIT_EXCEEDED};
pub use config::{AppConfig, LogFormat, LoggingConfig, ModelConfig};
pub use error::{AgentError, Result};
pub use extract::OutputExtractor;
pub use filesystem::{FilesystemServer, FsError};
pub use llm::{
    ChatRequest, FinishReason, LanguageModel, ModelCompletion, OpenAIClient, ScriptedModel,
    ToolChoice,
};
pub use memory::Conversation;
pub use message::{Message, Role, ToolCallRequest};
pub use provider::{with_providers, ProviderConfig, ProviderConnection, ProviderPool, ProviderTransport};
pub use telemetry::init_tracing;
pub use tool::{FnExecutor, ToolDescriptor, ToolExecutor, ToolRegistry, ToolSpec};
