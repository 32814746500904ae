use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect to provider `{provider}`: {reason}")]
    Connection { provider: String, reason: String },

    #[error("provider `{0}` is not connected")]
    NotConnected(String),

    #[error("provider `{0}` is already connected")]
    AlreadyConnected(String),

    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    /// The provider itself reported a failure for a specific call.
    #[error("tool `{name}` failed: {message}")]
    ToolExecution { name: String, message: String },

    #[error("tool `{name}` received malformed arguments: {source}")]
    InvalidArguments {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    pub fn connection(provider: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure was reported by a provider rather than caused by
    /// the transport or the caller.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::ToolExecution { .. })
    }
}
