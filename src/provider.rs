//! Connections to external tool providers.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::error::{AgentError, Result};
use crate::mcp::{
    HttpTransport, JsonRpcNotification, McpSession, McpToolDefinition, McpTransport,
    StdioTransport,
};
use crate::tool::{ToolExecutor, ToolRegistry};

const CLIENT_NAME: &str = "agentwire";

/// How to reach a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ProviderTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: ProviderTransport,
}

impl ProviderConfig {
    pub fn stdio<I, S>(name: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            transport: ProviderTransport::Stdio {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
                cwd: None,
            },
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: ProviderTransport::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
        }
    }

    /// Adds an environment variable for a stdio provider. No effect on HTTP
    /// providers.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let ProviderTransport::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        if let ProviderTransport::Stdio { cwd, .. } = &mut self.transport {
            *cwd = Some(dir.into());
        }
        self
    }

    fn open_transport(&self) -> Result<Arc<dyn McpTransport>> {
        match &self.transport {
            ProviderTransport::Stdio {
                command,
                args,
                env,
                cwd,
            } => Ok(Arc::new(StdioTransport::spawn(
                command,
                args,
                env,
                cwd.as_deref(),
            )?)),
            ProviderTransport::Http { url, headers } => {
                Ok(Arc::new(HttpTransport::with_headers(url.clone(), headers)?))
            }
        }
    }
}

/// One provider session. Disconnected until [`ProviderConnection::connect`]
/// succeeds.
pub struct ProviderConnection {
    config: ProviderConfig,
    session: RwLock<Option<Arc<McpSession>>>,
}

impl ProviderConnection {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            session: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Starts the provider described by the config and performs the
    /// handshake.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.session.write().await;
        if guard.is_some() {
            return Err(AgentError::AlreadyConnected(self.name().to_string()));
        }
        let transport = self
            .config
            .open_transport()
            .map_err(|err| AgentError::connection(self.name(), err))?;
        *guard = Some(self.handshake(transport).await?);
        Ok(())
    }

    /// Performs the handshake over a transport the caller already opened.
    pub async fn connect_with(&self, transport: Arc<dyn McpTransport>) -> Result<()> {
        let mut guard = self.session.write().await;
        if guard.is_some() {
            return Err(AgentError::AlreadyConnected(self.name().to_string()));
        }
        *guard = Some(self.handshake(transport).await?);
        Ok(())
    }

    async fn handshake(&self, transport: Arc<dyn McpTransport>) -> Result<Arc<McpSession>> {
        match McpSession::initialize(Arc::clone(&transport), CLIENT_NAME).await {
            Ok(session) => {
                tracing::info!(
                    provider = %self.name(),
                    server = %session.server_info().name,
                    "provider connected"
                );
                Ok(Arc::new(session))
            }
            Err(err) => {
                if let Err(close_err) = transport.close().await {
                    tracing::error!(provider = %self.name(), error = %close_err, "failed to release transport");
                }
                Err(AgentError::connection(self.name(), err))
            }
        }
    }

    async fn session(&self) -> Result<Arc<McpSession>> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| AgentError::NotConnected(self.name().to_string()))
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>> {
        self.session().await?.list_tools().await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let session = self.session().await?;
        tracing::debug!(provider = %self.name(), tool = name, "calling tool");
        session.call_tool(name, arguments).await?.into_value(name)
    }

    pub async fn ping(&self) -> Result<()> {
        self.session().await?.ping().await
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<JsonRpcNotification>> {
        Ok(self.session().await?.subscribe())
    }

    /// Releases the transport. Calling it on a disconnected provider is a
    /// no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        session.close().await?;
        tracing::info!(provider = %self.name(), "provider disconnected");
        Ok(())
    }

    /// Registers every advertised tool, each dispatching back to this
    /// connection.
    pub async fn register_tools(self: &Arc<Self>, registry: &mut ToolRegistry) -> Result<usize> {
        let tools = self.list_tools().await?;
        let count = tools.len();
        for tool in tools {
            let description = tool
                .description
                .unwrap_or_else(|| format!("MCP tool: {}", tool.name));
            registry.register_tool(
                tool.name,
                Arc::clone(self) as Arc<dyn ToolExecutor>,
                description,
                tool.input_schema,
            );
        }
        tracing::debug!(provider = %self.name(), count, "registered provider tools");
        Ok(count)
    }
}

#[async_trait]
impl ToolExecutor for ProviderConnection {
    async fn execute(&self, name: &str, arguments: Value) -> Result<Value> {
        self.call_tool(name, arguments).await
    }
}

/// A set of connected providers.
#[derive(Clone, Default)]
pub struct ProviderPool {
    connections: Vec<Arc<ProviderConnection>>,
}

impl ProviderPool {
    /// Connects every provider concurrently. If any of them fails, the ones
    /// that did connect are disconnected again and the first failure is
    /// returned.
    pub async fn connect(configs: &[ProviderConfig]) -> Result<Self> {
        let connections = configs
            .iter()
            .cloned()
            .map(|config| Arc::new(ProviderConnection::new(config)))
            .collect();
        Self::connect_all(connections).await
    }

    /// Same as [`ProviderPool::connect`] for connections the caller already
    /// holds.
    pub async fn connect_all(connections: Vec<Arc<ProviderConnection>>) -> Result<Self> {
        let outcomes = join_all(connections.iter().map(|conn| conn.connect())).await;

        let mut failure = None;
        let mut connected = Vec::new();
        for (conn, outcome) in connections.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => connected.push(conn),
                Err(err) => {
                    tracing::warn!(provider = %conn.name(), error = %err, "provider failed to connect");
                    failure.get_or_insert(err);
                }
            }
        }

        let pool = Self {
            connections: connected,
        };
        match failure {
            Some(err) => {
                pool.shutdown().await;
                Err(err)
            }
            None => Ok(pool),
        }
    }

    pub fn from_connections(connections: Vec<Arc<ProviderConnection>>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &[Arc<ProviderConnection>] {
        &self.connections
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProviderConnection>> {
        self.connections.iter().find(|conn| conn.name() == name)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Registers the tools of every provider, in pool order. A later provider
    /// advertising an existing name replaces the earlier one.
    pub async fn register_tools(&self, registry: &mut ToolRegistry) -> Result<usize> {
        let mut total = 0;
        for conn in &self.connections {
            total += conn.register_tools(registry).await?;
        }
        Ok(total)
    }

    /// Disconnects every provider, logging failures instead of stopping at
    /// the first one.
    pub async fn shutdown(&self) {
        let outcomes = join_all(self.connections.iter().map(|conn| conn.disconnect())).await;
        for (conn, outcome) in self.connections.iter().zip(outcomes) {
            if let Err(err) = outcome {
                tracing::error!(provider = %conn.name(), error = %err, "failed to disconnect provider");
            }
        }
    }
}

/// Connects the providers, runs `f` with them, then disconnects them
/// whether `f` succeeded or not.
pub async fn with_providers<F, Fut, T>(configs: &[ProviderConfig], f: F) -> Result<T>
where
    F: FnOnce(ProviderPool) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let pool = ProviderPool::connect(configs).await?;
    let outcome = f(pool.clone()).await;
    pool.shutdown().await;
    outcome
}
