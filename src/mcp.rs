//! MCP (Model Context Protocol) client plumbing.
//!
//! Messages are JSON-RPC 2.0 objects. Over stdio they are newline delimited;
//! over HTTP each request is a POST. A stdio connection keeps one background
//! reader that hands responses back to whichever request is waiting on the
//! matching id and fans provider notifications out to subscribers.
//!
//! ```rust,ignore
//! use agentwire::mcp::{McpSession, StdioTransport};
//!
//! let transport = StdioTransport::spawn("fs-provider", &["--root-dir".into(), ".".into()], &Default::default(), None)?;
//! let session = McpSession::initialize(Arc::new(transport), "agentwire").await?;
//! let tools = session.list_tools().await?;
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{AgentError, Result};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const NOTIFICATION_BUFFER: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────────────────
// JSON-RPC types
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-RPC request. Without an id it is a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A notification flowing in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> std::result::Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MCP payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Tool definition as advertised by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpToolDefinition>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ContentItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
    #[serde(rename = "resource")]
    Resource { resource: Value },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(rename = "structuredContent", default)]
    pub structured_content: Option<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.clone()),
                ContentItem::Resource { resource } => Some(format!("[Resource: {resource}]")),
                ContentItem::Image { .. } | ContentItem::Unsupported => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Converts the result into the JSON value handed back to the model.
    /// A result flagged `isError` becomes [`AgentError::ToolExecution`].
    pub fn into_value(self, tool_name: &str) -> Result<Value> {
        if self.is_error {
            return Err(AgentError::ToolExecution {
                name: tool_name.to_string(),
                message: self.joined_text(),
            });
        }
        let text = self.joined_text();
        if let Some(structured) = self.structured_content {
            return Ok(structured);
        }

        let images: Vec<Value> = self
            .content
            .into_iter()
            .filter_map(|item| match item {
                ContentItem::Image { data, mime_type } => Some(json!({
                    "type": "image",
                    "data": data,
                    "mimeType": mime_type.unwrap_or_else(|| "image/png".to_string()),
                })),
                _ => None,
            })
            .collect();

        if images.is_empty() {
            Ok(json!({ "content": text }))
        } else {
            Ok(json!({ "content": text, "images": images }))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Sends a request and waits for the response carrying the same id.
    /// The transport assigns the id.
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Sends a notification; nothing is awaited in return.
    async fn notify(&self, notification: JsonRpcNotification) -> Result<()>;

    /// Notifications pushed by the provider.
    fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification>;

    async fn close(&self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP transport
// ─────────────────────────────────────────────────────────────────────────────

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    request_id: AtomicU64,
    notifications: broadcast::Sender<JsonRpcNotification>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    /// Static headers (for example authentication) sent with every request.
    pub fn with_headers(url: impl Into<String>, headers: &HashMap<String, String>) -> Result<Self> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let name = reqwest::header::HeaderName::try_from(key.as_str())
                .map_err(|e| AgentError::Config(format!("invalid header name `{key}`: {e}")))?;
            let value = reqwest::header::HeaderValue::try_from(value.as_str())
                .map_err(|e| AgentError::Config(format!("invalid value for header `{key}`: {e}")))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .map_err(|e| AgentError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, url))
    }

    fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            client,
            url: url.into(),
            request_id: AtomicU64::new(1),
            notifications,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        request.id = Some(Value::from(id));

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AgentError::Transport(format!(
                "provider responded with HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::Transport(format!("failed to parse response: {e}")))
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&notification)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("HTTP notification failed: {e}")))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stdio transport
// ─────────────────────────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Newline-delimited JSON-RPC over a pair of byte streams, usually the
/// stdin/stdout of a spawned provider process.
pub struct StdioTransport {
    writer: Mutex<Option<BoxedWriter>>,
    pending: PendingMap,
    notifications: broadcast::Sender<JsonRpcNotification>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
    request_id: AtomicU64,
}

impl StdioTransport {
    /// Launches `command` and talks to it over its stdio. Must be called
    /// inside a tokio runtime.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Transport(format!("failed to spawn `{command}`: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Transport("provider stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transport("provider stdout not available".into()))?;

        tracing::debug!(command, pid = child.id(), "spawned provider process");
        Ok(Self::build(stdout, stdin, Some(child)))
    }

    /// Wraps already-open streams, for example one end of a
    /// [`tokio::io::duplex`] pair.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(reader, writer, None)
    }

    fn build<R, W>(reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let handle = tokio::spawn(read_loop(
            BufReader::new(reader),
            Arc::clone(&pending),
            notifications.clone(),
        ));

        Self {
            writer: Mutex::new(Some(Box::new(writer))),
            pending,
            notifications,
            reader: std::sync::Mutex::new(Some(handle)),
            child: Mutex::new(child),
            request_id: AtomicU64::new(1),
        }
    }

    async fn write_line<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| AgentError::Transport("transport is closed".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Transport(format!("failed to write to provider: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| AgentError::Transport(format!("failed to flush provider stdin: {e}")))
    }
}

async fn read_loop<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    notifications: broadcast::Sender<JsonRpcNotification>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "provider stream read failed");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unparsable provider output");
                continue;
            }
        };

        if value.get("method").is_some() {
            if value.get("id").is_some() {
                tracing::warn!(line = %trimmed, "ignoring provider-initiated request");
                continue;
            }
            match serde_json::from_value::<JsonRpcNotification>(value) {
                Ok(notification) => {
                    tracing::debug!(method = %notification.method, "provider notification");
                    // No subscribers is fine.
                    let _ = notifications.send(notification);
                }
                Err(err) => tracing::warn!(error = %err, "malformed provider notification"),
            }
            continue;
        }

        let response: JsonRpcResponse = match serde_json::from_value(value) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "malformed provider response");
                continue;
            }
        };
        let Some(id) = response_id(&response.id) else {
            tracing::warn!(id = %response.id, "response without a usable id");
            continue;
        };
        match pending.lock().await.remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => tracing::warn!(id, "response for unknown request"),
        }
    }

    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().await.clear();
    tracing::debug!("provider stream closed");
}

fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        request.id = Some(Value::from(id));

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        tracing::debug!(id, method = %request.method, "sending request");

        if let Err(err) = self.write_line(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        rx.await.map_err(|_| {
            AgentError::Transport(format!(
                "provider closed the connection before answering `{}`",
                request.method
            ))
        })
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        self.write_line(&notification).await
    }

    fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    async fn close(&self) -> Result<()> {
        // Closing stdin asks a well-behaved provider to exit on its own.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "provider process exited"),
                Ok(Err(err)) => tracing::warn!(error = %err, "failed to wait for provider"),
                Err(_) => {
                    tracing::debug!("provider did not exit in time, killing it");
                    child
                        .kill()
                        .await
                        .map_err(|e| AgentError::Transport(format!("failed to kill provider: {e}")))?;
                }
            }
        }

        let reader = self.reader.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = reader {
            handle.abort();
            let _ = handle.await;
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// An initialized MCP session over some transport.
pub struct McpSession {
    transport: Arc<dyn McpTransport>,
    server_info: ServerInfo,
    capabilities: ServerCapabilities,
}

impl McpSession {
    /// Performs the `initialize` handshake and sends
    /// `notifications/initialized`.
    pub async fn initialize(transport: Arc<dyn McpTransport>, client_name: &str) -> Result<Self> {
        let request = JsonRpcRequest::new(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": client_name,
                    "version": env!("CARGO_PKG_VERSION"),
                }
            })),
        );

        let result = transport
            .send(request)
            .await?
            .into_result()
            .map_err(|e| AgentError::Protocol(format!("initialize failed: {e}")))?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| AgentError::Protocol(format!("invalid initialize result: {e}")))?;

        if result.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                server = %result.server_info.name,
                version = %result.protocol_version,
                "provider negotiated a different protocol version"
            );
        }

        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        Ok(Self {
            transport,
            server_info: result.server_info,
            capabilities: result.capabilities,
        })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self
                .transport
                .send(JsonRpcRequest::new("tools/list", params))
                .await?
                .into_result()
                .map_err(|e| AgentError::Protocol(format!("tools/list failed: {e}")))?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| AgentError::Protocol(format!("invalid tools/list result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    /// Calls a tool. A JSON-RPC error response is a provider failure, the
    /// same as an `isError` result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let request = JsonRpcRequest::new(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        );
        let result = self
            .transport
            .send(request)
            .await?
            .into_result()
            .map_err(|e| AgentError::ToolExecution {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        serde_json::from_value(result)
            .map_err(|e| AgentError::Protocol(format!("invalid tools/call result: {e}")))
    }

    pub async fn ping(&self) -> Result<()> {
        self.transport
            .send(JsonRpcRequest::new("ping", None))
            .await?
            .into_result()
            .map(|_| ())
            .map_err(|e| AgentError::Protocol(format!("ping failed: {e}")))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.transport.subscribe()
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}
