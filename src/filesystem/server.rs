//! JSON-RPC request loop for the filesystem provider.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use super::{tool_definitions, FilesystemServer};
use crate::mcp::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};

const SERVER_NAME: &str = "agentwire-filesystem";
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl FilesystemServer {
    /// Serves newline-delimited JSON-RPC until `reader` reaches EOF.
    ///
    /// Requests are answered in arrival order. Change notifications are
    /// interleaved on the same writer.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(mut line) = out_rx.recv().await {
                line.push('\n');
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let mut changes = self.subscribe();
        let change_tx = out_tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(notification) => {
                        let Ok(line) = serde_json::to_string(&notification) else {
                            continue;
                        };
                        if change_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "dropped filesystem change notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        let mut outcome = Ok(());
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let Some(response) = self.handle_line(&line).await else {
                continue;
            };
            let encoded = match serde_json::to_string(&response) {
                Ok(encoded) => encoded,
                Err(err) => {
                    tracing::error!(error = %err, "failed to encode response");
                    continue;
                }
            };
            if out_tx.send(encoded).await.is_err() {
                break;
            }
        }

        forwarder.abort();
        let _ = forwarder.await;
        drop(out_tx);
        match writer_task.await {
            Ok(Err(err)) if outcome.is_ok() => outcome = Err(err),
            Err(join_err) => tracing::error!(error = %join_err, "writer task failed"),
            _ => {}
        }
        tracing::debug!("filesystem provider input closed");
        outcome
    }

    /// Handles one incoming line. Notifications produce no response.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    JsonRpcError::new(JsonRpcError::PARSE_ERROR, format!("Parse error: {err}")),
                ))
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                return Some(JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(
                        JsonRpcError::INVALID_REQUEST,
                        format!("Invalid request: {err}"),
                    ),
                ))
            }
        };

        let Some(id) = request.id.clone() else {
            self.handle_notification(&request);
            return None;
        };
        tracing::debug!(method = %request.method, "handling request");

        let outcome = self
            .handle_request(&request.method, request.params.unwrap_or(Value::Null))
            .await;
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }

    fn handle_notification(&self, notification: &JsonRpcRequest) {
        match notification.method.as_str() {
            "notifications/initialized" => tracing::debug!("client initialized"),
            other => tracing::debug!(method = other, "ignoring notification"),
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")},
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tool_definitions() })),
            "tools/call" => self.call_tool(params).await,
            _ => match method.strip_prefix("filesystem/") {
                Some(operation) => match self.dispatch(operation, params).await {
                    Some(outcome) => outcome.map_err(|err| err.to_rpc_error()),
                    None => Err(method_not_found(method)),
                },
                None => Err(method_not_found(method)),
            },
        }
    }

    /// `tools/call` reports filesystem failures inside the result so the
    /// caller can tell them apart from protocol errors.
    async fn call_tool(&self, params: Value) -> Result<Value, JsonRpcError> {
        let call: CallParams = serde_json::from_value(params).map_err(|err| {
            JsonRpcError::new(JsonRpcError::INVALID_PARAMS, format!("Invalid params: {err}"))
        })?;

        match self.dispatch(&call.name, call.arguments).await {
            Some(Ok(result)) => Ok(json!({
                "content": [{"type": "text", "text": result.to_string()}],
                "structuredContent": result,
                "isError": false,
            })),
            Some(Err(err)) => Ok(json!({
                "content": [{"type": "text", "text": err.to_string()}],
                "isError": true,
            })),
            None => Err(JsonRpcError::new(
                JsonRpcError::INVALID_PARAMS,
                format!("Unknown tool: {}", call.name),
            )),
        }
    }
}

fn method_not_found(method: &str) -> JsonRpcError {
    JsonRpcError::new(
        JsonRpcError::METHOD_NOT_FOUND,
        format!("Unknown method: {method}"),
    )
}
