//! A single stdio JSON-RPC session with a tool-server subprocess.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::*;
use crate::error::{Error, Result};

/// MCP protocol version we support
const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcMessage>>>>;

/// Client side of a newline-delimited JSON-RPC channel over a child's stdio.
///
/// The child itself is handed back to the caller on spawn; the connection
/// only owns the pipes. When the child's stdout closes, every outstanding
/// request fails with `ServerUnavailable`.
pub struct McpConnection {
    server: String,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    request_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl McpConnection {
    /// Spawn the configured command and attach to its stdio.
    pub fn spawn(config: &ToolServerConfig, workspace_dir: &Path) -> Result<(Self, Child)> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .current_dir(config.working_dir.as_deref().unwrap_or(workspace_dir))
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::ServerUnavailable(format!(
                "failed to spawn tool server '{}' ({}): {}",
                config.name, config.command, e
            ))
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::Internal(format!(
                "tool server '{}' stdio was not captured",
                config.name
            )));
        };

        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{}", line);
                }
            });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let message = match serde_json::from_str::<JsonRpcMessage>(line) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(server = %server, "Ignoring non-JSON-RPC output: {}", e);
                            continue;
                        }
                    };
                    let Some(id) = message.response_id() else {
                        debug!(server = %server, method = ?message.method, "Ignoring server-initiated message");
                        continue;
                    };
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(message);
                    }
                }
                // Dropping the senders fails every waiter.
                closed.store(true, Ordering::SeqCst);
                pending.lock().await.clear();
                debug!(server = %server, "stdout closed");
            })
        };

        Ok((
            Self {
                server: config.name.clone(),
                stdin: Mutex::new(stdin),
                pending,
                closed,
                request_id: AtomicU64::new(1),
                reader,
            },
            child,
        ))
    }

    fn unavailable(&self) -> Error {
        Error::ServerUnavailable(format!("tool server '{}' closed the connection", self.server))
    }

    /// Whether the server's stdout has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn write_line(&self, payload: &impl serde::Serialize) -> Result<()> {
        let mut line = serde_json::to_vec(payload)?;
        line.push(b'\n');
        let broken = |e: std::io::Error| {
            Error::ServerUnavailable(format!("tool server '{}' stdin closed: {}", self.server, e))
        };
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await.map_err(broken)?;
        stdin.flush().await.map_err(broken)
    }

    /// Send a request and wait for its response.
    ///
    /// A JSON-RPC error response comes back as `Error::ToolError` carrying
    /// the server's message.
    pub async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(self.unavailable());
        }

        if let Err(e) = self.write_line(&JsonRpcRequest::new(id, method, params)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let message = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => return Err(self.unavailable()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(Error::Timeout(format!(
                    "'{}' on tool server '{}' after {:?}",
                    method, self.server, timeout
                )));
            }
        };

        if let Some(error) = message.error {
            return Err(Error::ToolError {
                tool: method.to_string(),
                message: error.message,
            });
        }
        Ok(message.result.unwrap_or(Value::Null))
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str) -> Result<()> {
        self.write_line(&JsonRpcNotification::new(method)).await
    }

    /// Perform the MCP handshake.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "rago-agents".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .request("initialize", Some(serde_json::to_value(params)?), timeout)
            .await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            Error::ServerUnavailable(format!("tool server '{}' sent a bad initialize result: {}", self.server, e))
        })?;
        self.notify("notifications/initialized").await?;
        Ok(init)
    }

    /// Fetch the server's tool descriptors.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpToolDescriptor>> {
        let result = self.request("tools/list", None, timeout).await?;
        let tools: McpToolsResponse = serde_json::from_value(result).map_err(|e| {
            Error::ServerUnavailable(format!("tool server '{}' sent a bad tool list: {}", self.server, e))
        })?;
        Ok(tools.tools)
    }

    /// Invoke a tool by its unqualified name.
    pub async fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<McpCallToolResponse> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self
            .request("tools/call", Some(params), timeout)
            .await
            .map_err(|e| match e {
                Error::ToolError { message, .. } => Error::ToolError {
                    tool: name.to_string(),
                    message,
                },
                other => other,
            })?;
        serde_json::from_value(result).map_err(|e| Error::ToolError {
            tool: name.to_string(),
            message: format!("malformed tool result: {}", e),
        })
    }

    /// Liveness probe.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.request("ping", None, timeout).await.map(|_| ())
    }
}

impl Drop for McpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
