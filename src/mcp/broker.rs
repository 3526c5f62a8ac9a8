//! Tool-server broker: supervises subprocesses and routes tool calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::McpConnection;
use super::types::*;
use super::ToolInvoker;
use crate::error::{Error, Result};

/// Grace period between SIGTERM and SIGKILL on close.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Default timeout for a single tool call.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Runtime state of one configured server.
struct ServerSlot {
    config: ToolServerConfig,
    state: ServerState,
    connection: Option<Arc<McpConnection>>,
    tools: Vec<ToolWrapper>,
    pid: Option<u32>,
    restarts: u32,
    last_error: Option<String>,
    server_version: Option<String>,
    supervisor: Option<JoinHandle<()>>,
}

impl ServerSlot {
    fn new(config: ToolServerConfig) -> Self {
        Self {
            config,
            state: ServerState::Stopped,
            connection: None,
            tools: Vec::new(),
            pid: None,
            restarts: 0,
            last_error: None,
            server_version: None,
            supervisor: None,
        }
    }

    fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            name: self.config.name.clone(),
            state: self.state,
            pid: self.pid,
            restarts: self.restarts,
            tool_count: self.tools.len(),
            last_error: self.last_error.clone(),
            server_version: self.server_version.clone(),
        }
    }

    /// Drop the connection and the server's tools in one step.
    fn disconnect(&mut self, state: ServerState, error: Option<String>) {
        self.state = state;
        self.connection = None;
        self.tools.clear();
        self.pid = None;
        if error.is_some() {
            self.last_error = error;
        }
    }
}

struct Shared {
    servers: RwLock<HashMap<String, ServerSlot>>,
    workspace_dir: PathBuf,
    shutdown: CancellationToken,
}

/// A freshly started and initialized server.
struct Launched {
    connection: Arc<McpConnection>,
    child: Child,
    tools: Vec<ToolWrapper>,
    server_version: Option<String>,
}

enum Exit {
    Shutdown,
    Crashed(String),
}

/// Supervisor for a configured set of tool servers.
///
/// All catalog and process-handle state sits behind one lock, so a
/// server's tools appear and disappear atomically.
pub struct ToolBroker {
    shared: Arc<Shared>,
    /// Server names in configuration order
    order: Vec<String>,
    call_timeout: Duration,
}

impl ToolBroker {
    /// Create a broker; nothing is started until `start` is called.
    pub fn new(configs: Vec<ToolServerConfig>, workspace_dir: impl AsRef<Path>) -> Result<Self> {
        super::config::validate_servers(&configs)?;
        let order = configs.iter().map(|c| c.name.clone()).collect();
        let servers = configs
            .into_iter()
            .map(|c| (c.name.clone(), ServerSlot::new(c)))
            .collect();
        Ok(Self {
            shared: Arc::new(Shared {
                servers: RwLock::new(servers),
                workspace_dir: workspace_dir.as_ref().to_path_buf(),
                shutdown: CancellationToken::new(),
            }),
            order,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn auto_start_names(&self) -> Vec<String> {
        let servers = self.shared.servers.read().await;
        self.order
            .iter()
            .filter(|name| servers.get(*name).map_or(false, |s| s.config.auto_start))
            .cloned()
            .collect()
    }

    /// Start every auto-start server concurrently; fails on the first error.
    pub async fn start(&self) -> Result<()> {
        let names = self.auto_start_names().await;
        let results = join_all(names.iter().map(|name| self.start_server(name))).await;
        results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Start every auto-start server concurrently and report which came up.
    pub async fn start_with_failures(&self) -> (Vec<String>, Vec<String>) {
        let names = self.auto_start_names().await;
        let results = join_all(names.iter().map(|name| self.start_server(name))).await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => succeeded.push(name),
                Err(e) => {
                    warn!(server = %name, "Tool server failed to start: {}", e);
                    failed.push(name);
                }
            }
        }
        (succeeded, failed)
    }

    /// Start one server (no-op when already starting or connected).
    pub async fn start_server(&self, name: &str) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::ServerUnavailable(format!("broker is closed; cannot start '{}'", name)));
        }
        let config = {
            let mut servers = self.shared.servers.write().await;
            let slot = servers
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("tool server '{}'", name)))?;
            if matches!(slot.state, ServerState::Starting | ServerState::Connected) {
                return Ok(());
            }
            slot.state = ServerState::Starting;
            slot.config.clone()
        };

        info!(server = %name, command = %config.command, "Starting tool server");
        match launch(&config, &self.shared.workspace_dir).await {
            Ok(launched) => {
                let tool_count = launched.tools.len();
                let mut servers = self.shared.servers.write().await;
                // `close` cancels before taking this lock, so a supervisor
                // stored here is always seen and awaited by it.
                if self.shared.shutdown.is_cancelled() {
                    if let Some(slot) = servers.get_mut(name) {
                        slot.disconnect(ServerState::Stopped, None);
                    }
                    drop(servers);
                    let mut child = launched.child;
                    terminate(name, &mut child).await;
                    return Err(Error::ServerUnavailable(format!(
                        "broker closed while starting '{}'",
                        name
                    )));
                }
                let Some(slot) = servers.get_mut(name) else {
                    return Err(Error::NotFound(format!("tool server '{}'", name)));
                };
                let child = publish(slot, launched);
                slot.supervisor = Some(tokio::spawn(supervise(
                    Arc::clone(&self.shared),
                    name.to_string(),
                    child,
                )));
                info!(server = %name, tools = tool_count, "Tool server connected");
                Ok(())
            }
            Err(e) => {
                if let Some(slot) = self.shared.servers.write().await.get_mut(name) {
                    slot.disconnect(ServerState::Failed, Some(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Stop every server: SIGTERM, then SIGKILL after a grace period.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        let handles: Vec<_> = {
            let mut servers = self.shared.servers.write().await;
            servers.values_mut().filter_map(|s| s.supervisor.take()).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        let mut servers = self.shared.servers.write().await;
        for slot in servers.values_mut() {
            if slot.state != ServerState::Failed {
                slot.disconnect(ServerState::Stopped, None);
            }
        }
        info!("Tool broker closed");
    }

    /// Aggregate catalog of all connected servers, in configuration order.
    pub async fn list_tools(&self) -> Vec<ToolWrapper> {
        let servers = self.shared.servers.read().await;
        self.order
            .iter()
            .filter_map(|name| servers.get(name))
            .flat_map(|slot| slot.tools.iter().cloned())
            .collect()
    }

    /// Tools of a single server (empty when it is down).
    pub async fn list_tools_by_server(&self, name: &str) -> Vec<ToolWrapper> {
        let servers = self.shared.servers.read().await;
        servers.get(name).map(|slot| slot.tools.clone()).unwrap_or_default()
    }

    /// Server name → connected.
    pub async fn get_server_status(&self) -> HashMap<String, bool> {
        let servers = self.shared.servers.read().await;
        servers
            .iter()
            .map(|(name, slot)| (name.clone(), slot.state == ServerState::Connected))
            .collect()
    }

    /// Detailed state of one server.
    pub async fn server_info(&self, name: &str) -> Option<ServerSnapshot> {
        let servers = self.shared.servers.read().await;
        servers.get(name).map(ServerSlot::snapshot)
    }

    /// Details for every configured server, in configuration order.
    pub async fn servers(&self) -> Vec<ServerSnapshot> {
        let servers = self.shared.servers.read().await;
        self.order
            .iter()
            .filter_map(|name| servers.get(name).map(ServerSlot::snapshot))
            .collect()
    }

    /// Configured server whose `<name>_` prefix matches a tool name.
    async fn owning_server(&self, tool_name: &str) -> Option<(String, ServerState, bool)> {
        let servers = self.shared.servers.read().await;
        servers
            .values()
            .filter(|slot| tool_name.starts_with(&format!("{}_", slot.config.name)))
            .max_by_key(|slot| slot.config.name.len())
            .map(|slot| (slot.config.name.clone(), slot.state, slot.config.auto_start))
    }

    async fn route(&self, name: &str) -> Option<(ToolWrapper, Arc<McpConnection>)> {
        let servers = self.shared.servers.read().await;
        let catalog: Vec<ToolWrapper> = servers
            .values()
            .flat_map(|slot| slot.tools.iter().cloned())
            .collect();
        let tool = resolve_tool(&catalog, name)?.clone();
        let connection = servers.get(&tool.server_name)?.connection.clone()?;
        Some((tool, connection))
    }

    /// Invoke a tool by qualified or unqualified name.
    ///
    /// Routing failures (`ToolNotFound`, `ServerUnavailable`) and timeouts
    /// are errors; anything the server reports, schema violations and a
    /// connection lost mid-call come back as `success = false`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let started = Instant::now();

        let routed = match self.route(name).await {
            Some(routed) => Some(routed),
            None => match self.owning_server(name).await {
                Some((server, ServerState::Stopped, false)) => {
                    debug!(server = %server, tool = %name, "Starting tool server on demand");
                    self.start_server(&server).await?;
                    self.route(name).await
                }
                Some((server, _, _)) => {
                    return Err(Error::ServerUnavailable(format!(
                        "tool '{}' belongs to server '{}', which is not connected",
                        name, server
                    )));
                }
                None => None,
            },
        };
        let Some((tool, connection)) = routed else {
            return Err(Error::ToolNotFound(name.to_string()));
        };

        if let Err(message) = validate_arguments(&tool.schema, &arguments) {
            return Ok(ToolCallResult::failed(
                format!("invalid arguments for '{}': {}", tool.name, message),
                started.elapsed(),
            ));
        }

        debug!(tool = %tool.name, server = %tool.server_name, "Calling tool");
        match connection
            .call_tool(&tool.original_name, arguments, self.call_timeout)
            .await
        {
            Ok(response) if response.is_error => {
                let text = response.text();
                let message = if text.is_empty() { "tool reported an error".to_string() } else { text };
                Ok(ToolCallResult::failed(message, started.elapsed()))
            }
            Ok(response) => Ok(ToolCallResult::ok(response.data(), started.elapsed())),
            Err(Error::ToolError { message, .. }) | Err(Error::ServerUnavailable(message)) => {
                Ok(ToolCallResult::failed(message, started.elapsed()))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ToolInvoker for ToolBroker {
    async fn list_tools(&self) -> Vec<ToolWrapper> {
        ToolBroker::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        ToolBroker::call_tool(self, name, arguments).await
    }
}

/// Check arguments against a tool's input schema; trivial schemas pass.
fn validate_arguments(schema: &Value, arguments: &Value) -> std::result::Result<(), String> {
    let Some(object) = schema.as_object() else {
        return Ok(());
    };
    if object.is_empty() {
        return Ok(());
    }
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(e) => {
            debug!("Skipping argument validation, schema does not compile: {}", e);
            return Ok(());
        }
    };
    let errors: Vec<String> = validator.iter_errors(arguments).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Spawn, handshake and list tools, bounded by the startup timeout.
async fn launch(config: &ToolServerConfig, workspace_dir: &Path) -> Result<Launched> {
    let (connection, mut child) = McpConnection::spawn(config, workspace_dir)?;
    let timeout = config.startup_timeout();

    let handshake = async {
        let init = connection.initialize(timeout).await?;
        let tools = connection.list_tools(timeout).await?;
        Ok::<_, Error>((init, tools))
    };

    match handshake.await {
        Ok((init, descriptors)) => {
            let tools = descriptors
                .into_iter()
                .map(|d| ToolWrapper::from_descriptor(&config.name, d))
                .collect();
            Ok(Launched {
                connection: Arc::new(connection),
                child,
                tools,
                server_version: init.server_info.and_then(|i| i.version),
            })
        }
        Err(e) => {
            let status = match child.try_wait() {
                Ok(Some(status)) => format!(" (exited with {})", status),
                _ => {
                    let _ = child.start_kill();
                    String::new()
                }
            };
            Err(Error::ServerUnavailable(format!(
                "tool server '{}' did not initialize: {}{}",
                config.name, e, status
            )))
        }
    }
}

/// Publish a launched server's connection and tools; returns the child.
fn publish(slot: &mut ServerSlot, launched: Launched) -> Child {
    slot.state = ServerState::Connected;
    slot.connection = Some(launched.connection);
    slot.tools = launched.tools;
    slot.pid = launched.child.id();
    slot.server_version = launched.server_version;
    launched.child
}

async fn register(shared: &Shared, name: &str, launched: Launched) -> Child {
    let mut servers = shared.servers.write().await;
    match servers.get_mut(name) {
        Some(slot) => publish(slot, launched),
        None => launched.child,
    }
}

async fn sleep_or_pending(interval: Option<Duration>) {
    match interval {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Wait until the child exits, fails a health check or the broker closes.
async fn watch(shared: &Shared, name: &str, child: &mut Child) -> Exit {
    let (connection, interval) = {
        let servers = shared.servers.read().await;
        match servers.get(name) {
            Some(slot) => (slot.connection.clone(), slot.config.health_check_interval()),
            None => return Exit::Shutdown,
        }
    };

    loop {
        tokio::select! {
            status = child.wait() => {
                return Exit::Crashed(match status {
                    Ok(status) => format!("exited with {}", status),
                    Err(e) => format!("wait failed: {}", e),
                });
            }
            _ = shared.shutdown.cancelled() => return Exit::Shutdown,
            _ = sleep_or_pending(interval) => {
                let (Some(connection), Some(interval)) = (&connection, interval) else { continue };
                if let Err(e) = connection.ping(interval).await {
                    warn!(server = %name, "Health check failed, killing server: {}", e);
                    let _ = child.start_kill();
                }
            }
        }
    }
}

/// SIGTERM, then SIGKILL once the grace period runs out.
async fn terminate(name: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we have not yet reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(server = %name, "Tool server stopped: {}", status),
        Ok(Err(e)) => debug!(server = %name, "Tool server wait failed: {}", e),
        Err(_) => {
            debug!(server = %name, "Tool server ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

/// Own the child for its lifetime and apply the restart policy.
async fn supervise(shared: Arc<Shared>, name: String, mut child: Child) {
    loop {
        let reason = match watch(&shared, &name, &mut child).await {
            Exit::Shutdown => {
                terminate(&name, &mut child).await;
                return;
            }
            Exit::Crashed(reason) => reason,
        };
        warn!(server = %name, "Tool server went down: {}", reason);

        let config = {
            let mut servers = shared.servers.write().await;
            let Some(slot) = servers.get_mut(&name) else { return };
            let exhausted = !slot.config.restart_on_failure || slot.restarts >= slot.config.max_restarts;
            let state = if exhausted { ServerState::Failed } else { ServerState::Starting };
            slot.disconnect(state, Some(reason));
            if exhausted {
                warn!(server = %name, restarts = slot.restarts, "Tool server will not be restarted");
                return;
            }
            slot.config.clone()
        };

        child = loop {
            tokio::select! {
                _ = tokio::time::sleep(config.restart_delay()) => {}
                _ = shared.shutdown.cancelled() => return,
            }
            let attempt = {
                let mut servers = shared.servers.write().await;
                let Some(slot) = servers.get_mut(&name) else { return };
                slot.restarts += 1;
                slot.restarts
            };
            info!(server = %name, attempt, "Restarting tool server");

            match launch(&config, &shared.workspace_dir).await {
                Ok(launched) => break register(&shared, &name, launched).await,
                Err(e) => {
                    let mut servers = shared.servers.write().await;
                    let Some(slot) = servers.get_mut(&name) else { return };
                    let exhausted = slot.restarts >= slot.config.max_restarts;
                    slot.disconnect(
                        if exhausted { ServerState::Failed } else { ServerState::Starting },
                        Some(e.to_string()),
                    );
                    if exhausted {
                        warn!(server = %name, "Tool server restart budget exhausted: {}", e);
                        return;
                    }
                }
            }
        };
        info!(server = %name, "Tool server restarted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_violations_are_reported() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        });
        assert!(validate_arguments(&schema, &json!({"a": 1, "b": 2})).is_ok());
        let err = validate_arguments(&schema, &json!({"a": "one"})).unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_arguments(&json!({}), &json!({"x": 1})).is_ok());
        assert!(validate_arguments(&Value::Null, &json!(null)).is_ok());
    }

    #[test]
    fn duplicate_server_names_are_rejected() {
        let configs = vec![
            ToolServerConfig::new("a", "true", vec![]),
            ToolServerConfig::new("a", "true", vec![]),
        ];
        assert!(matches!(ToolBroker::new(configs, "."), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let broker = ToolBroker::new(vec![], ".").unwrap();
        let err = broker.call_tool("nothing_here", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn spawn_failure_marks_server_failed() {
        let configs = vec![ToolServerConfig::new(
            "ghost",
            "/nonexistent/definitely-not-a-binary",
            vec![],
        )];
        let broker = ToolBroker::new(configs, ".").unwrap();
        let (ok, failed) = broker.start_with_failures().await;
        assert!(ok.is_empty());
        assert_eq!(failed, vec!["ghost".to_string()]);

        let info = broker.server_info("ghost").await.unwrap();
        assert_eq!(info.state, ServerState::Failed);
        assert!(info.last_error.is_some());

        let err = broker.call_tool("ghost_anything", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ServerUnavailable(_)));
    }
}
