//! One tool server subprocess and its JSON-RPC connection
//!
//! The child process, its stdin, and the pending-request map are owned by a
//! single connection task. Handles talk to it over a command channel, so
//! no lock guards the pending map.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use triad_core::config::{ServerConfig, ToolsConfig};
use triad_core::{Result, ToolInfo, TriadError};

use crate::protocol::{
    InitializeParams, JsonRpcMessage, JsonRpcReply, JsonRpcRequest, ToolCallOutcome,
    ToolCallParams, ToolsListResult, JSONRPC_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};

type Reply = oneshot::Sender<Result<Value>>;

enum Command {
    Request {
        id: u64,
        method: String,
        params: Value,
        reply: Reply,
    },
    Notify {
        method: String,
    },
    Cancel {
        id: u64,
    },
    Shutdown {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

/// Observable state of a server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub ready: bool,
    pub tool_count: usize,
    pub pid: Option<u32>,
    pub pending: usize,
}

/// Handle to a running tool server
pub struct ToolServer {
    name: String,
    commands: mpsc::Sender<Command>,
    next_id: AtomicU64,
    ready: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    pid: Option<u32>,
    tools: Vec<ToolInfo>,
    call_timeout: Duration,
    shutdown_grace: Duration,
}

impl ToolServer {
    /// Spawn the server and complete the handshake
    ///
    /// A handshake that does not finish within the handshake timeout is
    /// fatal: the child is killed and `HandshakeTimeout` returned.
    #[instrument(skip(config, settings), fields(server = %config.name))]
    pub async fn start(config: &ServerConfig, settings: &ToolsConfig) -> Result<Self> {
        let mut child = ProcessCommand::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TriadError::Spawn {
                server: config.name.clone(),
                message: e.to_string(),
            })?;

        let missing = |stream: &str| TriadError::Spawn {
            server: config.name.clone(),
            message: format!("no {} pipe", stream),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "stderr: {}", line.trim_end());
                }
            });
        }

        let pid = child.id();
        let ready = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));
        let (commands, command_rx) = mpsc::channel(64);

        let connection = Connection {
            name: config.name.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stdout_open: true,
            commands: command_rx,
            pending: HashMap::new(),
            ready: ready.clone(),
            pending_count: pending.clone(),
        };
        tokio::spawn(connection.run());

        let mut server = Self {
            name: config.name.clone(),
            commands,
            next_id: AtomicU64::new(1),
            ready,
            pending,
            pid,
            tools: Vec::new(),
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
        };

        match server.handshake(settings).await {
            Ok(tools) => {
                server.tools = tools;
                server.ready.store(true, Ordering::SeqCst);
                info!(
                    server = %server.name,
                    pid = ?server.pid,
                    tools = server.tools.len(),
                    "Tool server ready"
                );
                Ok(server)
            }
            Err(e) => {
                warn!(server = %server.name, "Handshake failed: {}", e);
                server.shutdown().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, settings: &ToolsConfig) -> Result<Vec<ToolInfo>> {
        let handshake_timeout = Duration::from_millis(settings.handshake_timeout_ms);
        let init = self
            .request(
                METHOD_INITIALIZE,
                serde_json::to_value(InitializeParams::triad())?,
                handshake_timeout,
            )
            .await
            .map_err(|e| match e {
                TriadError::ToolCallTimeout { .. } => TriadError::HandshakeTimeout {
                    server: self.name.clone(),
                    timeout_ms: settings.handshake_timeout_ms,
                },
                other => other,
            })?;

        self.notify(METHOD_INITIALIZED).await?;

        let listed = self
            .request(
                METHOD_TOOLS_LIST,
                serde_json::json!({}),
                Duration::from_millis(settings.list_timeout_ms),
            )
            .await
            .and_then(|value| Ok(serde_json::from_value::<ToolsListResult>(value)?.tools));

        match listed {
            Ok(tools) => Ok(tools),
            Err(e) => {
                warn!(server = %self.name, "tools/list failed, using initialize capabilities: {}", e);
                Ok(init
                    .pointer("/capabilities/tools")
                    .and_then(|tools| serde_json::from_value::<Vec<ToolInfo>>(tools.clone()).ok())
                    .unwrap_or_default())
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[ToolInfo] {
        &self.tools
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether this server is ready and advertises `tool`
    pub fn provides(&self, tool: &str) -> bool {
        self.is_ready() && self.tools.iter().any(|t| t.name == tool)
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.name.clone(),
            ready: self.is_ready(),
            tool_count: self.tools.len(),
            pid: self.pid,
            pending: self.pending.load(Ordering::SeqCst),
        }
    }

    /// Invoke `tools/call` on this server
    #[instrument(skip(self, arguments), fields(server = %self.name))]
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolCallOutcome> {
        if !self.is_ready() {
            return Err(TriadError::ProcessExited(self.name.clone()));
        }
        let params = serde_json::to_value(ToolCallParams {
            name: tool.to_string(),
            arguments,
        })?;
        let result = self
            .request(METHOD_TOOLS_CALL, params, self.call_timeout)
            .await
            .map_err(|e| match e {
                TriadError::ToolCallTimeout { timeout_ms, .. } => TriadError::ToolCallTimeout {
                    tool: tool.to_string(),
                    timeout_ms,
                },
                other => other,
            })?;
        Ok(ToolCallOutcome::from_result(result))
    }

    /// Send a request and wait for the response with the same id
    ///
    /// Settles exactly once: with the response, with the server's error, with
    /// `ProcessExited`, or with `ToolCallTimeout`. On timeout the pending entry
    /// is removed from the connection.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Request {
                id,
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| TriadError::ProcessExited(self.name.clone()))?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TriadError::ProcessExited(self.name.clone())),
            Err(_) => {
                let _ = self.commands.send(Command::Cancel { id }).await;
                Err(TriadError::ToolCallTimeout {
                    tool: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        self.commands
            .send(Command::Notify {
                method: method.to_string(),
            })
            .await
            .map_err(|_| TriadError::ProcessExited(self.name.clone()))
    }

    /// SIGTERM, wait the grace period, then SIGKILL
    ///
    /// Outstanding requests are rejected with `ProcessExited`.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let (done, finished) = oneshot::channel();
        let sent = self
            .commands
            .send(Command::Shutdown {
                grace: self.shutdown_grace,
                done,
            })
            .await;
        if sent.is_ok() {
            let _ = finished.await;
        }
        info!(server = %self.name, "Tool server stopped");
    }
}

struct Pending {
    method: String,
    reply: Reply,
}

/// Connection task state
struct Connection {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stdout_open: bool,
    commands: mpsc::Receiver<Command>,
    pending: HashMap<u64, Pending>,
    ready: Arc<AtomicBool>,
    pending_count: Arc<AtomicUsize>,
}

impl Connection {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Request { id, method, params, reply }) => {
                        self.send_request(id, method, params, reply).await;
                    }
                    Some(Command::Notify { method }) => {
                        let line = JsonRpcRequest::notification(method);
                        if let Err(e) = self.write_line(&line).await {
                            warn!(server = %self.name, "Failed to send notification: {}", e);
                        }
                    }
                    Some(Command::Cancel { id }) => {
                        if let Some(entry) = self.pending.remove(&id) {
                            debug!(server = %self.name, id, method = %entry.method, "Request abandoned after timeout");
                        }
                    }
                    Some(Command::Shutdown { grace, done }) => {
                        self.terminate(grace).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        // Every handle is gone.
                        self.terminate(Duration::ZERO).await;
                        break;
                    }
                },
                line = self.stdout.next_line(), if self.stdout_open => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => self.on_exit("stdout closed").await,
                    Err(e) => self.on_exit(&format!("stdout error: {}", e)).await,
                },
            }
            self.pending_count.store(self.pending.len(), Ordering::SeqCst);
        }
        self.pending_count.store(0, Ordering::SeqCst);
    }

    async fn send_request(&mut self, id: u64, method: String, params: Value, reply: Reply) {
        if !self.stdout_open {
            let _ = reply.send(Err(TriadError::ProcessExited(self.name.clone())));
            return;
        }
        let request = JsonRpcRequest::new(id, method.clone(), params);
        match self.write_line(&request).await {
            Ok(()) => {
                // Entries whose caller went away no longer need an answer.
                self.pending.retain(|_, p| !p.reply.is_closed());
                self.pending.insert(id, Pending { method, reply });
            }
            Err(e) => {
                warn!(server = %self.name, "Failed to write request: {}", e);
                let _ = reply.send(Err(TriadError::ProcessExited(self.name.clone())));
            }
        }
    }

    async fn write_line<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let message: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(server = %self.name, "Dropping invalid JSON line: {}", e);
                return;
            }
        };

        if let Some(id) = message.response_id() {
            match self.pending.remove(&id) {
                Some(entry) => {
                    let outcome = match (message.error, message.result) {
                        (Some(error), _) => Err(TriadError::ToolError {
                            code: error.code,
                            message: error.message,
                        }),
                        (None, result) => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = entry.reply.send(outcome);
                }
                None => debug!(server = %self.name, id, "Response for unknown request id"),
            }
            return;
        }

        match (message.method.as_deref(), message.id) {
            (Some(METHOD_PING), Some(id)) => {
                let pong = JsonRpcReply {
                    jsonrpc: JSONRPC_VERSION,
                    id,
                    result: serde_json::json!({}),
                };
                if let Err(e) = self.write_line(&pong).await {
                    warn!(server = %self.name, "Failed to answer ping: {}", e);
                }
            }
            (Some(method), _) => debug!(server = %self.name, method, "Ignoring server message"),
            (None, _) => debug!(server = %self.name, "Ignoring message without id or method"),
        }
    }

    /// The process stopped talking; every outstanding request fails now
    async fn on_exit(&mut self, reason: &str) {
        warn!(
            server = %self.name,
            pending = self.pending.len(),
            "Tool server exited ({})",
            reason
        );
        self.stdout_open = false;
        self.ready.store(false, Ordering::SeqCst);
        self.reject_all();
    }

    fn reject_all(&mut self) {
        for (_, entry) in self.pending.drain() {
            let _ = entry
                .reply
                .send(Err(TriadError::ProcessExited(self.name.clone())));
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        self.ready.store(false, Ordering::SeqCst);
        self.reject_all();

        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(server = %self.name, ?status, "Tool server already exited");
            return;
        }

        if !grace.is_zero() {
            send_sigterm(&self.child).await;
            if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                debug!(server = %self.name, ?status, "Tool server exited after SIGTERM");
                return;
            }
            warn!(server = %self.name, "Tool server ignored SIGTERM, killing");
        }

        if let Err(e) = self.child.kill().await {
            warn!(server = %self.name, "Failed to kill tool server: {}", e);
        }
    }
}

#[cfg(unix)]
async fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = ProcessCommand::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

#[cfg(not(unix))]
async fn send_sigterm(_child: &Child) {}
