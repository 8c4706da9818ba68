//! Child-process transport: newline-delimited JSON-RPC over stdin/stdout

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use super::{PendingRequests, Transport};
use crate::mcp::client::{McpClientError, McpResult};
use crate::mcp::types::{JsonRpcId, JsonRpcRequest, JsonRpcResponse};

/// Grace period between closing stdin and killing the child
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

pub struct StdioTransport {
    backend: String,
    stdin: SharedStdin,
    child: Mutex<Option<Child>>,
    pending: Arc<PendingRequests>,
    closed: CancellationToken,
}

impl StdioTransport {
    /// Spawn `command` and start the stdout dispatcher and stderr logger
    pub fn spawn(
        backend: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> McpResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpClientError::ProcessError(format!("Failed to spawn {}: {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpClientError::ProcessError("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpClientError::ProcessError("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpClientError::ProcessError("Failed to capture stderr".to_string()))?;

        tracing::info!(backend = %backend, command = %command, pid = ?child.id(), "Spawned stdio server");

        let stdin: SharedStdin = Arc::new(Mutex::new(Some(stdin)));
        let pending = PendingRequests::new(backend);
        let closed = CancellationToken::new();

        spawn_stderr_logger(backend.to_string(), stderr);

        // Dispatch stdout frames until EOF, then fail everything still waiting
        {
            let backend = backend.to_string();
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            let stdin = Arc::clone(&stdin);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            if let Some(reply) = pending.route(line) {
                                if let Err(e) = write_frame(&stdin, &reply).await {
                                    tracing::warn!(backend = %backend, error = %e, "Failed to answer server request");
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::info!(backend = %backend, "stdio server closed stdout");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(backend = %backend, error = %e, "Failed to read stdout");
                            break;
                        }
                    }
                }
                closed.cancel();
                pending.fail_all();
            });
        }

        Ok(Self {
            backend: backend.to_string(),
            stdin,
            child: Mutex::new(Some(child)),
            pending,
            closed,
        })
    }
}

fn spawn_stderr_logger(backend: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();

            match reader.read_line(&mut line).await {
                Ok(0) => {
                    tracing::debug!(backend = %backend, "stderr stream closed");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    if trimmed.contains("ERROR") || trimmed.contains("FATAL") {
                        tracing::error!(backend = %backend, stderr = %trimmed);
                    } else if trimmed.contains("WARN") {
                        tracing::warn!(backend = %backend, stderr = %trimmed);
                    } else {
                        tracing::debug!(backend = %backend, stderr = %trimmed);
                    }
                }
                Err(e) => {
                    tracing::error!(backend = %backend, error = %e, "Failed to read stderr");
                    break;
                }
            }
        }
    });
}

async fn write_frame<T: serde::Serialize>(stdin: &SharedStdin, frame: &T) -> McpResult<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');

    let mut guard = stdin.lock().await;
    let writer = guard.as_mut().ok_or(McpClientError::Closed)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        if self.closed.is_cancelled() {
            return Err(McpClientError::Closed);
        }
        let id = request
            .id
            .as_ref()
            .and_then(JsonRpcId::as_i64)
            .ok_or(McpClientError::InvalidResponse)?;

        let waiter = self.pending.register(id);
        write_frame(&self.stdin, &request).await?;
        waiter.wait().await
    }

    async fn notify(&self, notification: JsonRpcRequest) -> McpResult<()> {
        write_frame(&self.stdin, &notification).await
    }

    fn progress(&self) -> Option<broadcast::Receiver<Value>> {
        Some(self.pending.subscribe_progress())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        self.closed.cancel();

        // Closing stdin asks the server to exit
        drop(self.stdin.lock().await.take());

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(backend = %self.backend, ?status, "stdio server exited");
            }
            Ok(Err(e)) => {
                tracing::error!(backend = %self.backend, error = %e, "Error waiting for stdio server");
            }
            Err(_) => {
                tracing::warn!(backend = %self.backend, "Killing unresponsive stdio server");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }

        self.pending.fail_all();
    }
}
