//! Client side of the wire protocol: one fresh server per unit of work.
//!
//! The client treats the server as disposable. Before each task it kills
//! whatever holds the target port, launches a new server process in its own
//! process group, polls until the socket accepts, runs exactly one `execute`,
//! and reads the stream to the terminal notification. Connections are never
//! reused across tasks, and there is no retry here; callers own retry policy.

use crate::classify::ClassificationTag;
use crate::config::ClientConfig;
use crate::executor::ExecutionOutcome;
use crate::process;
use crate::protocol::{ExecuteParams, Notification, Request, ServerMessage};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use nix::sys::signal::Signal;
use serde_json::Value;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pause after sweeping the port so the OS releases the listener.
const PORT_SETTLE: Duration = Duration::from_millis(500);
/// Slack on top of the task timeout before the stream is declared dead;
/// covers server-side teardown and the terminal notification itself.
const WALL_CLOCK_MARGIN: Duration = Duration::from_secs(30);
const EXECUTE_REQUEST_ID: u64 = 1;

#[derive(Debug)]
pub enum ClientError {
    /// The server process could not be launched.
    Launch { source: std::io::Error },
    /// No connection was accepted before the startup deadline.
    StartupTimeout { deadline_secs: u64 },
    /// Socket-level failure mid-stream.
    Socket {
        source: tokio_tungstenite::tungstenite::Error,
    },
    /// The connection closed before a terminal notification arrived.
    ConnectionClosed,
    /// Nothing terminal arrived within the wall-clock budget.
    StreamTimeout { elapsed_secs: u64 },
    /// The server answered the execute request with an error.
    Rpc { code: i32, message: String },
    /// A frame arrived that could not be parsed.
    Protocol { source: serde_json::Error },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Launch { source } => write!(f, "failed to launch server: {source}"),
            ClientError::StartupTimeout { deadline_secs } => {
                write!(
                    f,
                    "server did not accept a connection within {deadline_secs}s"
                )
            }
            ClientError::Socket { source } => write!(f, "websocket failure: {source}"),
            ClientError::ConnectionClosed => {
                write!(f, "connection closed before a terminal notification")
            }
            ClientError::StreamTimeout { elapsed_secs } => {
                write!(f, "no terminal notification after {elapsed_secs}s")
            }
            ClientError::Rpc { code, message } => write!(f, "server error {code}: {message}"),
            ClientError::Protocol { source } => write!(f, "malformed server frame: {source}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Launch { source } => Some(source),
            ClientError::Socket { source } => Some(source),
            ClientError::Protocol { source } => Some(source),
            _ => None,
        }
    }
}

/// Everything a caller learns from one unit of work.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Completed and cancelled count as success; timeouts and process errors
    /// do not.
    pub success: bool,
    pub status: String,
    pub exit_code: Option<i32>,
    /// First classified error seen on the stream, if any.
    pub classification: Option<ClassificationTag>,
    pub retry_after: Option<u64>,
    /// Both streams concatenated in arrival order.
    pub output: String,
    /// Whether sequence numbers arrived strictly in order with no gaps.
    pub seq_gapless: bool,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Time spent killing and relaunching the server, when that happened.
    pub restart_overhead: Option<Duration>,
    pub server_pid: Option<u32>,
    pub process_pid: Option<u32>,
}

pub struct ReconnectingClient {
    config: ClientConfig,
    server: Option<tokio::process::Child>,
}

impl ReconnectingClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            server: None,
        }
    }

    /// Run one command to its terminal notification.
    ///
    /// With `restart_per_task` set, a fresh server is stood up first and the
    /// previous one is killed. The call never hangs: connect attempts are
    /// bounded by the startup deadline and the stream read by the task
    /// timeout plus a fixed margin.
    pub async fn run_task(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<TaskReport, ClientError> {
        let task_start = Instant::now();
        let started_at = Utc::now();
        let restart_overhead = if self.config.restart_per_task {
            let restart_start = Instant::now();
            self.restart_server().await?;
            Some(restart_start.elapsed())
        } else {
            None
        };
        let server_pid = self.server.as_ref().and_then(|child| child.id());

        let mut ws = self.connect_with_deadline().await?;
        let wall_deadline = Instant::now() + timeout + WALL_CLOCK_MARGIN;
        let recv_timeout = Duration::from_secs(self.config.recv_timeout_secs);

        // greeting always comes first
        match next_server_message(&mut ws, recv_timeout, wall_deadline).await? {
            ServerMessage::Notification(Notification::Connected { session_id, .. }) => {
                tracing::debug!(session_id = %session_id, "connected");
            }
            other => {
                tracing::warn!(frame = ?other, "expected greeting, continuing anyway");
            }
        }

        let request = Request::Execute(ExecuteParams {
            command: command.to_string(),
            timeout: Some(timeout.as_secs()),
            session_id: None,
        });
        let frame = request
            .to_frame(EXECUTE_REQUEST_ID)
            .map_err(|source| ClientError::Protocol { source })?;
        ws.send(WsMessage::text(frame))
            .await
            .map_err(|source| ClientError::Socket { source })?;

        let mut output = String::new();
        let mut next_seq = 0u64;
        let mut seq_gapless = true;
        let mut classification: Option<ClassificationTag> = None;
        let mut retry_after = None;
        let mut process_pid = None;

        loop {
            match next_server_message(&mut ws, recv_timeout, wall_deadline).await? {
                ServerMessage::Response(response) => {
                    if let Some(error) = response.error {
                        return Err(ClientError::Rpc {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    if let Some(result) = response.result {
                        if process_pid.is_none() {
                            process_pid =
                                result.get("pid").and_then(Value::as_u64).map(|p| p as u32);
                        }
                    }
                }
                ServerMessage::Notification(note) => match note {
                    Notification::ProcessStarted { pid, .. } => {
                        process_pid.get_or_insert(pid);
                    }
                    Notification::ProcessOutput { data, seq, .. } => {
                        if seq != next_seq {
                            seq_gapless = false;
                        }
                        next_seq = seq + 1;
                        output.push_str(&data);
                    }
                    Notification::TokenLimitExceeded { .. } => {
                        classification.get_or_insert(ClassificationTag::TokenLimitExceeded);
                    }
                    Notification::RateLimitExceeded {
                        retry_after: hint, ..
                    } => {
                        classification.get_or_insert(ClassificationTag::RateLimitExceeded);
                        retry_after = retry_after.or(hint);
                    }
                    Notification::AuthenticationFailed { .. } => {
                        classification.get_or_insert(ClassificationTag::AuthFailure);
                    }
                    Notification::ServiceUnavailable { .. } => {
                        classification.get_or_insert(ClassificationTag::ServiceUnavailable);
                    }
                    Notification::ProcessCompleted {
                        status, exit_code, ..
                    } => {
                        let success = ExecutionOutcome::from_status(&status)
                            .map(|outcome| !outcome.is_failure())
                            .unwrap_or(false);
                        let report = TaskReport {
                            success,
                            status,
                            exit_code,
                            classification,
                            retry_after,
                            output,
                            seq_gapless,
                            started_at,
                            duration: task_start.elapsed(),
                            restart_overhead,
                            server_pid,
                            process_pid,
                        };
                        tracing::info!(
                            status = %report.status,
                            exit_code = ?report.exit_code,
                            duration_ms = report.duration.as_millis() as u64,
                            "task finished"
                        );
                        let _ = ws.close(None).await;
                        return Ok(report);
                    }
                    Notification::Connected { .. }
                    | Notification::Heartbeat { .. }
                    | Notification::ProcessPaused { .. }
                    | Notification::ProcessResumed { .. } => {}
                },
            }
        }
    }

    /// Kill whatever serves the port, then launch a fresh server.
    async fn restart_server(&mut self) -> Result<(), ClientError> {
        if let Some(mut old) = self.server.take() {
            if let Some(pid) = old.id() {
                process::signal_group(pid as i32, Signal::SIGKILL);
            }
            let _ = old.wait().await;
        }
        // sweep strays that we did not launch ourselves
        let sweep = format!(
            "lsof -ti:{port} | xargs -r kill -9",
            port = self.config.port
        );
        let _ = Command::new("sh")
            .arg("-c")
            .arg(&sweep)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        tokio::time::sleep(PORT_SETTLE).await;

        let mut command = match &self.config.server_command {
            Some(custom) => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(custom);
                c
            }
            None => {
                let exe = std::env::current_exe()
                    .map_err(|source| ClientError::Launch { source })?;
                let mut c = Command::new(exe);
                c.arg("serve").arg("--port").arg(self.config.port.to_string());
                c
            }
        };
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|source| ClientError::Launch { source })?;
        tracing::info!(
            pid = child.id().unwrap_or(0),
            port = self.config.port,
            "launched fresh server"
        );
        self.server = Some(child);
        Ok(())
    }

    /// Poll the endpoint until it accepts or the startup deadline passes.
    async fn connect_with_deadline(&self) -> Result<WsStream, ClientError> {
        let url = format!("ws://{}:{}/ws/mcp", self.config.host, self.config.port);
        let deadline = Instant::now() + Duration::from_secs(self.config.startup_deadline_secs);
        loop {
            let attempt = tokio::time::timeout(
                Duration::from_millis(self.config.connect_timeout_ms),
                connect_async(url.as_str()),
            )
            .await;
            match attempt {
                Ok(Ok((ws, _))) => return Ok(ws),
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "connect attempt failed");
                }
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(ClientError::StartupTimeout {
                    deadline_secs: self.config.startup_deadline_secs,
                });
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    /// Kill the server we launched, if it is still ours. Used by callers
    /// that want a clean process table when they are done.
    pub async fn shutdown_server(&mut self) {
        if let Some(mut child) = self.server.take() {
            if let Some(pid) = child.id() {
                process::signal_group(pid as i32, Signal::SIGKILL);
            }
            let _ = child.wait().await;
        }
    }
}

/// Read the next JSON frame, tolerating quiet stretches up to the wall
/// deadline. A single receive timeout is not fatal; running past the wall
/// deadline is.
async fn next_server_message(
    ws: &mut WsStream,
    recv_timeout: Duration,
    wall_deadline: Instant,
) -> Result<ServerMessage, ClientError> {
    let started = Instant::now();
    loop {
        match tokio::time::timeout(recv_timeout, ws.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                return ServerMessage::parse(text.as_str())
                    .map_err(|source| ClientError::Protocol { source });
            }
            Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => {
                return Err(ClientError::ConnectionClosed);
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(source))) => return Err(ClientError::Socket { source }),
            Err(_) => {
                if Instant::now() >= wall_deadline {
                    return Err(ClientError::StreamTimeout {
                        elapsed_secs: started.elapsed().as_secs(),
                    });
                }
            }
        }
    }
}
