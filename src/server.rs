//! WebSocket execution service.
//!
//! One JSON-RPC connection per client over `/ws/mcp`, plus two plain HTTP
//! health endpoints. Every connection is greeted with a `connected` frame
//! carrying its default session id, then requests are dispatched against the
//! shared session registry. Output streaming runs on its own task, so control
//! frames stay responsive while a process runs, and a client that disconnects
//! mid-execution leaves the execution running.

use crate::classify::{ClassificationTag, ErrorReport, OutputClassifier, TOKEN_LIMIT_SUGGESTION};
use crate::config::CrucibleConfig;
use crate::executor::{
    ExecEvent, ExecRequest, ExecutionOutcome, ExecutorSettings, StartError, TerminalObserver,
};
use crate::protocol::{
    validate_command, Notification, Request, RpcError, RpcResponse, SessionParams, CAPABILITIES,
    ERROR_COMMAND_NOT_ALLOWED, ERROR_INTERNAL, ERROR_INVALID_PARAMS, ERROR_PROCESS_NOT_FOUND,
    ERROR_SESSION_LIMIT, PROTOCOL_VERSION, SERVICE_NAME,
};
use crate::registry::{RegistryError, SessionRegistry};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

type SocketSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Shared handles behind every connection and endpoint.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<SessionRegistry>,
    classifier: Arc<OutputClassifier>,
    allowed_commands: Arc<Vec<String>>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: &CrucibleConfig) -> Self {
        let classifier = Arc::new(OutputClassifier::new(&config.classifier));
        let registry = Arc::new(SessionRegistry::new(
            config.server.max_sessions,
            ExecutorSettings::from_config(&config.server),
            Arc::clone(&classifier),
            Arc::new(LogObserver),
        ));
        Self {
            registry,
            classifier,
            allowed_commands: Arc::new(config.server.allowed_commands.clone()),
            started_at: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

struct LogObserver;

impl TerminalObserver for LogObserver {
    fn on_terminal(&self, session_id: &str, outcome: ExecutionOutcome) {
        tracing::debug!(session_id, outcome = %outcome, "session reached terminal state");
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/ws/mcp", get(ws_upgrade))
        .with_state(state)
}

/// Bind and serve until ctrl-c, then cancel whatever is still running.
pub async fn run(config: &CrucibleConfig) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::new(config);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let registry = Arc::clone(state.registry());
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;
    Ok(())
}

async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down, cancelling active executions");
    registry.shutdown();
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": PROTOCOL_VERSION,
        "active_sessions": state.registry.session_count(),
        "max_sessions": state.registry.max_sessions(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    let (sink, mut receiver) = socket.split();
    let sender: SocketSender = Arc::new(Mutex::new(sink));

    let greeting = Notification::Connected {
        session_id: connection_id.clone(),
        version: PROTOCOL_VERSION.to_string(),
        capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
    };
    if send_notification(&sender, &greeting).await.is_err() {
        return;
    }
    tracing::info!(connection_id = %connection_id, "client connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_frame(&state, &sender, &connection_id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            // axum answers pings on its own
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "socket error");
                break;
            }
        }
    }
    // in-flight executions are left running; a later connection can address
    // them by session id
    tracing::info!(connection_id = %connection_id, "client disconnected");
}

async fn handle_frame(state: &AppState, sender: &SocketSender, connection_id: &str, text: &str) {
    let (request, id) = match Request::parse(text) {
        Ok(parsed) => parsed,
        Err((error, id)) => {
            let _ = send_response(sender, RpcResponse::failure(error, id)).await;
            return;
        }
    };
    match request {
        Request::Execute(params) => {
            let session_id = params
                .session_id
                .clone()
                .unwrap_or_else(|| connection_id.to_string());
            handle_execute(state, sender, session_id, params, id).await;
        }
        Request::Cancel(params) => handle_cancel(state, sender, connection_id, params, id).await,
        Request::Pause(params) => handle_pause(state, sender, connection_id, params, id).await,
        Request::Resume(params) => handle_resume(state, sender, connection_id, params, id).await,
    }
}

async fn handle_execute(
    state: &AppState,
    sender: &SocketSender,
    session_id: String,
    params: crate::protocol::ExecuteParams,
    id: Option<Value>,
) {
    if let Err(reason) = validate_command(&params.command, &state.allowed_commands) {
        let _ = send_response(
            sender,
            RpcResponse::failure(RpcError::new(ERROR_COMMAND_NOT_ALLOWED, reason), id),
        )
        .await;
        return;
    }

    let executor = match state.registry.get_or_create(&session_id) {
        Ok(executor) => executor,
        Err(err @ RegistryError::SessionLimit { .. }) => {
            let _ = send_response(
                sender,
                RpcResponse::failure(RpcError::new(ERROR_SESSION_LIMIT, err.to_string()), id),
            )
            .await;
            return;
        }
    };

    let request = ExecRequest {
        command: params.command,
        timeout: params.timeout.map(Duration::from_secs),
    };
    let started = match executor.start(request).await {
        Ok(started) => started,
        Err(StartError::AlreadyRunning) => {
            let _ = send_response(
                sender,
                RpcResponse::failure(
                    RpcError::new(ERROR_INVALID_PARAMS, "A process is already running"),
                    id,
                ),
            )
            .await;
            return;
        }
        Err(err @ StartError::Spawn { .. }) => {
            let _ = send_response(
                sender,
                RpcResponse::failure(RpcError::new(ERROR_INTERNAL, err.to_string()), id),
            )
            .await;
            return;
        }
    };

    let _ = send_response(
        sender,
        RpcResponse::success(
            json!({"status": "started", "pid": started.pid, "pgid": started.pgid}),
            id,
        ),
    )
    .await;
    let _ = send_notification(
        sender,
        &Notification::ProcessStarted {
            status: "started".to_string(),
            pid: started.pid,
            pgid: started.pgid,
        },
    )
    .await;

    // stream on a separate task so the read loop keeps serving cancel and
    // pause while the process runs
    tokio::spawn(forward_events(
        Arc::clone(sender),
        session_id,
        started.events,
        Arc::clone(&state.classifier),
    ));
}

async fn forward_events(
    sender: SocketSender,
    session_id: String,
    mut events: mpsc::Receiver<ExecEvent>,
    classifier: Arc<OutputClassifier>,
) {
    while let Some(event) = events.recv().await {
        let note = match event {
            ExecEvent::Output {
                stream,
                text,
                seq,
                truncated,
                ..
            } => Some(Notification::ProcessOutput {
                stream: stream.as_str().to_string(),
                data: text,
                seq,
                truncated,
            }),
            ExecEvent::Heartbeat => Some(Notification::Heartbeat {
                session_id: session_id.clone(),
            }),
            ExecEvent::ClassifiedError(report) => {
                error_notification(&report, classifier.token_limit())
            }
            ExecEvent::Terminal(info) => {
                let _ = send_notification(
                    &sender,
                    &Notification::ProcessCompleted {
                        status: info.outcome.as_str().to_string(),
                        exit_code: info.exit_code,
                        pid: Some(info.pid),
                        pgid: Some(info.pgid),
                    },
                )
                .await;
                return;
            }
        };
        if let Some(note) = note {
            if send_notification(&sender, &note).await.is_err() {
                // client gone; dropping the receiver lets the execution
                // finish unattended
                return;
            }
        }
    }
}

fn error_notification(report: &ErrorReport, token_limit: u64) -> Option<Notification> {
    match report.tag {
        ClassificationTag::TokenLimitExceeded => Some(Notification::TokenLimitExceeded {
            limit: token_limit,
            suggestion: TOKEN_LIMIT_SUGGESTION.to_string(),
        }),
        ClassificationTag::RateLimitExceeded => Some(Notification::RateLimitExceeded {
            message: report.message.clone(),
            retry_after: report.retry_after,
        }),
        ClassificationTag::AuthFailure => Some(Notification::AuthenticationFailed {
            message: report.message.clone(),
        }),
        ClassificationTag::ServiceUnavailable => Some(Notification::ServiceUnavailable {
            message: report.message.clone(),
        }),
        // generic errors only influence the exit classification
        ClassificationTag::Normal | ClassificationTag::GenericError => None,
    }
}

fn target_session<'a>(connection_id: &'a str, params: &'a SessionParams) -> &'a str {
    params.session_id.as_deref().unwrap_or(connection_id)
}

async fn handle_cancel(
    state: &AppState,
    sender: &SocketSender,
    connection_id: &str,
    params: SessionParams,
    id: Option<Value>,
) {
    let session_id = target_session(connection_id, &params);
    let cancelled = state
        .registry
        .get(session_id)
        .map(|executor| executor.cancel())
        .unwrap_or(false);
    let response = if cancelled {
        tracing::info!(session_id, "cancel requested");
        RpcResponse::success(json!({"status": "cancelled"}), id)
    } else {
        RpcResponse::failure(
            RpcError::new(ERROR_PROCESS_NOT_FOUND, "No process is currently running"),
            id,
        )
    };
    let _ = send_response(sender, response).await;
}

async fn handle_pause(
    state: &AppState,
    sender: &SocketSender,
    connection_id: &str,
    params: SessionParams,
    id: Option<Value>,
) {
    let session_id = target_session(connection_id, &params);
    let paused = state
        .registry
        .get(session_id)
        .map(|executor| executor.pause())
        .unwrap_or(false);
    if paused {
        let _ = send_response(
            sender,
            RpcResponse::success(json!({"status": "paused"}), id),
        )
        .await;
        let _ = send_notification(
            sender,
            &Notification::ProcessPaused {
                status: "paused".to_string(),
            },
        )
        .await;
    } else {
        let _ = send_response(
            sender,
            RpcResponse::failure(
                RpcError::new(ERROR_PROCESS_NOT_FOUND, "No process is currently running"),
                id,
            ),
        )
        .await;
    }
}

async fn handle_resume(
    state: &AppState,
    sender: &SocketSender,
    connection_id: &str,
    params: SessionParams,
    id: Option<Value>,
) {
    let session_id = target_session(connection_id, &params);
    let resumed = state
        .registry
        .get(session_id)
        .map(|executor| executor.resume())
        .unwrap_or(false);
    if resumed {
        let _ = send_response(
            sender,
            RpcResponse::success(json!({"status": "resumed"}), id),
        )
        .await;
        let _ = send_notification(
            sender,
            &Notification::ProcessResumed {
                status: "resumed".to_string(),
            },
        )
        .await;
    } else {
        let _ = send_response(
            sender,
            RpcResponse::failure(
                RpcError::new(ERROR_PROCESS_NOT_FOUND, "No process is currently running"),
                id,
            ),
        )
        .await;
    }
}

async fn send_notification(
    sender: &SocketSender,
    note: &Notification,
) -> Result<(), axum::Error> {
    match note.to_frame() {
        Ok(text) => send_text(sender, text).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode notification");
            Ok(())
        }
    }
}

async fn send_response(sender: &SocketSender, response: RpcResponse) -> Result<(), axum::Error> {
    match serde_json::to_string(&response) {
        Ok(text) => send_text(sender, text).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode response");
            Ok(())
        }
    }
}

async fn send_text(sender: &SocketSender, text: String) -> Result<(), axum::Error> {
    let mut guard = sender.lock().await;
    guard.send(Message::Text(text.into())).await
}
