//! JSON-RPC 2.0 frames shared by the server and the client.
//!
//! Requests and notifications are closed sums: every method the wire knows
//! is a variant here, and dispatch is an exhaustive match rather than
//! string-keyed lookups scattered through the handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const SERVICE_NAME: &str = "crucible";
pub const CAPABILITIES: [&str; 3] = ["execute", "control", "stream"];

// JSON-RPC error codes.
pub const ERROR_PARSE: i32 = -32700;
pub const ERROR_INVALID_REQUEST: i32 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERROR_INVALID_PARAMS: i32 = -32602;
pub const ERROR_INTERNAL: i32 = -32603;
// Service-specific codes.
pub const ERROR_SESSION_LIMIT: i32 = -32001;
pub const ERROR_COMMAND_NOT_ALLOWED: i32 = -32002;
pub const ERROR_PROCESS_NOT_FOUND: i32 = -32003;
pub const ERROR_STREAM_TIMEOUT: i32 = -32004;

/// Parameters of an `execute` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteParams {
    pub command: String,
    /// Wall-clock limit in seconds; server default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Target session; defaults to the connection's session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Parameters of the session-addressed control requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Every request the wire accepts.
#[derive(Debug, Clone)]
pub enum Request {
    Execute(ExecuteParams),
    Cancel(SessionParams),
    Pause(SessionParams),
    Resume(SessionParams),
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// JSON-RPC response envelope; exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcResponse {
    pub fn success(result: Value, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(error: RpcError, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Lenient inbound envelope, parsed before method dispatch so that malformed
/// input maps onto the right error code.
#[derive(Debug, Deserialize)]
struct RawFrame {
    jsonrpc: Option<String>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Option<Value>,
}

impl Request {
    /// Parse one inbound text frame.
    ///
    /// Distinguishes, per JSON-RPC: unparseable text (`-32700`), a frame
    /// without a valid envelope (`-32600`), a method outside the closed set
    /// (`-32601`), and params that do not fit the method (`-32602`). The
    /// request id is preserved for the error response whenever it survived
    /// parsing.
    pub fn parse(text: &str) -> Result<(Request, Option<Value>), (RpcError, Option<Value>)> {
        let frame: RawFrame = serde_json::from_str(text)
            .map_err(|e| (RpcError::new(ERROR_PARSE, format!("parse error: {e}")), None))?;
        let id = frame.id;

        if frame.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            return Err((
                RpcError::new(ERROR_INVALID_REQUEST, "missing or invalid jsonrpc version"),
                id,
            ));
        }
        let Some(method) = frame.method else {
            return Err((RpcError::new(ERROR_INVALID_REQUEST, "missing method"), id));
        };
        // Absent params are treated as an empty object.
        let params = if frame.params.is_null() {
            Value::Object(Default::default())
        } else {
            frame.params
        };

        let request = match method.as_str() {
            "execute" => Request::Execute(serde_json::from_value(params).map_err(|e| {
                (
                    RpcError::new(ERROR_INVALID_PARAMS, format!("invalid params: {e}")),
                    id.clone(),
                )
            })?),
            "cancel" => Request::Cancel(parse_session_params(params, &id)?),
            "pause" => Request::Pause(parse_session_params(params, &id)?),
            "resume" => Request::Resume(parse_session_params(params, &id)?),
            other => {
                return Err((
                    RpcError::new(ERROR_METHOD_NOT_FOUND, format!("unknown method: {other}")),
                    id,
                ));
            }
        };
        Ok((request, id))
    }

    /// Serialize as an outbound frame with the given request id.
    pub fn to_frame(&self, id: u64) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct OutgoingRequest {
            jsonrpc: &'static str,
            method: &'static str,
            params: Value,
            id: u64,
        }
        let (method, params) = match self {
            Request::Execute(p) => ("execute", serde_json::to_value(p)?),
            Request::Cancel(p) => ("cancel", serde_json::to_value(p)?),
            Request::Pause(p) => ("pause", serde_json::to_value(p)?),
            Request::Resume(p) => ("resume", serde_json::to_value(p)?),
        };
        serde_json::to_string(&OutgoingRequest {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id,
        })
    }
}

fn parse_session_params(
    params: Value,
    id: &Option<Value>,
) -> Result<SessionParams, (RpcError, Option<Value>)> {
    serde_json::from_value(params).map_err(|e| {
        (
            RpcError::new(ERROR_INVALID_PARAMS, format!("invalid params: {e}")),
            id.clone(),
        )
    })
}

/// Every notification the server emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Notification {
    #[serde(rename = "connected")]
    Connected {
        session_id: String,
        version: String,
        capabilities: Vec<String>,
    },
    #[serde(rename = "process.started")]
    ProcessStarted { status: String, pid: u32, pgid: i32 },
    #[serde(rename = "process.output")]
    ProcessOutput {
        #[serde(rename = "type")]
        stream: String,
        data: String,
        seq: u64,
        truncated: bool,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat { session_id: String },
    #[serde(rename = "error.token_limit_exceeded")]
    TokenLimitExceeded { limit: u64, suggestion: String },
    #[serde(rename = "error.rate_limit_exceeded")]
    RateLimitExceeded {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    #[serde(rename = "error.authentication_failed")]
    AuthenticationFailed { message: String },
    #[serde(rename = "error.service_unavailable")]
    ServiceUnavailable { message: String },
    #[serde(rename = "process.paused")]
    ProcessPaused { status: String },
    #[serde(rename = "process.resumed")]
    ProcessResumed { status: String },
    #[serde(rename = "process.completed")]
    ProcessCompleted {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pgid: Option<i32>,
    },
}

#[derive(Serialize)]
struct NotificationFrame<'a> {
    jsonrpc: &'static str,
    #[serde(flatten)]
    body: &'a Notification,
}

impl Notification {
    /// Serialize as an outbound frame (notifications carry no id).
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&NotificationFrame {
            jsonrpc: JSONRPC_VERSION,
            body: self,
        })
    }
}

/// Inbound server frame as seen by the client: either a response to one of
/// our requests or a notification.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Response(RpcResponse),
    Notification(Notification),
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<ServerMessage, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("method").is_some() {
            Ok(ServerMessage::Notification(serde_json::from_value(value)?))
        } else {
            Ok(ServerMessage::Response(serde_json::from_value(value)?))
        }
    }
}

/// Check a command string against the configured allow-list.
///
/// An empty allow-list permits everything. Matching is on the first
/// whitespace-separated word.
pub fn validate_command(command: &str, allowed: &[String]) -> Result<(), String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err("Command cannot be empty".to_string());
    }
    if allowed.is_empty() {
        return Ok(());
    }
    let base = trimmed.split_whitespace().next().unwrap_or_default();
    if allowed.iter().any(|a| a == base) {
        Ok(())
    } else {
        Err(format!("Command '{base}' is not allowed"))
    }
}
