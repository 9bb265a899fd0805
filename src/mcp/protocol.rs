//! JSON-RPC 2.0 framing for MCP.
//!
//! Inbound frames decode into an [`IncomingMessage`]; the server writes
//! [`JsonRpcResponse`], [`JsonRpcError`] and [`OutgoingNotification`] frames.
//! MCP narrows JSON-RPC in two ways that [`parse_message`] enforces: request
//! ids are strings or integers (never `null`), and batches are refused.
//!
//! Error codes below -32000 are the standard JSON-RPC ones; -32000 to -32003
//! are this server's own (see [`ErrorCode`]).

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// The value of every `jsonrpc` member.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version offered when the client asks for one we do not know.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions accepted in `initialize`, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

/// Name reported in `serverInfo`.
pub const SERVER_NAME: &str = "rstats-mcp";

/// `data.kind` of errors raised while decoding a frame.
const PROTOCOL_ERROR_KIND: &str = "protocol_error";

/// Echoes `requested` if supported, otherwise offers the newest version.
#[must_use]
pub fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .into_iter()
        .find(|v| *v == requested)
        .unwrap_or(MCP_PROTOCOL_VERSION)
}

/// A request id: a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// Error codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The frame is not JSON.
    ParseError,
    /// The frame is JSON but not a valid message.
    InvalidRequest,
    /// No such method.
    MethodNotFound,
    /// Params or tool arguments were rejected.
    InvalidParams,
    /// A defect in the server.
    InternalError,
    /// The method is not allowed in the current session state.
    SessionState,
    /// The external runtime failed.
    ToolExecution,
    /// Unknown tool, resource or prompt.
    NotFound,
    /// The external runtime ran out of time.
    ToolTimeout,
    /// Any other code, as received from a peer.
    Other(i32),
}

impl ErrorCode {
    /// The numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::SessionState => -32000,
            Self::ToolExecution => -32001,
            Self::NotFound => -32002,
            Self::ToolTimeout => -32003,
            Self::Other(code) => code,
        }
    }

    /// Maps a numeric code back to its variant.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::SessionState,
            -32001 => Self::ToolExecution,
            -32002 => Self::NotFound,
            -32003 => Self::ToolTimeout,
            other => Self::Other(other),
        }
    }

    const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::SessionState => "Session state error",
            Self::ToolExecution => "Tool execution failed",
            Self::NotFound => "Not found",
            Self::ToolTimeout => "Tool timed out",
            Self::Other(_) => "Server error",
        }
    }
}

/// A request from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    /// Always "2.0" once parsed.
    pub jsonrpc: String,
    /// The id the response must echo.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method params.
    #[serde(default)]
    pub params: Option<Value>,
}

/// A notification from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcNotification {
    /// Always "2.0" once parsed.
    pub jsonrpc: String,
    /// Notification name.
    pub method: String,
    /// Notification params.
    #[serde(default)]
    pub params: Option<Value>,
}

/// A response from the client.
///
/// The server sends no requests, so replies are only logged.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcReply {
    /// The id being answered; `None` for an error about an unreadable request.
    pub id: Option<RequestId>,
    /// The `result` member, or the `error` member.
    pub outcome: Result<Value, JsonRpcErrorData>,
}

/// One decoded inbound frame.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Needs a response.
    Request(JsonRpcRequest),
    /// Needs no response.
    Notification(JsonRpcNotification),
    /// Answers a request.
    Response(JsonRpcReply),
}

impl IncomingMessage {
    /// The request id, if the frame has one.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(request) => Some(&request.id),
            Self::Notification(_) => None,
            Self::Response(reply) => reply.id.as_ref(),
        }
    }
}

/// A success response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    /// Always "2.0".
    pub jsonrpc: &'static str,
    /// The request's id.
    pub id: RequestId,
    /// The method's result.
    pub result: Value,
}

impl JsonRpcResponse {
    /// Wraps `result` as the answer to `id`.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Value is not const-compatible
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
        }
    }
}

/// The `error` member of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    /// Numeric code.
    pub code: i32,
    /// One-line description.
    pub message: String,
    /// Structured detail; carries `kind` for errors this server raises.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// An error with a custom message and no data.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Attaches `data`.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The code as an [`ErrorCode`].
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }

    fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::with_message(code, message).with_data(json!({ "kind": PROTOCOL_ERROR_KIND }))
    }
}

/// An error response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    /// Always "2.0".
    pub jsonrpc: &'static str,
    /// The request's id, serialised as `null` when it could not be read.
    pub id: Option<RequestId>,
    /// The error.
    pub error: JsonRpcErrorData,
}

impl JsonRpcError {
    /// Wraps `error` as the answer to `id`.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // JsonRpcErrorData contains String
    pub fn new(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            error,
        }
    }

    /// The frame is not JSON.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(
            None,
            JsonRpcErrorData::protocol(
                ErrorCode::ParseError,
                ErrorCode::ParseError.default_message(),
            ),
        )
    }

    /// The frame is not a valid message.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>, reason: &str) -> Self {
        Self::new(
            id,
            JsonRpcErrorData::protocol(
                ErrorCode::InvalidRequest,
                format!("{}: {reason}", ErrorCode::InvalidRequest.default_message()),
            ),
        )
    }

    /// No method named `method`.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::protocol(
                ErrorCode::MethodNotFound,
                format!("{}: {method}", ErrorCode::MethodNotFound.default_message()),
            ),
        )
    }

    /// The id is already used by a request that has not been answered.
    #[must_use]
    pub fn duplicate_id(id: RequestId) -> Self {
        Self::invalid_request(Some(id), "a request with this id is already in flight")
    }
}

/// A notification from the server.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingNotification {
    /// Always "2.0".
    pub jsonrpc: &'static str,
    /// Notification name.
    pub method: String,
    /// Notification params.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutgoingNotification {
    /// `notifications/progress` for `token`. `total` and `message` are
    /// omitted when absent.
    #[must_use]
    pub fn progress(token: &Value, progress: f64, total: Option<f64>, message: Option<&str>) -> Self {
        let mut params = Map::new();
        params.insert("progressToken".to_string(), token.clone());
        params.insert("progress".to_string(), json!(progress));
        if let Some(total) = total {
            params.insert("total".to_string(), json!(total));
        }
        if let Some(message) = message {
            params.insert("message".to_string(), json!(message));
        }
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: "notifications/progress".to_string(),
            params: Some(Value::Object(params)),
        }
    }
}

/// Decodes one frame.
///
/// A frame with `method` is a request when it also has `id`, otherwise a
/// notification. A frame without `method` is a response and must carry
/// exactly one of `result` and `error`.
///
/// # Errors
///
/// Returns the error response to send back: `ParseError` when the frame is
/// not a JSON object, `InvalidRequest` for batches and malformed messages.
pub fn parse_message(frame: &str) -> Result<IncomingMessage, JsonRpcError> {
    let value: Value = serde_json::from_str(frame).map_err(|_| JsonRpcError::parse_error())?;

    let object = match &value {
        Value::Object(object) => object,
        Value::Array(_) => return Err(JsonRpcError::invalid_request(None, "batches are not supported")),
        _ => return Err(JsonRpcError::invalid_request(None, "expected a JSON object")),
    };

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(JsonRpcError::invalid_request(
            readable_id(object),
            "jsonrpc must be \"2.0\"",
        ));
    }

    match (object.contains_key("method"), object.contains_key("id")) {
        (true, true) => {
            let id = readable_id(object);
            let request: JsonRpcRequest = serde_json::from_value(value)
                .map_err(|_| JsonRpcError::invalid_request(id, "malformed request"))?;
            if request.method.is_empty() {
                return Err(JsonRpcError::invalid_request(Some(request.id), "empty method"));
            }
            Ok(IncomingMessage::Request(request))
        }
        (true, false) => serde_json::from_value(value)
            .map(IncomingMessage::Notification)
            .map_err(|_| JsonRpcError::invalid_request(None, "malformed notification")),
        (false, _) => parse_reply(object).map(IncomingMessage::Response),
    }
}

fn readable_id(object: &Map<String, Value>) -> Option<RequestId> {
    object
        .get("id")
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

fn parse_reply(object: &Map<String, Value>) -> Result<JsonRpcReply, JsonRpcError> {
    let id = match object.get("id") {
        None | Some(Value::Null) => None,
        Some(_) => Some(
            readable_id(object)
                .ok_or_else(|| JsonRpcError::invalid_request(None, "id must be a string or integer"))?,
        ),
    };

    let outcome = match (object.get("result"), object.get("error")) {
        (Some(result), None) => Ok(result.clone()),
        (None, Some(error)) => Err(serde_json::from_value(error.clone())
            .map_err(|_| JsonRpcError::invalid_request(id.clone(), "malformed error object"))?),
        _ => {
            return Err(JsonRpcError::invalid_request(
                id,
                "a response needs exactly one of result and error",
            ))
        }
    };

    Ok(JsonRpcReply { id, outcome })
}
