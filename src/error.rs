//! Error types for rstats-mcp.
//!
//! # Taxonomy
//!
//! [`McpError`] is the single error type flowing out of registries, handlers
//! and the execution bridge. Every variant maps onto a JSON-RPC error code so
//! the dispatch boundary can convert it into an error response instead of
//! tearing down the session. Only transport failures (plain `io::Error`) are
//! fatal to a session.
//!
//! Protocol errors (unparseable frames, invalid requests, unknown methods) are
//! raised before any handler runs and go out directly as a
//! [`JsonRpcError`](crate::mcp::protocol::JsonRpcError) with
//! `data.kind = "protocol_error"`.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp::protocol::{ErrorCode, JsonRpcError, JsonRpcErrorData, RequestId};

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Errors raised while registering descriptors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A schema uses `oneOf`, `anyOf` or `allOf`.
    #[error("{kind} '{name}' uses disallowed schema composition '{keyword}' at {path}")]
    DisallowedComposition {
        /// Registry kind ("tool", "resource", "prompt").
        kind: &'static str,
        /// Descriptor key.
        name: String,
        /// The offending keyword.
        keyword: String,
        /// JSON pointer to the keyword.
        path: String,
    },

    /// A descriptor with the same key is already registered.
    #[error("{kind} '{name}' is already registered")]
    Duplicate {
        /// Registry kind.
        kind: &'static str,
        /// Descriptor key.
        name: String,
    },

    /// The descriptor itself is malformed.
    #[error("invalid {kind} descriptor '{name}': {message}")]
    InvalidDescriptor {
        /// Registry kind.
        kind: &'static str,
        /// Descriptor key.
        name: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Errors raised while acquiring process-wide resources.
#[derive(Error, Debug)]
pub enum LifespanError {
    /// The cache root could not be created.
    #[error("failed to create cache root: {path}")]
    CacheRoot {
        /// The cache root.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The script library could not be written.
    #[error("failed to materialise script library: {message}")]
    ScriptLibrary {
        /// What failed.
        message: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Why a tool execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// The script reported an error.
    Script,
    /// The process crashed, was killed, or exited without a diagnostic.
    Process,
    /// The process succeeded but its output could not be parsed.
    MalformedOutput,
}

impl ExecutionFailure {
    /// Returns the `data.failure` value reported to clients.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script_error",
            Self::Process => "process_failure",
            Self::MalformedOutput => "malformed_output",
        }
    }
}

/// Errors surfaced to clients as JSON-RPC error responses.
#[derive(Error, Debug, Clone)]
pub enum McpError {
    /// Method called in a session state that does not allow it.
    #[error("method '{method}' is not allowed while the session is {state}")]
    SessionState {
        /// The method that was called.
        method: String,
        /// The session state at the time of the call.
        state: &'static str,
    },

    /// Arguments failed validation.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// Summary of the failure.
        message: String,
        /// Individual validation failures.
        details: Vec<String>,
    },

    /// Unknown tool.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Unknown resource.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Unknown prompt.
    #[error("prompt not found: {0}")]
    PromptNotFound(String),

    /// The external runtime failed.
    #[error("tool execution failed: {message}")]
    ToolExecution {
        /// Which kind of failure.
        kind: ExecutionFailure,
        /// Short description.
        message: String,
        /// Diagnostic text from the runtime, if any.
        diagnostic: Option<String>,
    },

    /// The external runtime exceeded its time budget.
    #[error("tool '{tool}' timed out after {}s", .after.as_secs_f64())]
    ToolTimeout {
        /// The tool name.
        tool: String,
        /// The configured timeout.
        after: Duration,
    },

    /// The request was cancelled by the client or by shutdown.
    #[error("request cancelled")]
    Cancelled,

    /// Unexpected defect.
    #[error("internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// Creates an invalid params error with a single message.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Returns the JSON-RPC error code for this error.
    #[must_use]
    pub const fn code(&self) -> i32 {
        let code = match self {
            Self::SessionState { .. } => ErrorCode::SessionState,
            Self::InvalidParams { .. } => ErrorCode::InvalidParams,
            Self::ToolNotFound(_) | Self::ResourceNotFound(_) | Self::PromptNotFound(_) => {
                ErrorCode::NotFound
            }
            Self::ToolExecution { .. } => ErrorCode::ToolExecution,
            Self::ToolTimeout { .. } => ErrorCode::ToolTimeout,
            Self::Cancelled | Self::Internal(_) => ErrorCode::InternalError,
        };
        code.code()
    }

    /// Returns the taxonomy name reported in `data.kind`.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionState { .. } => "session_state_error",
            Self::InvalidParams { .. } => "invalid_params",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::ResourceNotFound(_) => "resource_not_found",
            Self::PromptNotFound(_) => "prompt_not_found",
            Self::ToolExecution { .. } => "tool_execution_error",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns the structured `data` member of the error object.
    #[must_use]
    pub fn data(&self) -> Value {
        match self {
            Self::InvalidParams { details, .. } if !details.is_empty() => {
                json!({ "kind": self.kind(), "details": details })
            }
            Self::ToolExecution {
                kind, diagnostic, ..
            } => {
                let mut data = json!({ "kind": self.kind(), "failure": kind.as_str() });
                if let Some(diagnostic) = diagnostic {
                    data["diagnostic"] = json!(diagnostic);
                }
                data
            }
            Self::ToolTimeout { after, .. } => {
                json!({ "kind": self.kind(), "timeoutSecs": after.as_secs_f64() })
            }
            Self::SessionState { state, .. } => json!({ "kind": self.kind(), "state": state }),
            _ => json!({ "kind": self.kind() }),
        }
    }

    /// Converts this error into a JSON-RPC error response for `id`.
    #[must_use]
    pub fn into_response(self, id: RequestId) -> JsonRpcError {
        let data = self.data();
        JsonRpcError::new(
            Some(id),
            JsonRpcErrorData {
                code: self.code(),
                message: self.to_string(),
                data: Some(data),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/path/to/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn validation_error_display() {
        let error = ConfigError::ValidationError {
            message: "invalid setting".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("invalid setting"));
    }

    #[test]
    fn error_codes_follow_taxonomy() {
        assert_eq!(McpError::invalid_params("x").code(), -32602);
        assert_eq!(McpError::ToolNotFound("t".into()).code(), ErrorCode::NotFound.code());
        assert_eq!(
            McpError::SessionState {
                method: "tools/list".into(),
                state: "uninitialized",
            }
            .code(),
            ErrorCode::SessionState.code()
        );
        assert_eq!(
            McpError::ToolTimeout {
                tool: "t".into(),
                after: Duration::from_secs(1),
            }
            .code(),
            ErrorCode::ToolTimeout.code()
        );
    }

    #[test]
    fn execution_error_carries_diagnostic() {
        let error = McpError::ToolExecution {
            kind: ExecutionFailure::Script,
            message: "incompatible dimensions".into(),
            diagnostic: Some("Error in cor(x, y) : incompatible dimensions".into()),
        };
        let response = error.into_response(RequestId::Number(3));
        assert_eq!(response.error.code, ErrorCode::ToolExecution.code());
        let data = response.error.data.unwrap();
        assert_eq!(data["kind"], "tool_execution_error");
        assert_eq!(data["failure"], "script_error");
        assert!(data["diagnostic"]
            .as_str()
            .unwrap()
            .contains("incompatible dimensions"));
    }

    #[test]
    fn invalid_params_lists_details() {
        let error = McpError::InvalidParams {
            message: "arguments do not match the input schema".into(),
            details: vec!["root.data: expected type object, got string".into()],
        };
        let data = error.data();
        assert_eq!(data["details"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn registry_error_display() {
        let error = RegistryError::DisallowedComposition {
            kind: "tool",
            name: "broken".into(),
            keyword: "anyOf".into(),
            path: "/properties/a/anyOf".into(),
        };
        let msg = error.to_string();
        assert!(msg.contains("anyOf"));
        assert!(msg.contains("broken"));
    }
}
