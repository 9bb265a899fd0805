//! Session lifecycle and the method dispatch table.
//!
//! ```text
//! Uninitialized ──initialize──▶ Initializing ──ok──▶ Ready ──▶ Draining ──▶ Closed
//!       ▲                            │
//!       └────────bad params──────────┘
//! ```
//!
//! Only `initialize` is accepted while `Uninitialized`, and it is rejected
//! once the session is `Ready`: a client that wants a fresh handshake opens a
//! new session.

use serde_json::Value;

use crate::error::McpError;
use crate::mcp::context::SessionId;
use crate::mcp::protocol::negotiate_version;
use crate::mcp::types::{
    ClientInfo, InitializeParams, InitializeResult, ServerCapabilities, ServerInfo,
};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `initialize`.
    Uninitialized,
    /// Handling `initialize`.
    Initializing,
    /// Serving requests.
    Ready,
    /// Letting in-flight requests finish.
    Draining,
    /// Done.
    Closed,
}

impl SessionState {
    /// Name used in `SessionStateError` messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

/// Every request method the server implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `initialize`
    Initialize,
    /// `ping`
    Ping,
    /// `shutdown`
    Shutdown,
    /// `tools/list`
    ToolsList,
    /// `tools/call`
    ToolsCall,
    /// `resources/list`
    ResourcesList,
    /// `resources/read`
    ResourcesRead,
    /// `prompts/list`
    PromptsList,
    /// `prompts/get`
    PromptsGet,
}

impl Method {
    /// The whole dispatch table.
    pub const ALL: [Self; 9] = [
        Self::Initialize,
        Self::Ping,
        Self::Shutdown,
        Self::ToolsList,
        Self::ToolsCall,
        Self::ResourcesList,
        Self::ResourcesRead,
        Self::PromptsList,
        Self::PromptsGet,
    ];

    /// Looks up a method by its wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// The wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Ping => "ping",
            Self::Shutdown => "shutdown",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::ResourcesList => "resources/list",
            Self::ResourcesRead => "resources/read",
            Self::PromptsList => "prompts/list",
            Self::PromptsGet => "prompts/get",
        }
    }

    /// Whether the method runs as a tracked, cancellable task.
    #[must_use]
    pub const fn is_task(self) -> bool {
        matches!(self, Self::ToolsCall | Self::ResourcesRead | Self::PromptsGet)
    }
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    protocol_version: Option<&'static str>,
    client_info: Option<ClientInfo>,
    client_capabilities: Value,
}

impl Session {
    /// Creates an uninitialised session.
    #[must_use]
    pub const fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Uninitialized,
            protocol_version: None,
            client_info: None,
            client_capabilities: Value::Null,
        }
    }

    /// The session id.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// The negotiated protocol version, once initialised.
    #[must_use]
    pub const fn protocol_version(&self) -> Option<&'static str> {
        self.protocol_version
    }

    /// The client's self-description, if it sent one.
    #[must_use]
    pub const fn client_info(&self) -> Option<&ClientInfo> {
        self.client_info.as_ref()
    }

    /// Capabilities the client declared.
    #[must_use]
    pub const fn client_capabilities(&self) -> &Value {
        &self.client_capabilities
    }

    /// Checks that `method` may run in the current state.
    ///
    /// # Errors
    ///
    /// Returns `SessionState` if it may not.
    pub fn check(&self, method: Method) -> Result<(), McpError> {
        let allowed = match self.state {
            SessionState::Uninitialized => method == Method::Initialize,
            SessionState::Ready => method != Method::Initialize,
            SessionState::Initializing | SessionState::Draining | SessionState::Closed => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(McpError::SessionState {
                method: method.name().to_string(),
                state: self.state.as_str(),
            })
        }
    }

    /// Runs the `initialize` handshake.
    ///
    /// # Errors
    ///
    /// Returns `SessionState` outside `Uninitialized`, or `InvalidParams` if
    /// the params do not parse, in which case the session stays
    /// uninitialised.
    pub fn initialize(
        &mut self,
        params: Option<&Value>,
        capabilities: ServerCapabilities,
        instructions: Option<String>,
    ) -> Result<InitializeResult, McpError> {
        self.check(Method::Initialize)?;
        self.state = SessionState::Initializing;

        let params: InitializeParams = match params.map(|p| serde_json::from_value(p.clone())) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                self.state = SessionState::Uninitialized;
                return Err(McpError::invalid_params(format!(
                    "invalid initialize params: {e}"
                )));
            }
            None => {
                self.state = SessionState::Uninitialized;
                return Err(McpError::invalid_params("missing initialize params"));
            }
        };

        let version = negotiate_version(&params.protocol_version);
        if version != params.protocol_version {
            tracing::info!(
                requested = %params.protocol_version,
                offered = version,
                "Client requested unsupported protocol version"
            );
        }

        tracing::info!(
            session = %self.id,
            client = params.client_info.as_ref().map_or("unknown", |c| c.name.as_str()),
            protocol_version = version,
            "Session initialised"
        );

        self.protocol_version = Some(version);
        self.client_info = params.client_info;
        self.client_capabilities = params.capabilities;
        self.state = SessionState::Ready;

        Ok(InitializeResult {
            protocol_version: version.to_string(),
            capabilities,
            server_info: ServerInfo::default(),
            instructions,
        })
    }

    /// Moves to `Draining`. Returns `false` if already draining or closed.
    pub fn begin_drain(&mut self) -> bool {
        match self.state {
            SessionState::Draining | SessionState::Closed => false,
            _ => {
                self.state = SessionState::Draining;
                true
            }
        }
    }

    /// Moves to `Closed`.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
