//! Model Context Protocol (MCP) server implementation.
//!
//! The server speaks JSON-RPC 2.0 over one of two transports: newline
//! delimited stdio (one session per process) or streamable HTTP (one session
//! per `mcp-session-id`). Both feed the same session engine.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           MCP Server                           │
//! │                                                                │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐     │
//! │  │  Transport  │──▶│   Session    │──▶│    Registries    │     │
//! │  │ stdio/HTTP  │   │ (lifecycle,  │   │ tools, resources │     │
//! │  └─────────────┘   │  dispatch)   │   │ prompts          │     │
//! │         ▲          └──────────────┘   └────────┬─────────┘     │
//! │         │                 │                    ▼               │
//! │         │                 │           ┌──────────────────┐     │
//! │         └── responses ────┘           │ Execution bridge │──▶ R│
//! │             progress                  └──────────────────┘     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! Negotiates 2025-06-18, 2025-03-26 or 2024-11-05.

pub mod context;
pub mod http;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

pub use context::{CancelSignal, RequestContext, SessionId};
pub use http::serve_http;
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
pub use server::McpServer;
pub use transport::{StdioTransport, Transport};
