//! MCP server and per-session engine.
//!
//! [`McpServer`] owns the registries and the lifespan. Each call to
//! [`McpServer::serve_session`] runs one session over one transport:
//!
//! 1. **Initialisation**: version negotiation and capability exchange
//! 2. **Operation**: requests are dispatched through a finite table; tool
//!    calls, resource reads and prompt renders run as tasks so the loop keeps
//!    reading frames (a cancellation may arrive while a tool is running)
//! 3. **Draining**: on `shutdown`, end-of-stream, transport failure or a
//!    signal, in-flight tasks get a grace period, then are cancelled; every
//!    subprocess is reaped before `serve` returns
//!
//! Every failure inside a request, including a handler panic, becomes a
//! JSON-RPC error response. Only transport failures end a session early.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use crate::error::McpError;
use crate::lifespan::{Lifespan, LifespanState};
use crate::mcp::context::{CancelSignal, ProgressReporter, RequestContext, SessionId};
use crate::mcp::protocol::{
    parse_message, IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, OutgoingNotification, RequestId, MCP_PROTOCOL_VERSION,
};
use crate::mcp::session::{Method, Session, SessionState};
use crate::mcp::transport::Transport;
use crate::mcp::types::{
    CancelledParams, PromptGetParams, ResourceReadParams, ServerCapabilities, ServerInfo,
    ToolCallParams,
};
use crate::registry::Registries;

/// Default usage hint sent in the `initialize` result.
const INSTRUCTIONS: &str = "Statistical analysis tools backed by R. Pass numeric columns \
inline as `data` or point `file_path` at a CSV file under an allowed directory.";

/// What a finished task reports back to the loop.
type TaskOutput = (RequestId, Result<Value, McpError>);

struct ServerInner {
    registries: Registries,
    lifespan: Lifespan,
    drain_grace: Duration,
    instructions: Option<String>,
}

/// The MCP server.
///
/// Cheap to clone; clones share registries and lifespan. Several sessions
/// may be served concurrently (the HTTP transport does).
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("tools", &self.inner.registries.tools.len())
            .field("resources", &self.inner.registries.resources.len())
            .field("prompts", &self.inner.registries.prompts.len())
            .finish_non_exhaustive()
    }
}

impl McpServer {
    /// Creates a server over the given registries and lifespan.
    #[must_use]
    pub fn new(registries: Registries, lifespan: Lifespan, drain_grace: Duration) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                registries,
                lifespan,
                drain_grace,
                instructions: Some(INSTRUCTIONS.to_string()),
            }),
        }
    }

    /// The registries.
    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.inner.registries
    }

    /// Shared lifespan state.
    #[must_use]
    pub fn lifespan_state(&self) -> Arc<LifespanState> {
        self.inner.lifespan.state()
    }

    /// Everything the server exposes, as printed by `--dump-capabilities`.
    #[must_use]
    pub fn capabilities_dump(&self) -> Value {
        let registries = &self.inner.registries;
        json!({
            "serverInfo": ServerInfo::default(),
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": ServerCapabilities::default(),
            "tools": registries.tools.definitions(),
            "resources": registries.resources.definitions(),
            "prompts": registries.prompts.definitions(),
        })
    }

    /// Serves one session until end-of-stream, `shutdown` or a transport
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the session, if any.
    pub async fn serve<T: Transport>(&self, transport: T) -> io::Result<()> {
        self.serve_session(transport, SessionId::generate(), std::future::pending())
            .await
    }

    /// Serves one session, also stopping when `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the session, if any.
    pub async fn serve_with_shutdown<T, F>(&self, transport: T, shutdown: F) -> io::Result<()>
    where
        T: Transport,
        F: Future<Output = ()> + Send,
    {
        self.serve_session(transport, SessionId::generate(), shutdown)
            .await
    }

    /// Serves one session with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the session, if any.
    pub async fn serve_session<T, F>(
        &self,
        transport: T,
        session_id: SessionId,
        shutdown: F,
    ) -> io::Result<()>
    where
        T: Transport,
        F: Future<Output = ()> + Send,
    {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let engine = SessionEngine {
            server: Arc::clone(&self.inner),
            transport,
            session: Session::new(session_id),
            in_flight: HashMap::new(),
            tasks: JoinSet::new(),
            notify_tx,
            notify_rx,
            transport_broken: false,
        };
        engine.run(shutdown).await
    }

    /// Tears down the lifespan. Runs once; later calls do nothing.
    pub fn shutdown(&self) {
        if let Some(released) = self.inner.lifespan.teardown() {
            tracing::debug!(?released, "Server shut down");
        }
    }
}

/// Whether the loop keeps reading.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Drain,
}

/// One session's read/dispatch loop.
struct SessionEngine<T> {
    server: Arc<ServerInner>,
    transport: T,
    session: Session,
    in_flight: HashMap<RequestId, CancelSignal>,
    tasks: JoinSet<TaskOutput>,
    notify_tx: mpsc::UnboundedSender<OutgoingNotification>,
    notify_rx: mpsc::UnboundedReceiver<OutgoingNotification>,
    transport_broken: bool,
}

impl<T: Transport> SessionEngine<T> {
    async fn run<F>(mut self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tracing::debug!(session = %self.session.id(), "Session started");

        let result = self.read_loop(shutdown).await;
        let reason = match &result {
            Ok(reason) => *reason,
            Err(e) => {
                tracing::warn!(session = %self.session.id(), error = %e, "Transport failed");
                self.transport_broken = true;
                "transport failure"
            }
        };

        self.drain(reason).await;
        result.map(|_| ())
    }

    async fn read_loop<F>(&mut self, shutdown: F) -> io::Result<&'static str>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => return Ok("shutdown signal"),

                // Progress a task sent before finishing goes out before its response.
                Some(notification) = self.notify_rx.recv() => {
                    self.transport.write_notification(&notification).await?;
                }

                Some(joined) = self.tasks.join_next() => self.finish_task(joined).await?,

                frame = self.transport.receive() => {
                    let frame = match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => return Ok("end of stream"),
                        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                            tracing::warn!(
                                session = %self.session.id(),
                                error = %e,
                                "Frame is not UTF-8"
                            );
                            self.transport.write_error(&JsonRpcError::parse_error()).await?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    if self.handle_frame(&frame).await? == Flow::Drain {
                        return Ok("shutdown request");
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &str) -> io::Result<Flow> {
        if frame.trim().is_empty() {
            return Ok(Flow::Continue);
        }

        match parse_message(frame) {
            Ok(IncomingMessage::Request(request)) => self.handle_request(request).await,
            Ok(IncomingMessage::Notification(notification)) => {
                self.handle_notification(&notification);
                Ok(Flow::Continue)
            }
            Ok(IncomingMessage::Response(reply)) => {
                tracing::debug!(id = ?reply.id, "Ignoring response from client");
                Ok(Flow::Continue)
            }
            Err(error) => {
                tracing::warn!(
                    session = %self.session.id(),
                    code = error.error.code,
                    message = %error.error.message,
                    "Malformed frame"
                );
                self.transport.write_error(&error).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_request(&mut self, request: JsonRpcRequest) -> io::Result<Flow> {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        let Some(method) = Method::from_name(&method) else {
            tracing::debug!(method = %method, "Unknown method");
            return self
                .write_error(JsonRpcError::method_not_found(id, &method))
                .await
                .map(|()| Flow::Continue);
        };

        if self.in_flight.contains_key(&id) {
            return self
                .write_error(JsonRpcError::duplicate_id(id))
                .await
                .map(|()| Flow::Continue);
        }

        if let Err(e) = self.session.check(method) {
            tracing::debug!(method = method.name(), state = self.session.state().as_str(), "Rejected");
            return self
                .write_error(e.into_response(id))
                .await
                .map(|()| Flow::Continue);
        }

        if method.is_task() {
            self.spawn_task(method, id, params);
            return Ok(Flow::Continue);
        }

        let registries = &self.server.registries;
        let result = match method {
            Method::Initialize => self
                .session
                .initialize(
                    params.as_ref(),
                    ServerCapabilities::default(),
                    self.server.instructions.clone(),
                )
                .and_then(|r| to_value(&r)),
            Method::Ping | Method::Shutdown => Ok(json!({})),
            Method::ToolsList => Ok(json!({ "tools": registries.tools.definitions() })),
            Method::ResourcesList => {
                Ok(json!({ "resources": registries.resources.definitions() }))
            }
            Method::PromptsList => Ok(json!({ "prompts": registries.prompts.definitions() })),
            Method::ToolsCall | Method::ResourcesRead | Method::PromptsGet => Err(
                McpError::Internal(format!("{} must run as a task", method.name())),
            ),
        };

        self.respond(id, result).await?;

        if method == Method::Shutdown {
            return Ok(Flow::Drain);
        }
        Ok(Flow::Continue)
    }

    fn handle_notification(&mut self, notification: &JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                tracing::debug!(session = %self.session.id(), "Client initialised");
            }
            "notifications/cancelled" => {
                let params = notification
                    .params
                    .clone()
                    .map(serde_json::from_value::<CancelledParams>);
                match params {
                    Some(Ok(params)) => match self.in_flight.get(&params.request_id) {
                        Some(cancel) => {
                            tracing::info!(
                                id = %params.request_id,
                                reason = params.reason.as_deref().unwrap_or("none"),
                                "Cancelling request"
                            );
                            cancel.cancel();
                        }
                        None => {
                            tracing::debug!(id = %params.request_id, "Cancel for unknown or finished request");
                        }
                    },
                    _ => tracing::warn!("Ignoring malformed cancellation"),
                }
            }
            other => tracing::debug!(method = other, "Ignoring notification"),
        }
    }

    fn spawn_task(&mut self, method: Method, id: RequestId, params: Option<Value>) {
        let cancel = CancelSignal::new();

        let progress = params
            .as_ref()
            .and_then(|p| p.get("_meta"))
            .and_then(|meta| meta.get("progressToken"))
            .filter(|token| !token.is_null())
            .map(|token| ProgressReporter::new(token.clone(), self.notify_tx.clone()));

        let ctx = RequestContext::new(
            self.session.id().clone(),
            id.clone(),
            self.server.lifespan.state(),
            cancel.clone(),
        )
        .with_progress(progress);

        let server = Arc::clone(&self.server);
        let task_id = id.clone();
        self.tasks.spawn(async move {
            let work = AssertUnwindSafe(run_task(&server, method, &ctx, params));
            let result = match work.catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(method = method.name(), id = %task_id, panic = %message, "Handler panicked");
                    Err(McpError::Internal(format!("handler panicked: {message}")))
                }
            };
            (task_id, result)
        });

        tracing::debug!(method = method.name(), id = %id, in_flight = self.tasks.len(), "Task started");
        self.in_flight.insert(id, cancel);
    }

    async fn finish_task(&mut self, joined: Result<TaskOutput, JoinError>) -> io::Result<()> {
        let (id, result) = match joined {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "Task failed outside the panic guard");
                return Ok(());
            }
        };

        let cancelled = self
            .in_flight
            .remove(&id)
            .is_some_and(|cancel| cancel.is_cancelled());
        if cancelled || matches!(result, Err(McpError::Cancelled)) {
            tracing::debug!(id = %id, "Request cancelled; no response sent");
            return Ok(());
        }

        self.respond(id, result).await
    }

    async fn respond(&mut self, id: RequestId, result: Result<Value, McpError>) -> io::Result<()> {
        match result {
            Ok(value) => {
                if self.transport_broken {
                    return Ok(());
                }
                self.transport
                    .write_response(&JsonRpcResponse::success(id, value))
                    .await
            }
            Err(e) => {
                tracing::debug!(id = %id, kind = e.kind(), error = %e, "Request failed");
                self.write_error(e.into_response(id)).await
            }
        }
    }

    async fn write_error(&mut self, error: JsonRpcError) -> io::Result<()> {
        if self.transport_broken {
            return Ok(());
        }
        self.transport.write_error(&error).await
    }

    async fn drain(&mut self, reason: &'static str) {
        self.session.begin_drain();
        tracing::info!(
            session = %self.session.id(),
            reason,
            in_flight = self.tasks.len(),
            "Session draining"
        );

        if !self.tasks.is_empty() {
            let grace = tokio::time::sleep(self.server.drain_grace);
            tokio::pin!(grace);

            loop {
                tokio::select! {
                    biased;
                    joined = self.tasks.join_next() => match joined {
                        Some(joined) => self.finish_during_drain(joined).await,
                        None => break,
                    },
                    () = &mut grace => {
                        tracing::info!(remaining = self.tasks.len(), "Drain grace period expired; cancelling");
                        break;
                    }
                }
            }

            for cancel in self.in_flight.values() {
                cancel.cancel();
            }
            while let Some(joined) = self.tasks.join_next().await {
                self.finish_during_drain(joined).await;
            }
        }

        while let Ok(notification) = self.notify_rx.try_recv() {
            if self.transport_broken {
                break;
            }
            if self.transport.write_notification(&notification).await.is_err() {
                self.transport_broken = true;
            }
        }

        self.session.close();
        debug_assert_eq!(self.session.state(), SessionState::Closed);
        tracing::debug!(session = %self.session.id(), "Session closed");
    }

    async fn finish_during_drain(&mut self, joined: Result<TaskOutput, JoinError>) {
        if let Err(e) = self.finish_task(joined).await {
            tracing::warn!(error = %e, "Dropping responses: transport failed while draining");
            self.transport_broken = true;
        }
    }
}

async fn run_task(
    server: &ServerInner,
    method: Method,
    ctx: &RequestContext,
    params: Option<Value>,
) -> Result<Value, McpError> {
    let registries = &server.registries;
    match method {
        Method::ToolsCall => {
            let params: ToolCallParams = parse_params(params)?;
            let result = registries
                .tools
                .invoke(&params.name, ctx, params.arguments)
                .await?;
            to_value(&result)
        }
        Method::ResourcesRead => {
            let params: ResourceReadParams = parse_params(params)?;
            to_value(&registries.resources.invoke(&params.uri, ctx).await?)
        }
        Method::PromptsGet => {
            let params: PromptGetParams = parse_params(params)?;
            to_value(
                &registries
                    .prompts
                    .invoke(&params.name, ctx, params.arguments)
                    .await?,
            )
        }
        other => Err(McpError::Internal(format!(
            "{} is not a task method",
            other.name()
        ))),
    }
}

fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, McpError> {
    let params = params.ok_or_else(|| McpError::invalid_params("missing params"))?;
    serde_json::from_value(params).map_err(|e| McpError::invalid_params(e.to_string()))
}

fn to_value<S: Serialize>(value: &S) -> Result<Value, McpError> {
    serde_json::to_value(value)
        .map_err(|e| McpError::Internal(format!("failed to serialise result: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mcp::transport::StdioTransport;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn server() -> McpServer {
        let lifespan = Lifespan::create(&Config::default(), &[]).unwrap();
        McpServer::new(Registries::new(), lifespan, Duration::from_millis(100))
    }

    async fn exchange(server: &McpServer, input: &str) -> Vec<Value> {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let transport = StdioTransport::with_streams(server_read, server_write);

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        server.serve(transport).await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn request_before_initialize_is_rejected() {
        let server = server();
        let out = exchange(&server, "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n").await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["error"]["code"], -32000);
        assert_eq!(out[0]["error"]["data"]["kind"], "session_state_error");
    }

    #[tokio::test]
    async fn malformed_frame_gets_parse_error_with_null_id() {
        let server = server();
        let out = exchange(&server, "{not json\n").await;
        assert_eq!(out[0]["error"]["code"], -32700);
        assert!(out[0]["id"].is_null());
    }

    #[tokio::test]
    async fn unknown_method_and_ping() {
        let server = server();
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{\"protocolVersion\":\"2025-06-18\",\"capabilities\":{}}}\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/delete\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"ping\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"shutdown\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"ping\"}\n",
        );
        let out = exchange(&server, input).await;
        assert_eq!(out.len(), 4);
        assert_eq!(out[0]["result"]["protocolVersion"], "2025-06-18");
        assert_eq!(out[1]["error"]["code"], -32601);
        assert_eq!(out[2]["result"], json!({}));
        assert_eq!(out[3]["id"], 4);
    }

    #[test]
    fn capabilities_dump_lists_every_registry() {
        let dump = server().capabilities_dump();
        assert!(dump["tools"].is_array());
        assert!(dump["resources"].is_array());
        assert!(dump["prompts"].is_array());
        assert_eq!(dump["serverInfo"]["name"], "rstats-mcp");
    }
}
