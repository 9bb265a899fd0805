//! Streamable HTTP transport.
//!
//! One endpoint, one JSON-RPC object per `POST` body:
//!
//! - `initialize` without an `mcp-session-id` header starts a session and the
//!   response carries the new id in that header
//! - every other message needs the header: 400 when it is missing, 404 when
//!   the session is unknown
//! - notifications and client responses are answered with 202
//! - `DELETE` ends a session
//! - `GET` is 405: there is no server-sent event stream, so server
//!   notifications (progress) are not delivered over HTTP
//!
//! Each session runs the ordinary session engine over an [`HttpTransport`],
//! which turns posted bodies into frames and routes response frames back to
//! the waiting `POST` by request id.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;

use crate::mcp::context::{CancelSignal, SessionId};
use crate::mcp::protocol::{parse_message, IncomingMessage, JsonRpcError, RequestId};
use crate::mcp::server::McpServer;
use crate::mcp::transport::Transport;
use crate::mcp::types::CancelledParams;

/// Header carrying the session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Frames buffered per session before `POST` handlers wait.
const INBOUND_CAPACITY: usize = 64;

/// Requests waiting for their response frame, keyed by request id.
type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<String>>>>;

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<String>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The session engine's side of an HTTP session.
pub struct HttpTransport {
    inbound: mpsc::Receiver<String>,
    pending: Pending,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn receive(&mut self) -> io::Result<Option<String>> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, frame: &str) -> io::Result<()> {
        let id = serde_json::from_str::<Value>(frame)
            .ok()
            .and_then(|value| value.get("id").cloned())
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok());

        let Some(id) = id else {
            tracing::debug!("Dropping frame without a request id");
            return Ok(());
        };

        match lock_pending(&self.pending).remove(&id) {
            Some(waiter) => {
                if waiter.send(frame.to_string()).is_err() {
                    tracing::debug!(id = %id, "HTTP client went away before the response");
                }
            }
            None => tracing::debug!(id = %id, "No HTTP request waiting for response"),
        }
        Ok(())
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        // Waiting POST handlers see a closed channel instead of hanging.
        lock_pending(&self.pending).clear();
    }
}

/// The HTTP side of a session.
struct HttpSession {
    inbound: mpsc::Sender<String>,
    pending: Pending,
    close: CancelSignal,
}

#[derive(Clone)]
struct HttpState {
    server: McpServer,
    sessions: Arc<tokio::sync::Mutex<HashMap<String, Arc<HttpSession>>>>,
    tasks: Arc<tokio::sync::Mutex<JoinSet<()>>>,
    stop: CancelSignal,
}

impl HttpState {
    fn new(server: McpServer) -> Self {
        Self {
            server,
            sessions: Arc::default(),
            tasks: Arc::new(tokio::sync::Mutex::new(JoinSet::new())),
            stop: CancelSignal::new(),
        }
    }

    async fn open_session(&self) -> (String, Arc<HttpSession>) {
        let session_id = SessionId::generate();
        let key = session_id.to_string();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let pending = Pending::default();
        let session = Arc::new(HttpSession {
            inbound: inbound_tx,
            pending: Arc::clone(&pending),
            close: CancelSignal::new(),
        });

        let transport = HttpTransport {
            inbound: inbound_rx,
            pending,
        };
        let close = session.close.clone();
        let stop = self.stop.clone();
        let shutdown = async move {
            tokio::select! {
                () = close.cancelled() => {}
                () = stop.cancelled() => {}
            }
        };

        let server = self.server.clone();
        let sessions = Arc::clone(&self.sessions);
        let task_key = key.clone();
        let mut tasks = self.tasks.lock().await;
        // Reap sessions that have ended since the last open.
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                tracing::error!(error = %e, "HTTP session task failed");
            }
        }
        tasks.spawn(async move {
            if let Err(e) = server.serve_session(transport, session_id, shutdown).await {
                tracing::warn!(session = %task_key, error = %e, "HTTP session ended with error");
            }
            sessions.lock().await.remove(&task_key);
        });
        drop(tasks);

        self.sessions
            .lock()
            .await
            .insert(key.clone(), Arc::clone(&session));
        tracing::info!(session = %key, "HTTP session opened");
        (key, session)
    }

    async fn session(&self, key: &str) -> Option<Arc<HttpSession>> {
        self.sessions.lock().await.get(key).cloned()
    }

    async fn remove_session(&self, key: &str) -> Option<Arc<HttpSession>> {
        let session = self.sessions.lock().await.remove(key);
        if let Some(session) = &session {
            session.close.cancel();
        }
        session
    }
}

/// Serves MCP over HTTP on `bind` until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve_http<F>(server: McpServer, bind: SocketAddr, path: &str, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind).await?;
    serve_http_on(server, listener, path, shutdown).await
}

/// Serves MCP over HTTP on an already bound listener.
///
/// All sessions are drained before this returns.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_http_on<F>(
    server: McpServer,
    listener: TcpListener,
    path: &str,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = HttpState::new(server);

    let app = Router::new()
        .route(path, post(http_post).delete(http_delete).get(http_get))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    tracing::info!(addr = %listener.local_addr()?, path, "Serving MCP over HTTP");

    let stop = state.stop.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Stopping HTTP transport");
            stop.cancel();
        })
        .await?;

    state.stop.cancel();
    let mut tasks = state.tasks.lock().await;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "HTTP session task failed");
        }
    }
    Ok(())
}

async fn http_get() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, "server-sent events are not supported")
}

async fn http_delete(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let Some(key) = header_str(&headers, SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };
    match state.remove_session(key).await {
        Some(_) => {
            tracing::info!(session = %key, "HTTP session closed by client");
            StatusCode::ACCEPTED.into_response()
        }
        None => (StatusCode::NOT_FOUND, "unknown mcp-session-id").into_response(),
    }
}

async fn http_post(State(state): State<HttpState>, headers: HeaderMap, body: String) -> Response {
    let message = match parse_message(&body) {
        Ok(message) => message,
        Err(error) => {
            tracing::warn!(message = %error.error.message, "Malformed HTTP frame");
            return jsonrpc_response(&error, None);
        }
    };

    let opens_session = matches!(&message, IncomingMessage::Request(r) if r.method == "initialize")
        && header_str(&headers, SESSION_HEADER).is_none();

    if opens_session {
        let (key, session) = state.open_session().await;
        let id = message.id().cloned();
        let response = forward(&session, body, id).await;
        if !response.is_success() {
            state.remove_session(&key).await;
            return response.into_http(None);
        }
        return response.into_http(Some(&key));
    }

    let Some(key) = header_str(&headers, SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };
    let Some(session) = state.session(key).await else {
        return (StatusCode::NOT_FOUND, "unknown mcp-session-id").into_response();
    };

    if let IncomingMessage::Notification(notification) = &message {
        if notification.method == "notifications/cancelled" {
            if let Some(Ok(params)) = notification
                .params
                .clone()
                .map(serde_json::from_value::<CancelledParams>)
            {
                // The cancelled request gets no response; release its waiter.
                lock_pending(&session.pending).remove(&params.request_id);
            }
        }
    }

    let id = match &message {
        IncomingMessage::Request(request) => Some(request.id.clone()),
        IncomingMessage::Notification(_) | IncomingMessage::Response(_) => None,
    };
    forward(&session, body, id).await.into_http(Some(key))
}

/// What came back from the session engine.
enum Forwarded {
    /// The response frame for a request.
    Frame(String),
    /// A notification or client response was accepted.
    Accepted,
    /// The request was cancelled or the session ended first.
    NoResponse,
    /// The id is already waiting for a response.
    Duplicate(RequestId),
    /// The session is gone.
    Closed,
}

impl Forwarded {
    fn is_success(&self) -> bool {
        match self {
            Self::Frame(frame) => serde_json::from_str::<Value>(frame)
                .map(|value| value.get("result").is_some())
                .unwrap_or(false),
            _ => false,
        }
    }

    fn into_http(self, session: Option<&str>) -> Response {
        match self {
            Self::Frame(frame) => json_body(frame, session),
            Self::Accepted => StatusCode::ACCEPTED.into_response(),
            Self::NoResponse => StatusCode::NO_CONTENT.into_response(),
            Self::Duplicate(id) => jsonrpc_response(&JsonRpcError::duplicate_id(id), session),
            Self::Closed => (StatusCode::NOT_FOUND, "session closed").into_response(),
        }
    }
}

async fn forward(session: &HttpSession, frame: String, id: Option<RequestId>) -> Forwarded {
    let Some(id) = id else {
        return if session.inbound.send(frame).await.is_ok() {
            Forwarded::Accepted
        } else {
            Forwarded::Closed
        };
    };

    let (tx, rx) = oneshot::channel();
    {
        let mut pending = lock_pending(&session.pending);
        if pending.contains_key(&id) {
            return Forwarded::Duplicate(id);
        }
        pending.insert(id.clone(), tx);
    }

    if session.inbound.send(frame).await.is_err() {
        lock_pending(&session.pending).remove(&id);
        return Forwarded::Closed;
    }

    rx.await.map_or(Forwarded::NoResponse, Forwarded::Frame)
}

fn jsonrpc_response(error: &JsonRpcError, session: Option<&str>) -> Response {
    match serde_json::to_string(error) {
        Ok(body) => json_body(body, session),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn json_body(body: String, session: Option<&str>) -> Response {
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    if let Some(value) = session.and_then(|s| HeaderValue::from_str(s).ok()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifespan::Lifespan;
    use crate::registry::Registries;
    use std::time::Duration;

    #[tokio::test]
    async fn ended_sessions_are_reaped_when_another_opens() {
        let lifespan = Lifespan::create(&Config::default(), &[]).unwrap();
        let state = HttpState::new(McpServer::new(Registries::new(), lifespan, Duration::ZERO));

        let (first, _) = state.open_session().await;
        state.remove_session(&first).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let (key, _) = state.open_session().await;
            let tracked = state.tasks.lock().await.len();
            state.remove_session(&key).await;
            if tracked == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "ended sessions still tracked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        state.stop.cancel();
    }

    #[tokio::test]
    async fn send_routes_by_id() {
        let (_tx, rx) = mpsc::channel(1);
        let pending = Pending::default();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        lock_pending(&pending).insert(RequestId::String("a".into()), waiter_tx);

        let mut transport = HttpTransport {
            inbound: rx,
            pending: Arc::clone(&pending),
        };
        transport
            .send(r#"{"jsonrpc":"2.0","id":"a","result":{}}"#)
            .await
            .unwrap();
        transport
            .send(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#)
            .await
            .unwrap();

        assert!(waiter_rx.await.unwrap().contains(r#""id":"a""#));
        assert!(lock_pending(&pending).is_empty());
    }

    #[tokio::test]
    async fn dropping_transport_releases_waiters() {
        let (_tx, rx) = mpsc::channel(1);
        let pending = Pending::default();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        lock_pending(&pending).insert(RequestId::Number(1), waiter_tx);

        drop(HttpTransport {
            inbound: rx,
            pending,
        });
        assert!(waiter_rx.await.is_err());
    }
}
