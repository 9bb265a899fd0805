//! Per-request context.
//!
//! A [`RequestContext`] is built by the session engine for every request it
//! dispatches to a registry and dropped when that request's task finishes. It
//! gives handlers the request and session identity, a shared handle to the
//! process-wide [`LifespanState`], a cancellation signal, and an optional
//! progress reporter.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::lifespan::LifespanState;
use crate::mcp::protocol::{OutgoingNotification, RequestId};

/// Identifier of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A one-shot, cloneable cancellation flag.
///
/// Once [`cancel`](Self::cancel) is called every current and future waiter on
/// [`cancelled`](Self::cancelled) completes.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Creates a signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns whether the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes once the signal has fired.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends `notifications/progress` for one request.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    token: Value,
    sink: mpsc::UnboundedSender<OutgoingNotification>,
}

impl ProgressReporter {
    /// Creates a reporter that tags notifications with `token`.
    #[must_use]
    pub const fn new(token: Value, sink: mpsc::UnboundedSender<OutgoingNotification>) -> Self {
        Self { token, sink }
    }

    /// Reports progress. Delivery is best-effort.
    pub fn report(&self, progress: f64, total: Option<f64>, message: &str) {
        let notification =
            OutgoingNotification::progress(&self.token, progress, total, Some(message));
        if self.sink.send(notification).is_err() {
            tracing::debug!("Progress notification dropped: session closed");
        }
    }
}

/// Everything a handler knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    session_id: SessionId,
    request_id: RequestId,
    lifespan: Arc<LifespanState>,
    cancel: CancelSignal,
    progress: Option<ProgressReporter>,
}

impl RequestContext {
    /// Creates a context for one request.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        request_id: RequestId,
        lifespan: Arc<LifespanState>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            session_id,
            request_id,
            lifespan,
            cancel,
            progress: None,
        }
    }

    /// Attaches a progress reporter.
    #[must_use]
    pub fn with_progress(mut self, progress: Option<ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// The session this request arrived on.
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The request being served.
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Process-wide shared state.
    #[must_use]
    pub fn lifespan(&self) -> &LifespanState {
        &self.lifespan
    }

    /// The request's cancellation signal.
    #[must_use]
    pub const fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Reports progress if the client asked for it.
    pub fn report_progress(&self, progress: f64, total: Option<f64>, message: &str) {
        if let Some(reporter) = &self.progress {
            reporter.report(progress, total, message);
        }
    }
}
