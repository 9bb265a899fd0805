//! Message transports for the MCP server.
//!
//! The session engine is written against the [`Transport`] trait only. Two
//! implementations exist: [`StdioTransport`] here and
//! [`HttpTransport`](crate::mcp::http::HttpTransport) for the HTTP channel.
//!
//! The stdio transport follows MCP:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stdin: receives messages from client
//! - stdout: sends messages to client
//! - stderr: may be used for logging (not MCP messages)

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::mcp::protocol::{JsonRpcError, JsonRpcResponse, OutgoingNotification};

/// Moves discrete frames across a byte stream without interpreting them.
#[async_trait]
pub trait Transport: Send {
    /// Receives the next complete frame.
    ///
    /// Returns `None` at end-of-stream. Must be cancel-safe: the session loop
    /// polls it inside `tokio::select!`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream fails. A frame that is not
    /// UTF-8 is consumed and reported as [`io::ErrorKind::InvalidData`]; the
    /// stream stays usable after it.
    async fn receive(&mut self) -> io::Result<Option<String>>;

    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream fails.
    async fn send(&mut self, frame: &str) -> io::Result<()>;

    /// Writes a JSON-RPC response.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    async fn write_response(&mut self, response: &JsonRpcResponse) -> io::Result<()> {
        let json = serde_json::to_string(response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.send(&json).await
    }

    /// Writes a JSON-RPC error.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    async fn write_error(&mut self, error: &JsonRpcError) -> io::Result<()> {
        let json = serde_json::to_string(error)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.send(&json).await
    }

    /// Writes a JSON-RPC notification.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    async fn write_notification(&mut self, notification: &OutgoingNotification) -> io::Result<()> {
        let json = serde_json::to_string(notification)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.send(&json).await
    }
}

/// A newline-delimited JSON transport over a reader/writer pair.
///
/// [`StdioTransport::new`] wires it to the process's stdin and stdout; tests
/// use [`StdioTransport::with_streams`] with in-memory pipes.
pub struct StdioTransport<R = tokio::io::Stdin, W = tokio::io::Stdout> {
    /// Buffered input stream.
    reader: BufReader<R>,
    /// Bytes of the frame being read. Kept across calls so a cancelled
    /// `receive` loses nothing.
    pending: Vec<u8>,
    /// The output stream.
    writer: W,
}

impl StdioTransport {
    /// Creates a new stdio transport.
    #[must_use]
    pub fn new() -> Self {
        Self::with_streams(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a transport over arbitrary streams.
    pub fn with_streams(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            writer,
        }
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn receive(&mut self) -> io::Result<Option<String>> {
        // `read_until` is cancel-safe when the buffer outlives the call.
        let read = self.reader.read_until(b'\n', &mut self.pending).await?;
        if read == 0 && self.pending.is_empty() {
            // EOF - stdin closed
            return Ok(None);
        }

        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
        }
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }

        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn send(&mut self, frame: &str) -> io::Result<()> {
        // MCP spec: messages must not contain embedded newlines
        debug_assert!(
            !frame.contains('\n'),
            "JSON message must not contain embedded newlines"
        );

        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}
