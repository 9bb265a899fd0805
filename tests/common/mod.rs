//! Shared helpers: a line-oriented MCP client over an in-memory pipe and a
//! server whose "R" is a POSIX shell running stand-in scripts.

#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use rstats_mcp::bridge::{ProcessStats, ScriptSource};
use rstats_mcp::config::{Config, RuntimeConfig};
use rstats_mcp::lifespan::Lifespan;
use rstats_mcp::mcp::{McpServer, StdioTransport};
use rstats_mcp::stats;

/// How long a test waits for any single frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime config that runs `sh <script>`.
pub fn shell_runtime(timeout_secs: u64, max_concurrent: usize) -> RuntimeConfig {
    RuntimeConfig {
        command: PathBuf::from("sh"),
        args: Vec::new(),
        timeout_secs,
        max_output_bytes: 1 << 20,
        max_concurrent,
    }
}

/// A server exposing the default catalogue, with each tool's script replaced
/// by a shell snippet.
pub fn stand_in_server(scripts: &[(&str, &str)], config: Config) -> McpServer {
    let sources: Vec<ScriptSource> = scripts
        .iter()
        .map(|(name, body)| ScriptSource::new(*name, format!("{name}.sh"), *body))
        .collect();
    let lifespan = Lifespan::create(&config, &sources).unwrap();
    let registries = stats::default_registries().unwrap();
    McpServer::new(registries, lifespan, config.server.drain_grace())
}

/// Default config with the shell runtime and a short drain grace period.
pub fn shell_config(timeout_secs: u64) -> Config {
    let mut config = Config::default();
    config.runtime = shell_runtime(timeout_secs, 4);
    config.server.drain_grace_secs = 0;
    config
}

/// The server's spawn/reap counters.
pub fn stats(server: &McpServer) -> std::sync::Arc<ProcessStats> {
    server.lifespan_state().bridge().stats()
}

/// Polls `condition` every 10ms for up to `FRAME_TIMEOUT`.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Client end of a stdio session.
pub struct Client {
    writer: Option<WriteHalf<DuplexStream>>,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    /// Notifications seen while waiting for responses.
    pub notifications: Vec<Value>,
}

impl Client {
    /// Starts a session on `server` and returns the client and the session task.
    pub fn connect(server: &McpServer) -> (Self, JoinHandle<io::Result<()>>) {
        let (client, server_side) = tokio::io::duplex(256 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let transport = StdioTransport::with_streams(server_read, server_write);

        let server = server.clone();
        let task = tokio::spawn(async move { server.serve(transport).await });

        let (client_read, client_write) = tokio::io::split(client);
        let client = Self {
            writer: Some(client_write),
            lines: BufReader::new(client_read).lines(),
            notifications: Vec::new(),
        };
        (client, task)
    }

    /// Writes one raw line.
    pub async fn send_raw(&mut self, line: &str) {
        self.send_bytes(line.as_bytes()).await;
    }

    /// Writes one line of arbitrary bytes.
    pub async fn send_bytes(&mut self, line: &[u8]) {
        let writer = self.writer.as_mut().expect("client already closed");
        writer.write_all(line).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        writer.flush().await.unwrap();
    }

    /// Writes one JSON message.
    pub async fn send(&mut self, message: &Value) {
        self.send_raw(&message.to_string()).await;
    }

    /// Sends a request without waiting for its response.
    pub async fn start(&mut self, id: i64, method: &str, params: Value) {
        self.send(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
    }

    /// Sends a notification.
    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    /// Reads the next frame, or `None` at end-of-stream.
    pub async fn recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(FRAME_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Reads until the response for `id`, keeping notifications.
    pub async fn response(&mut self, id: i64) -> Value {
        loop {
            let frame = self.recv().await.expect("stream ended before response");
            if frame.get("id") == Some(&json!(id)) {
                return frame;
            }
            assert!(
                frame.get("method").is_some(),
                "unexpected response while waiting for {id}: {frame}"
            );
            self.notifications.push(frame);
        }
    }

    /// Sends a request and waits for its response.
    pub async fn request(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.start(id, method, params).await;
        self.response(id).await
    }

    /// Runs the handshake.
    pub async fn initialize(&mut self) -> Value {
        let response = self
            .request(
                0,
                "initialize",
                json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "clientInfo": {"name": "integration-test", "version": "1.0"}
                }),
            )
            .await;
        self.notify("notifications/initialized", json!({})).await;
        response
    }

    /// Calls a tool.
    pub async fn call_tool(&mut self, id: i64, name: &str, arguments: Value) -> Value {
        self.request(id, "tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    /// Closes the client's write side (end-of-stream for the server).
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await.unwrap();
        }
    }

    /// Closes the stream and collects every remaining frame.
    pub async fn finish(mut self) -> Vec<Value> {
        self.close().await;
        let mut rest = Vec::new();
        while let Some(frame) = self.recv().await {
            rest.push(frame);
        }
        rest
    }
}
