//! Integration tests for the streamable HTTP transport, using plain HTTP/1.1
//! over a TCP socket.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;

use common::{shell_config, stand_in_server, stats};
use rstats_mcp::mcp::http::{serve_http_on, SESSION_HEADER};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const ECHO_PAYLOAD: &str = "cat > /dev/null\necho '{\"mean\": 2.0, \"n\": 3}'\n";

struct Reply {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }

    fn session(&self) -> Option<&str> {
        self.headers.get(SESSION_HEADER).map(String::as_str)
    }
}

async fn call(addr: SocketAddr, method: &str, session: Option<&str>, body: &str) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!(
        "{method} /mcp HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n",
        body.len()
    );
    if let Some(session) = session {
        request.push_str(&format!("{SESSION_HEADER}: {session}\r\n"));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    Reply {
        status,
        headers,
        body: body.to_string(),
    }
}

async fn post(addr: SocketAddr, session: Option<&str>, message: &Value) -> Reply {
    call(addr, "POST", session, &message.to_string()).await
}

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
    server: rstats_mcp::mcp::McpServer,
}

async fn start() -> Running {
    let server = stand_in_server(&[("descriptive_statistics", ECHO_PAYLOAD)], shell_config(5));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(serve_http_on(server.clone(), listener, "/mcp", async move {
        let _ = stopped.await;
    }));
    Running {
        addr,
        stop,
        task,
        server,
    }
}

async fn initialize(addr: SocketAddr) -> String {
    let reply = post(
        addr,
        None,
        &json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-03-26", "capabilities": {}}
        }),
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["result"]["protocolVersion"], "2025-03-26");
    reply.session().unwrap().to_string()
}

#[tokio::test]
async fn test_http_session_lifecycle() {
    let running = start().await;
    let addr = running.addr;
    let session = initialize(addr).await;

    let ack = post(
        addr,
        Some(&session),
        &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    )
    .await;
    assert_eq!(ack.status, 202);

    let tools = post(
        addr,
        Some(&session),
        &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;
    assert_eq!(tools.status, 200);
    assert_eq!(tools.session(), Some(session.as_str()));
    assert_eq!(tools.json()["result"]["tools"].as_array().unwrap().len(), 4);

    let result = post(
        addr,
        Some(&session),
        &json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "descriptive_statistics", "arguments": {"data": {"x": [1, 2, 3]}}}
        }),
    )
    .await;
    assert_eq!(result.json()["result"]["structuredContent"]["mean"], 2.0);

    let closed = call(addr, "DELETE", Some(&session), "").await;
    assert_eq!(closed.status, 202);
    let gone = post(
        addr,
        Some(&session),
        &json!({"jsonrpc": "2.0", "id": 4, "method": "ping"}),
    )
    .await;
    assert_eq!(gone.status, 404);

    running.stop.send(()).unwrap();
    running.task.await.unwrap().unwrap();
    let counters = stats(&running.server);
    assert_eq!(counters.spawned(), counters.reaped());
}

#[tokio::test]
async fn test_http_rejects_requests_without_a_session() {
    let running = start().await;
    let addr = running.addr;

    let missing = post(addr, None, &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await;
    assert_eq!(missing.status, 400);

    let unknown = post(
        addr,
        Some("no-such-session"),
        &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
    )
    .await;
    assert_eq!(unknown.status, 404);

    let delete = call(addr, "DELETE", Some("no-such-session"), "").await;
    assert_eq!(delete.status, 404);

    let stream = call(addr, "GET", None, "").await;
    assert_eq!(stream.status, 405);

    let malformed = call(addr, "POST", None, "{\"jsonrpc\": ").await;
    assert_eq!(malformed.status, 200);
    assert_eq!(malformed.json()["error"]["code"], -32700);

    running.stop.send(()).unwrap();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_http_failed_initialize_opens_no_session() {
    let running = start().await;
    let addr = running.addr;

    let reply = post(
        addr,
        None,
        &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"capabilities": 3}}),
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["error"]["code"], -32602);
    assert!(reply.session().is_none());

    // Sessions are independent of each other.
    let first = initialize(addr).await;
    let second = initialize(addr).await;
    assert_ne!(first, second);

    running.stop.send(()).unwrap();
    running.task.await.unwrap().unwrap();
}
