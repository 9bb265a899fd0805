//! Integration tests for MCP protocol handling.
//!
//! These tests drive whole sessions over an in-memory stdio pipe, with a POSIX
//! shell standing in for R, and check request/response handling, error
//! responses, lifecycle rules, progress and cancellation.

mod common;

use common::{shell_config, stand_in_server, stats, wait_until, Client};
use rstats_mcp::mcp::protocol::{parse_message, IncomingMessage, RequestId};
use serde_json::json;

/// Prints a fixed correlation payload after some formatted text.
const PERFECT_CORRELATION: &str = r#"cat > /dev/null
echo "Pearson's product-moment correlation"
echo '{"method":"pearson","estimate":1.0,"p_value":0.0,"n":5}'
"#;

/// Echoes the request line back, so the payload is the request itself.
const ECHO: &str = "cat\n";

/// Fails the way R does when a script calls stop().
const R_FAILURE: &str = r#"cat > /dev/null
echo 'Error in cor.test.default(x, y) : not enough finite observations' >&2
echo 'Calls: cor.test -> cor.test.default' >&2
echo 'Execution halted' >&2
exit 1
"#;

/// Runs far longer than any test waits.
const SLOW: &str = "exec sleep 30\n";

// =============================================================================
// Protocol Parsing Tests
// =============================================================================

#[test]
fn test_parse_initialize_request() {
    let json = r#"{
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {
                "name": "test-client",
                "version": "1.0.0"
            }
        }
    }"#;

    let IncomingMessage::Request(req) = parse_message(json).unwrap() else {
        panic!("Expected Request");
    };
    assert_eq!(req.method, "initialize");
    assert_eq!(req.id, RequestId::Number(1));
}

#[test]
fn test_parse_cancel_notification() {
    let json = r#"{
        "jsonrpc": "2.0",
        "method": "notifications/cancelled",
        "params": {"requestId": "call-3", "reason": "user aborted"}
    }"#;

    let IncomingMessage::Notification(notif) = parse_message(json).unwrap() else {
        panic!("Expected Notification");
    };
    assert_eq!(notif.method, "notifications/cancelled");
    assert_eq!(notif.params.unwrap()["requestId"], "call-3");
}

#[test]
fn test_parse_client_response() {
    let json = r#"{"jsonrpc": "2.0", "id": 4, "result": {}}"#;
    assert!(matches!(
        parse_message(json).unwrap(),
        IncomingMessage::Response(_)
    ));
}

// =============================================================================
// Session Tests
// =============================================================================

#[tokio::test]
async fn test_initialize_negotiates_version() {
    let server = stand_in_server(&[], shell_config(5));
    let (mut client, task) = Client::connect(&server);

    let response = client.initialize().await;
    assert_eq!(response["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(response["result"]["serverInfo"]["name"], "rstats-mcp");
    assert!(response["result"]["capabilities"]["tools"].is_object());

    let again = client
        .request(1, "initialize", json!({"protocolVersion": "2025-06-18", "capabilities": {}}))
        .await;
    assert_eq!(again["error"]["code"], -32000);

    assert!(client.finish().await.is_empty());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_requests_before_initialize_are_rejected() {
    let server = stand_in_server(&[], shell_config(5));
    let (mut client, task) = Client::connect(&server);

    let response = client.request(1, "tools/list", json!({})).await;
    assert_eq!(response["error"]["code"], -32000);
    assert_eq!(response["error"]["data"]["kind"], "session_state_error");
    assert_eq!(response["error"]["data"]["state"], "uninitialized");

    // The session is still usable afterwards.
    let response = client.initialize().await;
    assert!(response["result"].is_object());

    client.finish().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_listing_and_lookup_errors() {
    let server = stand_in_server(&[], shell_config(5));
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    let tools = client.request(1, "tools/list", json!({})).await;
    let names: Vec<_> = tools["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        names,
        ["correlation_analysis", "descriptive_statistics", "linear_regression", "t_test"]
    );

    let missing = client.call_tool(2, "anova", json!({})).await;
    assert_eq!(missing["error"]["code"], -32002);
    assert_eq!(missing["error"]["data"]["kind"], "tool_not_found");

    let unknown = client.request(3, "tools/delete", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);

    let resources = client.request(4, "resources/list", json!({})).await;
    assert_eq!(resources["result"]["resources"][0]["uri"], "stats://server/config");

    let prompts = client.request(5, "prompts/list", json!({})).await;
    assert_eq!(prompts["result"]["prompts"][0]["name"], "analyze_dataset");

    client.finish().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_frames_do_not_end_the_session() {
    let server = stand_in_server(&[], shell_config(5));
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    client.send_raw("{\"jsonrpc\": \"2.0\", \"id\": ").await;
    let error = client.recv().await.unwrap();
    assert_eq!(error["error"]["code"], -32700);
    assert!(error["id"].is_null());

    client.send_raw("[{\"jsonrpc\": \"2.0\", \"id\": 1, \"method\": \"ping\"}]").await;
    let error = client.recv().await.unwrap();
    assert_eq!(error["error"]["code"], -32600);

    let pong = client.request(2, "ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));

    client.finish().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_non_utf8_frame_does_not_end_the_session() {
    let server = stand_in_server(&[], shell_config(5));
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    client.send_bytes(b"\xff\xfe garbage").await;
    let error = client.recv().await.unwrap();
    assert_eq!(error["error"]["code"], -32700);
    assert!(error["id"].is_null());

    let pong = client.request(2, "ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));

    client.finish().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_request_drains_and_closes() {
    let server = stand_in_server(&[], shell_config(5));
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    let response = client.request(1, "shutdown", json!({})).await;
    assert_eq!(response["result"], json!({}));
    task.await.unwrap().unwrap();

    // The server closed its side; nothing else is answered.
    assert!(client.finish().await.is_empty());
}

// =============================================================================
// Tool Call Tests
// =============================================================================

#[tokio::test]
async fn test_tool_success_is_formatted() {
    let server = stand_in_server(
        &[("correlation_analysis", PERFECT_CORRELATION)],
        shell_config(5),
    );
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    let response = client
        .call_tool(
            1,
            "correlation_analysis",
            json!({"data": {"x": [1, 2, 3, 4, 5], "y": [2, 4, 6, 8, 10]}}),
        )
        .await;
    let result = &response["result"];
    assert_eq!(result["structuredContent"]["estimate"], 1.0);
    assert!(result.get("isError").is_none());

    let table = result["content"][0]["text"].as_str().unwrap();
    assert!(table.contains("| Estimate | 1 |"));
    assert!(table.contains("statistically significant"));
    assert_eq!(
        result["content"][1]["text"],
        "Pearson's product-moment correlation"
    );

    client.finish().await;
    task.await.unwrap().unwrap();
    assert_eq!(stats(&server).spawned(), 1);
    assert_eq!(stats(&server).reaped(), 1);
}

#[tokio::test]
async fn test_runtime_receives_selected_columns_and_options() {
    let server = stand_in_server(&[("t_test", ECHO)], shell_config(5));
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    let response = client
        .call_tool(
            1,
            "t_test",
            json!({
                "data": {"before": [5, 6, 7], "label": [1, 1, 1], "after": [6, 8, null]},
                "columns": ["after", "before"],
                "paired": true,
                "mu": 0.5
            }),
        )
        .await;
    let request = &response["result"]["structuredContent"];
    assert_eq!(request["tool"], "t_test");
    assert_eq!(
        request["arguments"]["data"],
        json!({"after": [6.0, 8.0, null], "before": [5.0, 6.0, 7.0]})
    );
    assert_eq!(
        request["arguments"]["options"],
        json!({"mu": 0.5, "paired": true})
    );

    client.finish().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_mismatched_lengths_never_spawn() {
    let server = stand_in_server(
        &[("correlation_analysis", PERFECT_CORRELATION)],
        shell_config(5),
    );
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    let response = client
        .call_tool(
            1,
            "correlation_analysis",
            json!({"data": {"x": [1, 2], "y": [1, 2, 3]}}),
        )
        .await;
    assert_eq!(response["error"]["code"], -32602);
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("equal lengths"));

    let schema = client
        .call_tool(2, "correlation_analysis", json!({"data": {"x": ["a"]}}))
        .await;
    assert_eq!(schema["error"]["code"], -32602);
    assert!(!schema["error"]["data"]["details"].as_array().unwrap().is_empty());

    let extra = client
        .call_tool(3, "descriptive_statistics", json!({"data": {"x": [1]}, "colour": "red"}))
        .await;
    assert_eq!(extra["error"]["code"], -32602);

    client.finish().await;
    task.await.unwrap().unwrap();
    assert_eq!(stats(&server).spawned(), 0);
}

#[tokio::test]
async fn test_script_error_reports_diagnostic() {
    let server = stand_in_server(&[("correlation_analysis", R_FAILURE)], shell_config(5));
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    let response = client
        .call_tool(
            1,
            "correlation_analysis",
            json!({"data": {"x": [1, 2], "y": [1, 2]}}),
        )
        .await;
    let error = &response["error"];
    assert_eq!(error["code"], -32001);
    assert_eq!(error["data"]["kind"], "tool_execution_error");
    assert_eq!(error["data"]["failure"], "script_error");
    assert!(error["message"]
        .as_str()
        .unwrap()
        .contains("not enough finite observations"));

    let diagnostic = error["data"]["diagnostic"].as_str().unwrap();
    assert!(diagnostic.contains("not enough finite observations"));
    assert!(!diagnostic.contains("Calls:"));
    assert!(!diagnostic.contains("Execution halted"));

    client.finish().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_runtime_output() {
    let server = stand_in_server(
        &[("descriptive_statistics", "cat > /dev/null\necho 'mean = 3'\n")],
        shell_config(5),
    );
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    let response = client
        .call_tool(1, "descriptive_statistics", json!({"data": {"x": [1, 5]}}))
        .await;
    assert_eq!(response["error"]["code"], -32001);
    assert_eq!(response["error"]["data"]["kind"], "tool_execution_error");
    assert_eq!(response["error"]["data"]["failure"], "malformed_output");

    client.finish().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_progress_precedes_response() {
    let server = stand_in_server(
        &[("correlation_analysis", PERFECT_CORRELATION)],
        shell_config(5),
    );
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    let response = client
        .request(
            1,
            "tools/call",
            json!({
                "name": "correlation_analysis",
                "arguments": {"data": {"x": [1, 2, 3], "y": [3, 2, 1]}},
                "_meta": {"progressToken": "corr-1"}
            }),
        )
        .await;
    assert!(response["result"].is_object());

    let progress: Vec<_> = client
        .notifications
        .iter()
        .filter(|n| n["method"] == "notifications/progress")
        .collect();
    assert_eq!(progress.len(), 2);
    assert!(progress.iter().all(|n| n["params"]["progressToken"] == "corr-1"));
    assert_eq!(progress[0]["params"]["progress"], 0.0);
    assert_eq!(progress[1]["params"]["progress"], 2.0);
    assert_eq!(progress[1]["params"]["total"], 2.0);

    client.finish().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancelled_request_gets_no_response() {
    let server = stand_in_server(&[("descriptive_statistics", SLOW)], shell_config(30));
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    client
        .start(
            5,
            "tools/call",
            json!({"name": "descriptive_statistics", "arguments": {"data": {"x": [1]}}}),
        )
        .await;
    let counters = stats(&server);
    wait_until(|| counters.spawned() == 1).await;

    client
        .notify(
            "notifications/cancelled",
            json!({"requestId": 5, "reason": "test"}),
        )
        .await;
    wait_until(|| counters.reaped() == 1).await;

    // The next frame is the ping response, not a late answer for id 5.
    let pong = client.request(6, "ping", json!({})).await;
    assert_eq!(pong["id"], 6);

    let rest = client.finish().await;
    assert!(rest.iter().all(|frame| frame["id"] != 5));
    task.await.unwrap().unwrap();
    assert_eq!(counters.live(), 0);
}

#[tokio::test]
async fn test_duplicate_in_flight_id_is_rejected() {
    let server = stand_in_server(&[("descriptive_statistics", SLOW)], shell_config(30));
    let (mut client, task) = Client::connect(&server);
    client.initialize().await;

    let call = json!({"name": "descriptive_statistics", "arguments": {"data": {"x": [1]}}});
    client.start(9, "tools/call", call.clone()).await;
    client.start(9, "tools/call", call).await;

    let duplicate = client.recv().await.unwrap();
    assert_eq!(duplicate["id"], 9);
    assert_eq!(duplicate["error"]["code"], -32600);

    client
        .notify("notifications/cancelled", json!({"requestId": 9}))
        .await;
    client.finish().await;
    task.await.unwrap().unwrap();

    let counters = stats(&server);
    assert_eq!(counters.spawned(), counters.reaped());
}
