//! JSON-RPC dispatch: handshake, tool listing, tool calls and the error
//! envelope, all against the in-memory transport.

mod common;

use serde_json::{json, Value};
use ssh_mcp::mcp::protocol::{INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION};
use ssh_mcp::transport::memory::MemoryHost;
use ssh_mcp::transport::ExecOutput;

use common::*;

// ---------------------------------------------------------------------------
// Protocol surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initialize_reports_identity_and_capabilities() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    assert!(!d.is_initialized());

    let resp = d
        .dispatch(request(1, "initialize", json!({"clientInfo": {"name": "test-host"}})))
        .await
        .unwrap();
    let result = resp.result.unwrap();
    assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    assert_eq!(result["capabilities"], json!({"tools": {}}));
    assert_eq!(result["serverInfo"]["name"], "ssh-mcp");
    assert!(result["serverInfo"]["version"].is_string());
    assert!(d.is_initialized());
}

#[tokio::test]
async fn tool_calls_work_before_initialize() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    let resp = call_tool(&d, "ssh_list_connections", json!({})).await;
    assert_eq!(tool_data(&resp), json!({"connections": [], "total": 0}));
}

#[tokio::test]
async fn tools_list_contains_catalog() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    let resp = d.dispatch(request(2, "tools/list", json!({}))).await.unwrap();
    let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
    let names: Vec<_> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        vec![
            "ssh_connect",
            "ssh_execute",
            "ssh_read_file",
            "ssh_write_file",
            "ssh_list_directory",
            "ssh_disconnect",
            "ssh_list_connections",
        ]
    );
    let connect = &tools[0];
    assert_eq!(connect["inputSchema"]["type"], "object");
    assert_eq!(connect["inputSchema"]["required"], json!(["hostname", "username"]));
    assert_eq!(connect["inputSchema"]["properties"]["port"]["default"], 22);
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    let resp = d.dispatch(request(3, "resources/list", json!({}))).await.unwrap();
    let error = resp.error.unwrap();
    assert_eq!(error.code, METHOD_NOT_FOUND);
    assert_eq!(resp.id, json!(3));
}

#[tokio::test]
async fn notifications_get_no_response() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    assert!(d
        .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .await
        .is_none());
    assert!(d.is_initialized());
    assert!(d.handle_line(r#"{"jsonrpc":"2.0","method":"ping"}"#).await.is_none());
}

#[tokio::test]
async fn malformed_lines_get_protocol_errors() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);

    let resp = d.handle_line("{oops").await.unwrap();
    assert_eq!(resp.error.unwrap().code, PARSE_ERROR);

    let resp = d.handle_line(r#"{"jsonrpc":"2.0","id":4}"#).await.unwrap();
    assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);
    assert_eq!(resp.id, json!(4));
}

#[tokio::test]
async fn tools_call_envelope_errors_are_invalid_params() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);

    for params in [
        json!({}),
        json!({"name": ""}),
        json!({"name": "ssh_list_connections", "arguments": [1]}),
    ] {
        let resp = d.dispatch(request(5, "tools/call", params.clone())).await.unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS, "{params}");
    }

    let resp = d
        .dispatch(request(5, "tools/call", json!({"name": "ssh_list_connections", "arguments": null})))
        .await
        .unwrap();
    assert!(resp.result.is_some());
}

#[tokio::test]
async fn every_response_has_exactly_one_of_result_or_error() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    for line in [
        r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        r#"{"jsonrpc":"2.0","id":2,"method":"nope"}"#,
        r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"bogus"}}"#,
        r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"ssh_connect","arguments":{}}}"#,
    ] {
        let resp = d.handle_line(line).await.unwrap();
        let value: Value = serde_json::from_str(&resp.to_line()).unwrap();
        assert!(value.get("result").is_some() ^ value.get("error").is_some(), "{value}");
    }
}

// ---------------------------------------------------------------------------
// Tool-level errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_tool_is_tool_error() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    let data = tool_error(&call_tool(&d, "ssh_teleport", json!({})).await);
    assert_eq!(data["metadata"]["kind"], "unknown_tool");
    assert_eq!(data["metadata"]["tool"], "ssh_teleport");
}

#[tokio::test]
async fn validation_failures_are_tool_errors() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);

    let resp = call_tool(&d, "ssh_connect", json!({"hostname": "h.example"})).await;
    assert_eq!(
        resp.error.as_ref().unwrap().message,
        "Tool error: Required parameter 'username' is missing"
    );
    assert_eq!(tool_error(&resp)["metadata"]["kind"], "invalid_parameters");

    let data = tool_error(
        &call_tool(&d, "ssh_connect", json!({"hostname": "h.example", "username": "u", "port": 70000})).await,
    );
    assert_eq!(data["error"], "Parameter 'port' must be <= 65535, got 70000");

    let data = tool_error(
        &call_tool(&d, "ssh_connect", json!({"hostname": "h.example", "username": "u", "port": true})).await,
    );
    assert_eq!(
        data["error"],
        "Invalid type for parameter 'port': Expected integer, got boolean"
    );

    let data = tool_error(&call_tool(&d, "ssh_list_connections", json!({"verbose": true, "all": 1})).await);
    assert_eq!(data["error"], "Unexpected parameters: all, verbose");

    assert_eq!(host.connections_opened(), 0);
}

#[tokio::test]
async fn capacity_error_names_the_limit() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 1);
    connect(&d, "a.example").await;
    let data = tool_error(&call_tool(&d, "ssh_connect", json!({"hostname": "b.example", "username": "u"})).await);
    assert_eq!(data["metadata"]["kind"], "capacity");
    assert_eq!(data["error"], "Maximum number of connections (1) reached");
}

#[tokio::test]
async fn authentication_failure_is_classified() {
    let host = MemoryHost::new();
    host.reject_auth(true);
    let d = dispatcher(&host, 1);
    let data = tool_error(&call_tool(&d, "ssh_connect", json!({"hostname": "a.example", "username": "u"})).await);
    assert_eq!(data["metadata"]["kind"], "authentication");
    assert!(data["error"].as_str().unwrap().contains("agent"));
    assert!(d.pool().is_empty());
}

#[tokio::test]
async fn disconnect_unknown_then_known_twice() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);

    let ghost = uuid::Uuid::new_v4().to_string();
    let data = tool_error(&call_tool(&d, "ssh_disconnect", json!({"connection_id": ghost})).await);
    assert_eq!(data["metadata"]["kind"], "not_found");

    let id = connect(&d, "a.example").await;
    let resp = call_tool(&d, "ssh_disconnect", json!({"connection_id": id})).await;
    assert_eq!(tool_data(&resp), json!({"connection_id": id, "status": "disconnected"}));

    let data = tool_error(&call_tool(&d, "ssh_disconnect", json!({"connection_id": id})).await);
    assert_eq!(data["metadata"]["kind"], "not_found");
    assert_eq!(data["metadata"]["connection_id"], id);
}

// ---------------------------------------------------------------------------
// Tool payloads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_payload_carries_connection_info() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    let resp = call_tool(
        &d,
        "ssh_connect",
        json!({"hostname": "db.example", "username": "ops", "port": "2222"}),
    )
    .await;
    let data = tool_data(&resp);
    assert_eq!(data["status"], "connected");
    assert_eq!(data["hostname"], "db.example");
    assert_eq!(data["username"], "ops");
    assert_eq!(data["port"], 2222);
    assert_eq!(data["connected"], true);
    assert!(data["created_at"].as_str().unwrap().ends_with('Z'));

    let envelope = &resp.result.as_ref().unwrap()["structuredContent"];
    assert_eq!(envelope["metadata"]["tool"], "ssh_connect");
    assert_eq!(envelope["metadata"]["connection_id"], data["connection_id"]);

    let text = resp.result.as_ref().unwrap()["content"][0]["text"].as_str().unwrap();
    let reparsed: Value = serde_json::from_str(text).unwrap();
    assert_eq!(&reparsed, envelope);
}

#[tokio::test]
async fn execute_payload() {
    let host = MemoryHost::new();
    host.script(
        "systemctl is-active nginx",
        ExecOutput {
            stdout: String::new(),
            stderr: "inactive\n".into(),
            exit_code: 3,
        },
    );
    let d = dispatcher(&host, 2);
    let id = connect(&d, "web.example").await;

    let data = tool_data(&call_tool(&d, "ssh_execute", json!({"connection_id": id, "command": "echo hi"})).await);
    assert_eq!(data["stdout"], "hi\n");
    assert_eq!(data["stderr"], "");
    assert_eq!(data["exit_code"], 0);
    assert_eq!(data["success"], true);
    assert_eq!(data["command"], "echo hi");
    assert_eq!(data["has_output"], true);
    assert!(data["execution_time"].as_f64().unwrap() >= 0.0);
    assert!(data["timestamp"].is_string());

    let data = tool_data(
        &call_tool(&d, "ssh_execute", json!({"connection_id": id, "command": "systemctl is-active nginx"})).await,
    );
    assert_eq!(data["exit_code"], 3);
    assert_eq!(data["success"], false);
    assert_eq!(data["stderr"], "inactive\n");
}

#[tokio::test]
async fn execute_empty_command_is_invalid_parameters() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    let id = connect(&d, "web.example").await;
    let data = tool_error(&call_tool(&d, "ssh_execute", json!({"connection_id": id, "command": "   "})).await);
    assert_eq!(data["metadata"]["kind"], "invalid_parameters");
    assert_eq!(data["error"], "command cannot be empty");
}

#[tokio::test]
async fn lost_connection_reports_not_connected() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    let id = connect(&d, "web.example").await;

    host.drop_connection_on_next_op();
    let data = tool_error(&call_tool(&d, "ssh_execute", json!({"connection_id": id, "command": "true"})).await);
    assert_eq!(data["metadata"]["kind"], "connection");

    let data = tool_error(&call_tool(&d, "ssh_execute", json!({"connection_id": id, "command": "true"})).await);
    assert_eq!(data["metadata"]["kind"], "not_connected");

    let listed = tool_data(&call_tool(&d, "ssh_list_connections", json!({})).await);
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["connections"][0]["connected"], false);
}

#[tokio::test]
async fn write_read_round_trip_through_tools() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    let id = connect(&d, "files.example").await;
    let content = "línea uno\nlínea dos";

    let written = tool_data(
        &call_tool(
            &d,
            "ssh_write_file",
            json!({"connection_id": id, "file_path": "/data/new/report.txt", "content": content, "create_dirs": "true"}),
        )
        .await,
    );
    assert_eq!(
        written,
        json!({
            "file_path": "/data/new/report.txt",
            "bytes_written": content.len(),
            "encoding": "utf-8",
            "create_dirs": true,
            "status": "success",
        })
    );

    let read = tool_data(
        &call_tool(&d, "ssh_read_file", json!({"connection_id": id, "file_path": "/data/new/report.txt"})).await,
    );
    assert_eq!(read["content"], content);
    assert_eq!(read["size"], content.len());
    assert_eq!(read["lines"], 2);
    assert_eq!(read["encoding"], "utf-8");
}

#[tokio::test]
async fn ascii_write_rejects_non_ascii() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 2);
    let id = connect(&d, "files.example").await;
    let data = tool_error(
        &call_tool(
            &d,
            "ssh_write_file",
            json!({"connection_id": id, "file_path": "/tmp/a.txt", "content": "naïve", "encoding": "ascii"}),
        )
        .await,
    );
    assert_eq!(data["metadata"]["kind"], "encoding");
    assert!(host.file("/tmp/a.txt").is_none());
}

#[tokio::test]
async fn list_connections_in_creation_order() {
    let host = MemoryHost::new();
    let d = dispatcher(&host, 5);
    for (name, port) in [("server1.com", 22), ("server2.com", 23), ("server3.com", 24)] {
        tool_data(&call_tool(&d, "ssh_connect", json!({"hostname": name, "username": "root", "port": port})).await);
    }
    let data = tool_data(&call_tool(&d, "ssh_list_connections", json!({})).await);
    assert_eq!(data["total"], 3);
    let seen: Vec<(String, u64)> = data["connections"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| (c["hostname"].as_str().unwrap().to_string(), c["port"].as_u64().unwrap()))
        .collect();
    assert_eq!(
        seen,
        vec![
            ("server1.com".to_string(), 22),
            ("server2.com".to_string(), 23),
            ("server3.com".to_string(), 24),
        ]
    );
}
