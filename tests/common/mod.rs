#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use ssh_mcp::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use ssh_mcp::mcp::{AuthPolicy, Dispatcher, ServerIdentity};
use ssh_mcp::model::{ConnectionConfig, ConnectionParams};
use ssh_mcp::pool::Pool;
use ssh_mcp::session::SessionPolicy;
use ssh_mcp::transport::memory::MemoryHost;

/// A memory-backed pool with the default session policy.
pub fn memory_pool(host: &MemoryHost, max_connections: usize) -> Pool {
    memory_pool_with_policy(host, max_connections, SessionPolicy::default())
}

pub fn memory_pool_with_policy(host: &MemoryHost, max_connections: usize, policy: SessionPolicy) -> Pool {
    Pool::new(max_connections, policy, Arc::new(host.clone()))
}

pub fn dispatcher(host: &MemoryHost, max_connections: usize) -> Dispatcher {
    Dispatcher::new(
        memory_pool(host, max_connections),
        ServerIdentity::default(),
        AuthPolicy::default(),
    )
}

/// Agent-auth config for `host` on the default port.
pub fn agent_config(host: &str) -> ConnectionConfig {
    agent_config_on(host, 22)
}

pub fn agent_config_on(host: &str, port: i64) -> ConnectionConfig {
    ConnectionConfig::new(ConnectionParams::new(host, "deploy").port(port))
        .expect("test config should be valid")
}

pub fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
    JsonRpcRequest {
        id: Some(json!(id)),
        method: method.to_string(),
        params: Some(params),
    }
}

/// Send a `tools/call` and return the response.
pub async fn call_tool(d: &Dispatcher, name: &str, arguments: Value) -> JsonRpcResponse {
    d.dispatch(request(1, "tools/call", json!({ "name": name, "arguments": arguments })))
        .await
        .expect("requests with an id always get a response")
}

/// The `data` member of a successful tool call. Panics on error responses.
pub fn tool_data(resp: &JsonRpcResponse) -> Value {
    match (&resp.result, &resp.error) {
        (Some(result), None) => {
            assert_eq!(result["isError"], false);
            assert_eq!(result["structuredContent"]["success"], true);
            result["structuredContent"]["data"].clone()
        }
        _ => panic!("expected tool success, got {resp:?}"),
    }
}

/// The `error.data` member of a failed tool call.
pub fn tool_error(resp: &JsonRpcResponse) -> Value {
    let error = resp.error.as_ref().unwrap_or_else(|| panic!("expected tool error, got {resp:?}"));
    assert_eq!(error.code, -32000);
    assert!(resp.result.is_none());
    let data = error.data.clone().expect("tool errors carry data");
    assert_eq!(data["success"], false);
    data
}

/// Connect through the dispatcher and return the new connection id.
pub async fn connect(d: &Dispatcher, hostname: &str) -> String {
    let resp = call_tool(d, "ssh_connect", json!({ "hostname": hostname, "username": "deploy" })).await;
    tool_data(&resp)["connection_id"]
        .as_str()
        .expect("connection_id is a string")
        .to_string()
}
