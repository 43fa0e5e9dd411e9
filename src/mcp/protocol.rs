use serde::Serialize;
use serde_json::{Map, Value};

/// MCP protocol revision announced by `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Every failure inside a tool call, including unknown tool names.
pub const TOOL_ERROR: i64 = -32000;

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Incoming JSON-RPC request or notification.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    /// `None` when the message carried no `id` member (a notification).
    /// An explicit `null` id is kept as `Some(Value::Null)`.
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Parse one decoded message, producing the error response to send back
    /// when it is not a valid request object.
    pub fn from_value(value: Value) -> Result<Self, Box<JsonRpcResponse>> {
        let Value::Object(mut obj) = value else {
            return Err(Box::new(JsonRpcResponse::error(
                Value::Null,
                INVALID_REQUEST,
                "Invalid Request: expected a JSON object",
            )));
        };

        let id = obj.remove("id");
        if let Some(bad) = id.as_ref().filter(|v| !(v.is_string() || v.is_number() || v.is_null())) {
            return Err(Box::new(JsonRpcResponse::error(
                Value::Null,
                INVALID_REQUEST,
                format!("Invalid Request: id must be a string, number or null, got {bad}"),
            )));
        }
        let reply_id = id.clone().unwrap_or(Value::Null);

        if let Some(version) = obj.get("jsonrpc") {
            if version != JSONRPC_VERSION {
                return Err(Box::new(JsonRpcResponse::error(
                    reply_id,
                    INVALID_REQUEST,
                    "Invalid Request: jsonrpc must be \"2.0\"",
                )));
            }
        }

        let method = match obj.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => {
                return Err(Box::new(JsonRpcResponse::error(
                    reply_id,
                    INVALID_REQUEST,
                    "Invalid Request: missing method",
                )))
            }
        };

        Ok(Self {
            id,
            method,
            params: obj.remove("params").filter(|p| !p.is_null()),
        })
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Params as an object; absent params read as empty.
    pub fn params_object(&self) -> Option<Map<String, Value>> {
        match &self.params {
            None => Some(Map::new()),
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => None,
        }
    }
}

/// Outgoing JSON-RPC response. Carries exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    pub fn error_with_data(
        id: Value,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Response to a line that was not valid JSON.
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::error(Value::Null, PARSE_ERROR, format!("Parse error: {detail}"))
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":{INTERNAL_ERROR},"message":"failed to encode response: {e}"}}}}"#
            )
        })
    }
}

/// Error payload inside a [`JsonRpcResponse`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
