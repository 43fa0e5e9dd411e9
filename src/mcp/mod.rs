pub mod protocol;
pub mod tools;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::model::{
    AuthMethod, ConfigError, ConnectionConfig, ConnectionInfo, ConnectionParams, DirEntry,
    FileEncoding, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PORT,
};
use crate::pool::{Pool, PoolError};
use crate::session::SessionError;
use protocol::{JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS, METHOD_NOT_FOUND, PROTOCOL_VERSION, TOOL_ERROR};
use tools::{ToolArguments, ValidationError};

/// Name and version reported by `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: "ssh-mcp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Which authentication methods `ssh_connect` may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPolicy {
    pub allow_key: bool,
    pub allow_password: bool,
    pub allow_agent: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            allow_key: true,
            allow_password: true,
            allow_agent: true,
        }
    }
}

impl AuthPolicy {
    pub fn allows(&self, method: AuthMethod) -> bool {
        match method {
            AuthMethod::Key => self.allow_key,
            AuthMethod::Password => self.allow_password,
            AuthMethod::Agent => self.allow_agent,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool errors
// ---------------------------------------------------------------------------

/// A failure inside a tool call. Always reported with [`TOOL_ERROR`].
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    InvalidParameters(#[from] ValidationError),
    #[error("Invalid connection configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("Authentication method '{0}' is disabled on this server")]
    AuthDisabled(AuthMethod),
    #[error("Connection {0} not found")]
    UnknownConnection(String),
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ToolError {
    /// Stable machine-readable classification, reported as `metadata.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::InvalidParameters(_) => "invalid_parameters",
            ToolError::InvalidConfig(_) => "invalid_config",
            ToolError::AuthDisabled(_) => "auth_disabled",
            ToolError::UnknownConnection(_) => "not_found",
            ToolError::UnsupportedEncoding(_) => "encoding",
            ToolError::Pool(PoolError::CapacityReached { .. }) => "capacity",
            ToolError::Pool(PoolError::NotFound(_)) => "not_found",
            ToolError::Pool(PoolError::Session { source, .. }) => match source {
                SessionError::NotConnected { .. } => "not_connected",
                SessionError::EmptyCommand { .. } => "invalid_parameters",
                SessionError::Auth { .. } => "authentication",
                SessionError::Connection { .. } | SessionError::ReconnectFailed { .. } => {
                    "connection"
                }
                SessionError::Timeout { .. } => "timeout",
                SessionError::File { .. } => "file",
                SessionError::Encoding { .. } => "encoding",
            },
        }
    }

    pub fn connection_id(&self) -> Option<String> {
        match self {
            ToolError::UnknownConnection(raw) => Some(raw.clone()),
            ToolError::Pool(e) => e.connection_id().map(|id| id.to_string()),
            _ => None,
        }
    }

    fn into_response(self, id: Value, tool: &str) -> JsonRpcResponse {
        let message = self.to_string();
        let mut metadata = Map::new();
        metadata.insert("tool".into(), json!(tool));
        metadata.insert("kind".into(), json!(self.kind()));
        if let Some(conn) = self.connection_id() {
            metadata.insert("connection_id".into(), json!(conn));
        }
        JsonRpcResponse::error_with_data(
            id,
            TOOL_ERROR,
            format!("Tool error: {message}"),
            Some(json!({
                "success": false,
                "error": message,
                "metadata": metadata,
            })),
        )
    }
}

/// Successful tool output before it is wrapped for the wire.
struct ToolOutput {
    data: Value,
    connection_id: Option<Uuid>,
}

impl ToolOutput {
    fn new(data: Value) -> Self {
        Self {
            data,
            connection_id: None,
        }
    }

    fn for_connection(data: Value, id: Uuid) -> Self {
        Self {
            data,
            connection_id: Some(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Maps JSON-RPC requests onto pool operations.
///
/// Stateless per request apart from the `initialized` flag; tool calls made
/// before `initialize` are served normally.
pub struct Dispatcher {
    pool: Pool,
    identity: ServerIdentity,
    auth: AuthPolicy,
    initialized: AtomicBool,
}

impl Dispatcher {
    pub fn new(pool: Pool, identity: ServerIdentity, auth: AuthPolicy) -> Self {
        Self {
            pool,
            identity,
            auth,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Handle one framed message. Returns `None` for notifications.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => return Some(JsonRpcResponse::parse_error(e)),
        };
        match JsonRpcRequest::from_value(value) {
            Ok(request) => self.dispatch(request).await,
            Err(response) => Some(*response),
        }
    }

    pub async fn dispatch(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone().unwrap_or(Value::Null);
        tracing::debug!(method = %request.method, notification = request.is_notification(), "request");

        let response = match request.method.as_str() {
            "initialize" => self.initialize(id, &request),
            "notifications/initialized" | "initialized" => {
                self.initialized.store(true, Ordering::Release);
                JsonRpcResponse::success(id, json!({}))
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(id, tools::list_tools_payload()),
            "tools/call" => self.tools_call(id, &request).await,
            method if method.starts_with("notifications/") => {
                tracing::debug!(method, "ignoring notification");
                return None;
            }
            other => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
        };

        if request.is_notification() {
            None
        } else {
            Some(response)
        }
    }

    fn initialize(&self, id: Value, request: &JsonRpcRequest) -> JsonRpcResponse {
        if let Some(client) = request.params.as_ref().and_then(|p| p.get("clientInfo")) {
            tracing::info!(client = %client, "client initialized");
        }
        self.initialized.store(true, Ordering::Release);
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": self.identity.name,
                    "version": self.identity.version,
                },
            }),
        )
    }

    async fn tools_call(&self, id: Value, request: &JsonRpcRequest) -> JsonRpcResponse {
        let Some(params) = request.params_object() else {
            return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected an object");
        };
        let name = match params.get("name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing tool name"),
        };
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return JsonRpcResponse::error(
                    id,
                    INVALID_PARAMS,
                    "Invalid params: arguments must be an object",
                )
            }
        };

        match self.call_tool(&name, &arguments).await {
            Ok(output) => {
                let mut metadata = Map::new();
                metadata.insert("tool".into(), json!(name));
                if let Some(conn) = output.connection_id {
                    metadata.insert("connection_id".into(), json!(conn.to_string()));
                }
                let envelope = json!({
                    "success": true,
                    "data": output.data,
                    "metadata": metadata,
                });
                let text = serde_json::to_string_pretty(&envelope).unwrap_or_default();
                JsonRpcResponse::success(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }],
                        "structuredContent": envelope,
                        "isError": false,
                    }),
                )
            }
            Err(e) => {
                tracing::warn!(tool = %name, kind = e.kind(), error = %e, "tool call failed");
                e.into_response(id, &name)
            }
        }
    }

    async fn call_tool(&self, name: &str, raw: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let schema = tools::find_tool(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args = schema.validate(raw)?;
        tracing::debug!(tool = name, "tool call");

        match name {
            tools::SSH_CONNECT => self.ssh_connect(&args).await,
            tools::SSH_EXECUTE => self.ssh_execute(&args).await,
            tools::SSH_READ_FILE => self.ssh_read_file(&args).await,
            tools::SSH_WRITE_FILE => self.ssh_write_file(&args).await,
            tools::SSH_LIST_DIRECTORY => self.ssh_list_directory(&args).await,
            tools::SSH_DISCONNECT => self.ssh_disconnect(&args).await,
            tools::SSH_LIST_CONNECTIONS => Ok(self.ssh_list_connections()),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    // ── Tool handlers ──────────────────────────────────────────────

    async fn ssh_connect(&self, args: &ToolArguments) -> Result<ToolOutput, ToolError> {
        let method: AuthMethod = args.str("auth_method").unwrap_or("agent").parse()?;
        if !self.auth.allows(method) {
            return Err(ToolError::AuthDisabled(method));
        }

        let config = ConnectionConfig::new(ConnectionParams {
            hostname: required_str(args, "hostname")?.to_string(),
            username: required_str(args, "username")?.to_string(),
            port: args.integer("port").unwrap_or(DEFAULT_PORT),
            auth_method: method.as_str().to_string(),
            key_path: args.str("key_path").map(str::to_string),
            password: args.str("password").map(str::to_string),
            timeout: args.integer("timeout").unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        })?;

        let id = self.pool.create_connection(config).await?;
        let info = self.pool.connection_info(id)?;
        let mut data = connection_info_json(&info);
        data["status"] = json!("connected");
        Ok(ToolOutput::for_connection(data, id))
    }

    async fn ssh_execute(&self, args: &ToolArguments) -> Result<ToolOutput, ToolError> {
        let id = connection_id(args)?;
        let command = required_str(args, "command")?;
        let timeout = args
            .integer("timeout")
            .and_then(|secs| u64::try_from(secs).ok())
            .map(Duration::from_secs);

        let result = self.pool.execute_command(id, command, timeout).await?;
        let data = json!({
            "stdout": result.stdout(),
            "stderr": result.stderr(),
            "exit_code": result.exit_code(),
            "success": result.succeeded(),
            "execution_time": result.execution_time().as_secs_f64(),
            "command": result.command(),
            "timestamp": timestamp(result.timestamp()),
            "has_output": result.has_output(),
        });
        Ok(ToolOutput::for_connection(data, id))
    }

    async fn ssh_read_file(&self, args: &ToolArguments) -> Result<ToolOutput, ToolError> {
        let id = connection_id(args)?;
        let path = required_str(args, "file_path")?;
        let (encoding_name, encoding) = encoding(args)?;

        let file = self.pool.read_file(id, path, encoding).await?;
        let lines = if file.content.is_empty() {
            0
        } else {
            file.content.matches('\n').count() + 1
        };
        let data = json!({
            "content": file.content,
            "file_path": path,
            "encoding": encoding_name,
            "size": file.size,
            "lines": lines,
        });
        Ok(ToolOutput::for_connection(data, id))
    }

    async fn ssh_write_file(&self, args: &ToolArguments) -> Result<ToolOutput, ToolError> {
        let id = connection_id(args)?;
        let path = required_str(args, "file_path")?;
        let content = required_str(args, "content")?;
        let (encoding_name, encoding) = encoding(args)?;
        let create_dirs = args.boolean("create_dirs").unwrap_or(false);

        let written = self
            .pool
            .write_file(id, path, content, encoding, create_dirs)
            .await?;
        let data = json!({
            "file_path": path,
            "bytes_written": written,
            "encoding": encoding_name,
            "create_dirs": create_dirs,
            "status": "success",
        });
        Ok(ToolOutput::for_connection(data, id))
    }

    async fn ssh_list_directory(&self, args: &ToolArguments) -> Result<ToolOutput, ToolError> {
        let id = connection_id(args)?;
        let path = required_str(args, "directory_path")?;
        let show_hidden = args.boolean("show_hidden").unwrap_or(false);
        let detailed = args.boolean("detailed").unwrap_or(false);

        let mut entries = self.pool.list_directory(id, path).await?;
        if !show_hidden {
            entries.retain(|e| !e.is_hidden());
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let rendered: Vec<Value> = entries.iter().map(|e| dir_entry_json(e, detailed)).collect();

        let data = json!({
            "directory_path": path,
            "total_entries": rendered.len(),
            "entries": rendered,
            "show_hidden": show_hidden,
            "detailed": detailed,
        });
        Ok(ToolOutput::for_connection(data, id))
    }

    async fn ssh_disconnect(&self, args: &ToolArguments) -> Result<ToolOutput, ToolError> {
        let id = connection_id(args)?;
        if !self.pool.disconnect_connection(id).await {
            return Err(PoolError::NotFound(id).into());
        }
        Ok(ToolOutput::for_connection(
            json!({ "connection_id": id.to_string(), "status": "disconnected" }),
            id,
        ))
    }

    fn ssh_list_connections(&self) -> ToolOutput {
        let connections: Vec<Value> = self
            .pool
            .list_connections()
            .iter()
            .map(connection_info_json)
            .collect();
        ToolOutput::new(json!({
            "total": connections.len(),
            "connections": connections,
        }))
    }
}

// ---------------------------------------------------------------------------
// Rendering helpers
// ---------------------------------------------------------------------------

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn connection_info_json(info: &ConnectionInfo) -> Value {
    json!({
        "connection_id": info.connection_id.to_string(),
        "hostname": info.hostname,
        "username": info.username,
        "port": info.port,
        "connected": info.connected,
        "created_at": timestamp(info.created_at),
        "last_used": timestamp(info.last_used),
    })
}

fn dir_entry_json(entry: &DirEntry, detailed: bool) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), json!(entry.name));
    obj.insert("type".into(), json!(entry.kind));
    if detailed {
        obj.insert("size".into(), json!(entry.size));
        obj.insert(
            "permissions".into(),
            json!(entry.permissions.map(|p| format!("{:03o}", p & 0o777))),
        );
        obj.insert("modified".into(), json!(entry.modified.map(timestamp)));
        obj.insert("owner_id".into(), json!(entry.uid));
        obj.insert("group_id".into(), json!(entry.gid));
    }
    Value::Object(obj)
}

fn required_str<'a>(args: &'a ToolArguments, name: &str) -> Result<&'a str, ToolError> {
    args.str(name)
        .ok_or_else(|| ValidationError::Missing(name.to_string()).into())
}

/// Connection ids are UUIDs; anything else cannot name a registered session.
fn connection_id(args: &ToolArguments) -> Result<Uuid, ToolError> {
    let raw = required_str(args, "connection_id")?;
    Uuid::parse_str(raw.trim()).map_err(|_| ToolError::UnknownConnection(raw.to_string()))
}

fn encoding(args: &ToolArguments) -> Result<(String, FileEncoding), ToolError> {
    let name = args.str("encoding").unwrap_or("utf-8");
    let parsed = name
        .parse()
        .map_err(|_| ToolError::UnsupportedEncoding(name.to_string()))?;
    Ok((name.to_string(), parsed))
}
