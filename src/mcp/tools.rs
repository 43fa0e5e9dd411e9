// Tool catalog and argument validation

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::model::ENCODING_NAMES;

pub const SSH_CONNECT: &str = "ssh_connect";
pub const SSH_EXECUTE: &str = "ssh_execute";
pub const SSH_READ_FILE: &str = "ssh_read_file";
pub const SSH_WRITE_FILE: &str = "ssh_write_file";
pub const SSH_LIST_DIRECTORY: &str = "ssh_list_directory";
pub const SSH_DISCONNECT: &str = "ssh_disconnect";
pub const SSH_LIST_CONNECTIONS: &str = "ssh_list_connections";

/// Characters that cannot appear in a login name.
pub const USERNAME_PATTERN: &str = r"^[^\s:/@]+$";

// ── Schema types ───────────────────────────────────────────────────

/// Semantic type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamType {
    pub fn json_type(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        }
    }
}

/// A validated, typed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
}

impl ParamValue {
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::String(s) => Value::String(s.clone()),
            ParamValue::Integer(i) => json!(i),
            ParamValue::Number(n) => json!(n),
            ParamValue::Boolean(b) => Value::Bool(*b),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(i) => Some(*i as f64),
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::String(s) => f.write_str(s),
            ParamValue::Integer(i) => write!(f, "{i}"),
            ParamValue::Number(n) => f.write_str(&format_number(*n)),
            ParamValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Declarative description of one tool parameter.
#[derive(Debug, Clone)]
pub struct ParameterSchema {
    pub name: &'static str,
    pub kind: ParamType,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<ParamValue>,
    pub allowed: Option<&'static [&'static str]>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub pattern: Option<&'static str>,
}

impl ParameterSchema {
    pub fn required(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: true,
            default: None,
            allowed: None,
            minimum: None,
            maximum: None,
            pattern: None,
        }
    }

    pub fn optional(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn default(mut self, value: ParamValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }

    pub fn range(mut self, minimum: f64, maximum: f64) -> Self {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
        self
    }

    pub fn pattern(mut self, pattern: &'static str) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// JSON Schema fragment for this parameter.
    pub fn to_json_schema(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.kind.json_type()));
        schema.insert("description".into(), json!(self.description));
        if let Some(allowed) = self.allowed {
            schema.insert("enum".into(), json!(allowed));
        }
        if let Some(min) = self.minimum {
            schema.insert("minimum".into(), number_json(min));
        }
        if let Some(max) = self.maximum {
            schema.insert("maximum".into(), number_json(max));
        }
        if let Some(pattern) = self.pattern {
            schema.insert("pattern".into(), json!(pattern));
        }
        if let Some(default) = &self.default {
            schema.insert("default".into(), default.to_json());
        }
        Value::Object(schema)
    }

    /// Validate one raw value: default substitution, type coercion, then
    /// enum, range and pattern constraints in that order.
    ///
    /// Returns `Ok(None)` for an absent optional parameter with no default.
    pub fn validate(&self, raw: Option<&Value>) -> Result<Option<ParamValue>, ValidationError> {
        let raw = match raw {
            None | Some(Value::Null) => {
                if self.required {
                    return Err(ValidationError::Missing(self.name.to_string()));
                }
                return Ok(self.default.clone());
            }
            Some(value) => value,
        };

        let value = match self.kind {
            ParamType::String => coerce_string(raw),
            ParamType::Integer => coerce_integer(raw),
            ParamType::Number => coerce_number(raw),
            ParamType::Boolean => coerce_boolean(raw),
        }
        .map_err(|reason| ValidationError::InvalidType {
            name: self.name.to_string(),
            reason,
        })?;

        self.check_constraints(&value)?;
        Ok(Some(value))
    }

    fn check_constraints(&self, value: &ParamValue) -> Result<(), ValidationError> {
        if let (Some(allowed), ParamValue::String(s)) = (self.allowed, value) {
            if !allowed.contains(&s.as_str()) {
                return Err(ValidationError::NotAllowed {
                    name: self.name.to_string(),
                    allowed: allowed.join(", "),
                    value: s.clone(),
                });
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum.filter(|min| n < *min) {
                return Err(ValidationError::BelowMinimum {
                    name: self.name.to_string(),
                    minimum: format_number(min),
                    value: value.to_string(),
                });
            }
            if let Some(max) = self.maximum.filter(|max| n > *max) {
                return Err(ValidationError::AboveMaximum {
                    name: self.name.to_string(),
                    maximum: format_number(max),
                    value: value.to_string(),
                });
            }
        }

        if let (Some(pattern), ParamValue::String(s)) = (self.pattern, value) {
            let re = Regex::new(pattern).map_err(|e| ValidationError::InvalidType {
                name: self.name.to_string(),
                reason: format!("unusable pattern '{pattern}': {e}"),
            })?;
            if !re.is_match(s) {
                return Err(ValidationError::PatternMismatch {
                    name: self.name.to_string(),
                    pattern: pattern.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Name, description and ordered parameters of one tool.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Vec<ParameterSchema>,
}

impl ToolSchema {
    /// The `tools/list` entry for this tool.
    pub fn to_mcp_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(param.name.to_string(), param.to_json_schema());
            if param.required {
                required.push(param.name);
            }
        }
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        })
    }

    /// Validate a whole argument map, then reject names the schema does not
    /// declare.
    pub fn validate(&self, raw: &Map<String, Value>) -> Result<ToolArguments, ValidationError> {
        let mut values = Vec::with_capacity(self.parameters.len());
        for param in &self.parameters {
            if let Some(value) = param.validate(raw.get(param.name))? {
                values.push((param.name, value));
            }
        }

        let mut unexpected: Vec<String> = raw
            .keys()
            .filter(|key| !self.parameters.iter().any(|p| p.name == key.as_str()))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            unexpected.sort();
            return Err(ValidationError::Unexpected(unexpected));
        }

        Ok(ToolArguments { values })
    }
}

/// Tool argument validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Required parameter '{0}' is missing")]
    Missing(String),
    #[error("Invalid type for parameter '{name}': {reason}")]
    InvalidType { name: String, reason: String },
    #[error("Parameter '{name}' must be one of [{allowed}], got '{value}'")]
    NotAllowed {
        name: String,
        allowed: String,
        value: String,
    },
    #[error("Parameter '{name}' must be >= {minimum}, got {value}")]
    BelowMinimum {
        name: String,
        minimum: String,
        value: String,
    },
    #[error("Parameter '{name}' must be <= {maximum}, got {value}")]
    AboveMaximum {
        name: String,
        maximum: String,
        value: String,
    },
    #[error("Parameter '{name}' does not match pattern '{pattern}'")]
    PatternMismatch { name: String, pattern: String },
    #[error("Unexpected parameters: {}", .0.join(", "))]
    Unexpected(Vec<String>),
}

// ── Coercion ───────────────────────────────────────────────────────

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce_string(value: &Value) -> Result<ParamValue, String> {
    match value {
        Value::String(s) => Ok(ParamValue::String(s.clone())),
        other => Err(format!("Expected string, got {}", json_kind(other))),
    }
}

fn coerce_integer(value: &Value) -> Result<ParamValue, String> {
    match value {
        Value::Bool(_) => Err("Expected integer, got boolean".into()),
        Value::Number(n) => n
            .as_i64()
            .map(ParamValue::Integer)
            .ok_or_else(|| format!("Expected integer, got {n}")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(ParamValue::Integer)
            .map_err(|_| format!("Cannot convert '{s}' to integer")),
        other => Err(format!("Expected integer, got {}", json_kind(other))),
    }
}

fn coerce_number(value: &Value) -> Result<ParamValue, String> {
    match value {
        Value::Bool(_) => Err("Expected number, got boolean".into()),
        Value::Number(n) => n
            .as_f64()
            .map(ParamValue::Number)
            .ok_or_else(|| format!("Cannot convert '{n}' to number")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(ParamValue::Number)
            .ok_or_else(|| format!("Cannot convert '{s}' to number")),
        other => Err(format!("Expected number, got {}", json_kind(other))),
    }
}

fn coerce_boolean(value: &Value) -> Result<ParamValue, String> {
    match value {
        Value::Bool(b) => Ok(ParamValue::Boolean(*b)),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(ParamValue::Boolean(true)),
            "false" | "0" | "no" | "off" => Ok(ParamValue::Boolean(false)),
            _ => Err(format!("Cannot convert '{s}' to boolean")),
        },
        other => Err(format!("Expected boolean, got {}", json_kind(other))),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn number_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

// ── Validated arguments ────────────────────────────────────────────

/// Fully typed, fully defaulted arguments for one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolArguments {
    values: Vec<(&'static str, ParamValue)>,
}

impl ToolArguments {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(ParamValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(ParamValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(ParamValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// JSON object form; validating it again yields the same arguments.
    pub fn to_json(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect()
    }
}

// ── Catalog ────────────────────────────────────────────────────────

fn connection_id_param(description: &'static str) -> ParameterSchema {
    ParameterSchema::required("connection_id", ParamType::String, description)
}

fn encoding_param(description: &'static str) -> ParameterSchema {
    ParameterSchema::optional("encoding", ParamType::String, description)
        .default(ParamValue::String("utf-8".into()))
        .one_of(ENCODING_NAMES)
}

fn build_catalog() -> Vec<ToolSchema> {
    use ParamType::*;

    vec![
        ToolSchema {
            name: SSH_CONNECT,
            description: "Establish an SSH connection to a remote server",
            parameters: vec![
                ParameterSchema::required("hostname", String, "The hostname or IP address of the SSH server"),
                ParameterSchema::required("username", String, "The username for SSH authentication")
                    .pattern(USERNAME_PATTERN),
                ParameterSchema::optional("port", Integer, "The SSH port number")
                    .default(ParamValue::Integer(22))
                    .range(1.0, 65535.0),
                ParameterSchema::optional("auth_method", String, "Authentication method to use")
                    .default(ParamValue::String("agent".into()))
                    .one_of(&["key", "password", "agent"]),
                ParameterSchema::optional("key_path", String, "Path to SSH private key file (required for 'key' auth)"),
                ParameterSchema::optional("password", String, "Password for authentication (required for 'password' auth)"),
                ParameterSchema::optional("timeout", Integer, "Connection timeout in seconds")
                    .default(ParamValue::Integer(30))
                    .range(1.0, 300.0),
            ],
        },
        ToolSchema {
            name: SSH_EXECUTE,
            description: "Execute a command on a remote server via SSH",
            parameters: vec![
                connection_id_param("The ID of the SSH connection to use"),
                ParameterSchema::required("command", String, "The command to execute on the remote server"),
                ParameterSchema::optional("timeout", Integer, "Command execution timeout in seconds")
                    .default(ParamValue::Integer(60))
                    .range(1.0, 3600.0),
            ],
        },
        ToolSchema {
            name: SSH_READ_FILE,
            description: "Read the contents of a file on a remote server",
            parameters: vec![
                connection_id_param("The ID of the SSH connection to use"),
                ParameterSchema::required("file_path", String, "The path to the file to read on the remote server"),
                encoding_param("Encoding used to decode the file (base64 returns raw bytes encoded)"),
            ],
        },
        ToolSchema {
            name: SSH_WRITE_FILE,
            description: "Write content to a file on a remote server",
            parameters: vec![
                connection_id_param("The ID of the SSH connection to use"),
                ParameterSchema::required("file_path", String, "The path to the file to write on the remote server"),
                ParameterSchema::required("content", String, "The content to write to the file"),
                encoding_param("Encoding used to turn the content into bytes (base64 decodes binary content)"),
                ParameterSchema::optional("create_dirs", Boolean, "Whether to create parent directories if they don't exist")
                    .default(ParamValue::Boolean(false)),
            ],
        },
        ToolSchema {
            name: SSH_LIST_DIRECTORY,
            description: "List the contents of a directory on a remote server",
            parameters: vec![
                connection_id_param("The ID of the SSH connection to use"),
                ParameterSchema::required("directory_path", String, "The path to the directory to list"),
                ParameterSchema::optional("show_hidden", Boolean, "Whether to include hidden files (starting with .)")
                    .default(ParamValue::Boolean(false)),
                ParameterSchema::optional("detailed", Boolean, "Whether to include detailed file information (permissions, size, etc.)")
                    .default(ParamValue::Boolean(false)),
            ],
        },
        ToolSchema {
            name: SSH_DISCONNECT,
            description: "Disconnect an SSH connection",
            parameters: vec![connection_id_param("The ID of the SSH connection to disconnect")],
        },
        ToolSchema {
            name: SSH_LIST_CONNECTIONS,
            description: "List all active SSH connections",
            parameters: vec![],
        },
    ]
}

/// Every tool, in registration order.
pub fn catalog() -> &'static [ToolSchema] {
    static CATALOG: OnceLock<Vec<ToolSchema>> = OnceLock::new();
    CATALOG.get_or_init(build_catalog)
}

pub fn find_tool(name: &str) -> Option<&'static ToolSchema> {
    catalog().iter().find(|tool| tool.name == name)
}

/// The `tools/list` result payload.
pub fn list_tools_payload() -> Value {
    json!({ "tools": catalog().iter().map(ToolSchema::to_mcp_schema).collect::<Vec<_>>() })
}
