//! Plain data types shared by the session, pool, and dispatch layers.
//!
//! Everything here is validated on construction: a [`ConnectionConfig`] that
//! exists is one the transport can be handed without further checks.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default SSH port.
pub const DEFAULT_PORT: i64 = 22;
/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: i64 = 30;

// ── Connection configuration ───────────────────────────────────────

/// Why a [`ConnectionConfig`] was rejected.
///
/// Exactly one reason is reported per rejected configuration; checks run in
/// field order (hostname, username, port, auth method, timeout, credentials).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("hostname cannot be empty")]
    EmptyHostname,
    #[error("invalid hostname format: {0}")]
    InvalidHostname(String),
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("port must be between 1 and 65535, got {0}")]
    PortOutOfRange(i64),
    #[error("invalid auth_method '{0}', must be one of: key, password, agent")]
    UnknownAuthMethod(String),
    #[error("timeout must be a positive integer, got {0}")]
    InvalidTimeout(i64),
    #[error("{field} is required when auth_method is '{method}'")]
    MissingCredential {
        method: AuthMethod,
        field: &'static str,
    },
    #[error("SSH key file not found: {0}")]
    KeyNotFound(String),
}

/// Credential handshake used when opening a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Key,
    Password,
    Agent,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Key => "key",
            AuthMethod::Password => "password",
            AuthMethod::Agent => "agent",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "key" => Ok(AuthMethod::Key),
            "password" => Ok(AuthMethod::Password),
            "agent" => Ok(AuthMethod::Agent),
            other => Err(ConfigError::UnknownAuthMethod(other.to_string())),
        }
    }
}

/// Unvalidated connection parameters, as they arrive from a tool call.
///
/// Numeric fields are wide signed integers so that out-of-range input can be
/// reported precisely instead of failing to parse.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub hostname: String,
    pub username: String,
    pub port: i64,
    pub auth_method: String,
    pub key_path: Option<String>,
    pub password: Option<String>,
    pub timeout: i64,
}

impl ConnectionParams {
    /// Parameters for `username@hostname` with agent auth on port 22.
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            port: DEFAULT_PORT,
            auth_method: AuthMethod::Agent.as_str().to_string(),
            key_path: None,
            password: None,
            timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    pub fn port(mut self, port: i64) -> Self {
        self.port = port;
        self
    }

    pub fn auth_method(mut self, method: impl Into<String>) -> Self {
        self.auth_method = method.into();
        self
    }

    pub fn key_path(mut self, path: impl Into<String>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn timeout(mut self, secs: i64) -> Self {
        self.timeout = secs;
        self
    }
}

/// A validated connection configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    hostname: String,
    username: String,
    port: u16,
    auth_method: AuthMethod,
    key_path: Option<String>,
    password: Option<String>,
    timeout_secs: u64,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("port", &self.port)
            .field("auth_method", &self.auth_method)
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ConnectionConfig {
    /// Validate raw parameters. Nothing touches the network here; the only
    /// filesystem access is the existence check on a key path.
    pub fn new(params: ConnectionParams) -> Result<Self, ConfigError> {
        validate_hostname(&params.hostname)?;
        if params.username.trim().is_empty() {
            return Err(ConfigError::EmptyUsername);
        }
        let port = u16::try_from(params.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ConfigError::PortOutOfRange(params.port))?;
        let auth_method: AuthMethod = params.auth_method.parse()?;
        if params.timeout <= 0 {
            return Err(ConfigError::InvalidTimeout(params.timeout));
        }
        let timeout_secs = params.timeout as u64;

        match auth_method {
            AuthMethod::Key => {
                let path = params
                    .key_path
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or(ConfigError::MissingCredential {
                        method: auth_method,
                        field: "key_path",
                    })?;
                if !expand_home(path).exists() {
                    return Err(ConfigError::KeyNotFound(path.to_string()));
                }
            }
            AuthMethod::Password => {
                if params.password.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::MissingCredential {
                        method: auth_method,
                        field: "password",
                    });
                }
            }
            AuthMethod::Agent => {}
        }

        Ok(Self {
            hostname: params.hostname,
            username: params.username,
            port,
            auth_method,
            key_path: params.key_path,
            password: params.password,
            timeout_secs,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method
    }

    /// Key path exactly as supplied.
    pub fn key_path(&self) -> Option<&str> {
        self.key_path.as_deref()
    }

    /// Key path with a leading `~/` expanded against the local home directory.
    pub fn resolved_key_path(&self) -> Option<PathBuf> {
        self.key_path.as_deref().map(expand_home)
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `user@host:port`, for logs and error messages.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    Path::new(path).to_path_buf()
}

/// Validate a hostname: either a dotted-quad IPv4 literal with every octet in
/// 0-255, or a sequence of DNS labels.
///
/// - Must be 1-253 characters total.
/// - Each dot-separated label must be 1-63 characters.
/// - Labels may contain ASCII alphanumeric characters and hyphens.
/// - Labels must not start or end with a hyphen.
/// - No empty labels (no leading, trailing, or consecutive dots).
pub fn validate_hostname(hostname: &str) -> Result<(), ConfigError> {
    if hostname.trim().is_empty() {
        return Err(ConfigError::EmptyHostname);
    }
    if hostname.len() > 253 {
        return Err(ConfigError::InvalidHostname(format!(
            "hostname exceeds 253 characters (got {})",
            hostname.len()
        )));
    }

    let labels: Vec<&str> = hostname.split('.').collect();
    let looks_like_ipv4 = labels.len() == 4
        && labels
            .iter()
            .all(|l| !l.is_empty() && l.len() <= 3 && l.chars().all(|c| c.is_ascii_digit()));
    if looks_like_ipv4 {
        for octet in &labels {
            // At most three digits, so this cannot overflow a u16.
            let value: u16 = octet.parse().unwrap_or(u16::MAX);
            if value > 255 {
                return Err(ConfigError::InvalidHostname(format!(
                    "IPv4 octet '{}' is out of range 0-255",
                    octet
                )));
            }
        }
        return Ok(());
    }

    for label in labels {
        if label.is_empty() {
            return Err(ConfigError::InvalidHostname(
                "hostname contains empty label".into(),
            ));
        }
        if label.len() > 63 {
            return Err(ConfigError::InvalidHostname(format!(
                "label exceeds 63 characters (got {})",
                label.len()
            )));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(ConfigError::InvalidHostname(format!(
                "label '{}' must not start or end with a hyphen",
                label
            )));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ConfigError::InvalidHostname(format!(
                "label '{}' contains invalid characters",
                label
            )));
        }
    }

    Ok(())
}

// ── Connection info ────────────────────────────────────────────────

/// Identity and status of one pooled session.
///
/// Snapshots of this are handed out by the pool; the live copy is owned by
/// the session and only mutated there.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub hostname: String,
    pub username: String,
    pub port: u16,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(connection_id: Uuid, config: &ConnectionConfig) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            hostname: config.hostname().to_string(),
            username: config.username().to_string(),
            port: config.port(),
            connected: false,
            created_at: now,
            last_used: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Utc::now();
    }
}

// ── Command results ────────────────────────────────────────────────

/// Output of one remote command. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    stdout: String,
    stderr: String,
    exit_code: i32,
    execution_time: Duration,
    command: Option<String>,
    timestamp: DateTime<Utc>,
}

impl CommandResult {
    pub fn new(
        stdout: String,
        stderr: String,
        exit_code: i32,
        execution_time: Duration,
        command: Option<String>,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            execution_time,
            command,
            timestamp: Utc::now(),
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// True when the command exited with status 0.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// True when either stream has non-whitespace content.
    pub fn has_output(&self) -> bool {
        !self.stdout.trim().is_empty() || !self.stderr.trim().is_empty()
    }
}

// ── Directory listings ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    /// Permission bits (`st_mode & 0o7777`).
    pub permissions: Option<u32>,
    pub modified: Option<DateTime<Utc>>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl DirEntry {
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

// ── File encodings ─────────────────────────────────────────────────

/// How file content is converted between remote bytes and tool-call text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEncoding {
    Utf8,
    Ascii,
    Latin1,
    /// Binary content carried as standard base64 text.
    Base64,
}

/// Encoding names accepted by the file tools.
pub const ENCODING_NAMES: &[&str] = &["utf-8", "utf8", "ascii", "latin-1", "base64"];

impl FromStr for FileEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(FileEncoding::Utf8),
            "ascii" => Ok(FileEncoding::Ascii),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(FileEncoding::Latin1),
            "base64" => Ok(FileEncoding::Base64),
            other => Err(format!("unsupported encoding '{other}'")),
        }
    }
}

impl FileEncoding {
    /// Decode remote bytes into tool-call text.
    pub fn decode(&self, bytes: &[u8]) -> Result<String, String> {
        match self {
            FileEncoding::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| format!("invalid utf-8: {e}")),
            FileEncoding::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(pos) => Err(format!("non-ascii byte 0x{:02x} at offset {}", bytes[pos], pos)),
                None => Ok(bytes.iter().map(|&b| b as char).collect()),
            },
            FileEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
            FileEncoding::Base64 => Ok(base64::engine::general_purpose::STANDARD.encode(bytes)),
        }
    }

    /// Encode tool-call text into the bytes written remotely.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, String> {
        match self {
            FileEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            FileEncoding::Ascii => text
                .chars()
                .map(|c| {
                    if c.is_ascii() {
                        Ok(c as u8)
                    } else {
                        Err(format!("character '{c}' cannot be encoded as ascii"))
                    }
                })
                .collect(),
            FileEncoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c))
                        .map_err(|_| format!("character '{c}' cannot be encoded as latin-1"))
                })
                .collect(),
            FileEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| format!("invalid base64: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectionParams {
        ConnectionParams::new("example.com", "deploy")
    }

    #[test]
    fn valid_config_round_trips_fields() {
        let config = ConnectionConfig::new(
            params().port(2222).auth_method("password").password("s3cret").timeout(45),
        )
        .unwrap();
        assert_eq!(config.hostname(), "example.com");
        assert_eq!(config.username(), "deploy");
        assert_eq!(config.port(), 2222);
        assert_eq!(config.auth_method(), AuthMethod::Password);
        assert_eq!(config.password(), Some("s3cret"));
        assert_eq!(config.key_path(), None);
        assert_eq!(config.timeout_secs(), 45);
    }

    #[test]
    fn key_config_keeps_supplied_path() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let path = key.path().to_str().unwrap().to_string();
        let config =
            ConnectionConfig::new(params().auth_method("key").key_path(path.clone())).unwrap();
        assert_eq!(config.key_path(), Some(path.as_str()));
        assert_eq!(config.resolved_key_path(), Some(PathBuf::from(&path)));
    }

    #[test]
    fn each_invalid_field_reports_one_reason() {
        let cases = vec![
            (ConnectionParams::new("", "u"), ConfigError::EmptyHostname),
            (ConnectionParams::new("   ", "u"), ConfigError::EmptyHostname),
            (ConnectionParams::new("h.com", " "), ConfigError::EmptyUsername),
            (params().port(0), ConfigError::PortOutOfRange(0)),
            (params().port(65536), ConfigError::PortOutOfRange(65536)),
            (params().port(-1), ConfigError::PortOutOfRange(-1)),
            (
                params().auth_method("kerberos"),
                ConfigError::UnknownAuthMethod("kerberos".into()),
            ),
            (params().timeout(0), ConfigError::InvalidTimeout(0)),
            (params().timeout(-5), ConfigError::InvalidTimeout(-5)),
            (
                params().auth_method("key"),
                ConfigError::MissingCredential {
                    method: AuthMethod::Key,
                    field: "key_path",
                },
            ),
            (
                params().auth_method("password"),
                ConfigError::MissingCredential {
                    method: AuthMethod::Password,
                    field: "password",
                },
            ),
            (
                params().auth_method("key").key_path("/definitely/not/here/id_rsa"),
                ConfigError::KeyNotFound("/definitely/not/here/id_rsa".into()),
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(ConnectionConfig::new(input.clone()).unwrap_err(), expected, "{input:?}");
        }
    }

    #[test]
    fn hostname_rules() {
        for ok in ["localhost", "server1.com", "a-b.example.org", "192.168.1.100", "0.0.0.0", "1.2.3"] {
            assert!(validate_hostname(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["256.1.1.1", "192.168.1.999", "a..b", ".example.com", "example.com.", "-a.com", "a-.com", "under_score.com", "sp ace.com"] {
            assert!(
                matches!(validate_hostname(bad), Err(ConfigError::InvalidHostname(_))),
                "{bad} should be rejected"
            );
        }
        let long_label = "a".repeat(64);
        assert!(validate_hostname(&long_label).is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let config =
            ConnectionConfig::new(params().auth_method("password").password("hunter2")).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn command_result_derived_properties() {
        let ok = CommandResult::new("hi\n".into(), String::new(), 0, Duration::from_millis(5), None);
        assert!(ok.succeeded());
        assert!(ok.has_output());

        let quiet = CommandResult::new("  \n".into(), "\t".into(), 2, Duration::ZERO, Some("false".into()));
        assert!(!quiet.succeeded());
        assert!(!quiet.has_output());
        assert_eq!(quiet.command(), Some("false"));
    }

    #[test]
    fn connection_info_serializes_iso_timestamps() {
        let config = ConnectionConfig::new(params()).unwrap();
        let info = ConnectionInfo::new(Uuid::new_v4(), &config);
        let json = serde_json::to_value(&info).unwrap();
        let created = json["created_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(created).is_ok(), "{created}");
        assert_eq!(json["port"], 22);
        assert_eq!(json["connected"], false);
    }

    #[test]
    fn encodings_convert_both_ways() {
        let utf8 = FileEncoding::from_str("UTF-8").unwrap();
        assert_eq!(utf8.encode("héllo").unwrap(), "héllo".as_bytes());
        assert!(utf8.decode(&[0xff, 0xfe]).is_err());

        let latin1: FileEncoding = "latin-1".parse().unwrap();
        assert_eq!(latin1.encode("é").unwrap(), vec![0xe9]);
        assert_eq!(latin1.decode(&[0xe9]).unwrap(), "é");
        assert!(latin1.encode("€").is_err());

        let ascii: FileEncoding = "ascii".parse().unwrap();
        assert!(ascii.decode(b"plain").is_ok());
        assert!(ascii.decode(&[0x80]).is_err());

        let b64: FileEncoding = "base64".parse().unwrap();
        assert_eq!(b64.decode(&[0, 1, 2]).unwrap(), "AAEC");
        assert_eq!(b64.encode("AAEC").unwrap(), vec![0, 1, 2]);

        assert!("ebcdic".parse::<FileEncoding>().is_err());
    }
}
