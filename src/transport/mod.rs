//! Remote-shell transport abstraction.
//!
//! A [`Connector`] opens authenticated [`RemoteShell`] handles; the session
//! layer owns each handle and decides when to release it. Everything in this
//! module is blocking and is driven from `spawn_blocking` by the session.

pub mod memory;
pub mod ssh;

use std::time::Duration;

use crate::model::{AuthMethod, ConnectionConfig, DirEntry};

/// Raw output of one remote command, before the session stamps it with
/// timing and the command text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Failures reported by a transport.
///
/// Only [`TransportError::ConnectionLost`] means the handle is dead; every
/// other variant leaves it usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("authentication failed using {method} method: {detail}")]
    Auth { method: AuthMethod, detail: String },
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// True when the underlying handle can no longer be used.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_))
    }
}

/// One authenticated remote-shell handle.
///
/// Implementations need not be safe for concurrent use: the session holds an
/// exclusive lock around every call. Every call that touches the network is
/// bounded by the timeout it is given.
pub trait RemoteShell: Send {
    /// Run `command` and collect both streams and the exit status.
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError>;

    fn read_file(&mut self, path: &str, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Create or truncate `path` and write `content` to it.
    fn write_file(
        &mut self,
        path: &str,
        content: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Create `path` and any missing parents.
    fn create_dir_all(&mut self, path: &str, timeout: Duration) -> Result<(), TransportError>;

    /// List `path`, excluding `.` and `..`.
    fn list_dir(&mut self, path: &str, timeout: Duration) -> Result<Vec<DirEntry>, TransportError>;

    /// Release the handle. Must not block indefinitely on an unresponsive
    /// peer.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens [`RemoteShell`] handles: TCP connect, handshake, authentication.
pub trait Connector: Send + Sync {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn RemoteShell>, TransportError>;
}

/// Parent directory of a slash-separated remote path, if it has one.
pub(crate) fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}
