use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::model::{
    AuthMethod, CommandResult, ConnectionConfig, ConnectionInfo, DirEntry, FileEncoding,
};
use crate::transport::{Connector, RemoteShell, TransportError};

/// Command used to probe a connection.
pub const HEALTH_CHECK_COMMAND: &str = "echo 'health_check'";
const HEALTH_CHECK_MARKER: &str = "health_check";

/// Retry behaviour for [`Session::reconnect`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Whether the health sweep tries to recover dropped sessions before
    /// evicting them. Explicit reconnects ignore this flag.
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff_multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            delay: Duration::from_secs(5),
            backoff_multiplier: 2,
        }
    }
}

/// Timeouts and health thresholds applied to every session in a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    /// Timeout for commands that do not specify one, and for file operations.
    pub command_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// Consecutive failed health checks that force a disconnect.
    pub max_health_check_failures: u32,
    /// Slack added on top of an operation's timeout before the session stops
    /// waiting on the transport thread.
    pub operation_grace: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(10),
            max_health_check_failures: 3,
            operation_grace: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Errors from a single session. Every variant carries the session id.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection {id} is not connected")]
    NotConnected { id: Uuid },
    #[error("command cannot be empty")]
    EmptyCommand { id: Uuid },
    #[error("authentication failed for {target} using {method} method: {detail}")]
    Auth {
        id: Uuid,
        target: String,
        method: AuthMethod,
        detail: String,
    },
    #[error("connection error: {source}")]
    Connection {
        id: Uuid,
        #[source]
        source: TransportError,
    },
    #[error("operation timed out after {}s", timeout.as_secs())]
    Timeout { id: Uuid, timeout: Duration },
    #[error("file operation failed for {path}: {source}")]
    File {
        id: Uuid,
        path: String,
        #[source]
        source: TransportError,
    },
    #[error("encoding error for {path}: {detail}")]
    Encoding {
        id: Uuid,
        path: String,
        detail: String,
    },
    #[error("failed to reconnect after {attempts} attempts: {last}")]
    ReconnectFailed {
        id: Uuid,
        attempts: u32,
        #[source]
        last: Box<SessionError>,
    },
}

impl SessionError {
    pub fn id(&self) -> Uuid {
        match self {
            SessionError::NotConnected { id }
            | SessionError::EmptyCommand { id }
            | SessionError::Auth { id, .. }
            | SessionError::Connection { id, .. }
            | SessionError::Timeout { id, .. }
            | SessionError::File { id, .. }
            | SessionError::Encoding { id, .. }
            | SessionError::ReconnectFailed { id, .. } => *id,
        }
    }
}

/// Decoded file content plus its size on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub content: String,
    pub size: usize,
}

/// Read-only snapshot of a session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub connection_id: Uuid,
    pub hostname: String,
    pub username: String,
    pub port: u16,
    pub auth_method: AuthMethod,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub connection_duration_secs: Option<f64>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_check_failures: u32,
    pub reconnect_attempts: u32,
    pub commands_executed: u64,
    pub connection_lost: bool,
}

type SharedShell = Arc<Mutex<Box<dyn RemoteShell>>>;

/// How an operation acquires the transport handle.
#[derive(Debug, Clone, Copy)]
enum Access {
    /// Queue behind whatever operation holds the handle.
    Wait,
    /// Give up immediately when the handle is held.
    IfIdle,
}

struct SessionState {
    info: ConnectionInfo,
    /// Present exactly when `info.connected` is true.
    shell: Option<SharedShell>,
    connected_at: Option<(Instant, DateTime<Utc>)>,
    last_health_check: Option<(Instant, DateTime<Utc>)>,
    health_check_failures: u32,
    reconnect_attempts: u32,
    commands_executed: u64,
    connection_lost: bool,
}

/// One remote-shell connection and its runtime state.
///
/// Field mutations happen under a short-lived state lock. Transport calls
/// hold the handle's own lock, so operations against one session run one at
/// a time while reads of its state stay non-blocking.
pub struct Session {
    id: Uuid,
    config: ConnectionConfig,
    policy: SessionPolicy,
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    /// Serializes connect, disconnect and reconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.config.target())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A new, disconnected session.
    pub fn new(
        id: Uuid,
        config: ConnectionConfig,
        policy: SessionPolicy,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let info = ConnectionInfo::new(id, &config);
        Self {
            id,
            config,
            policy,
            connector,
            state: Mutex::new(SessionState {
                info,
                shell: None,
                connected_at: None,
                last_health_check: None,
                health_check_failures: 0,
                reconnect_attempts: 0,
                commands_executed: 0,
                connection_lost: false,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().info.connected
    }

    /// True when the transport dropped underneath the session, as opposed to
    /// an explicit or health-check disconnect.
    pub fn connection_lost(&self) -> bool {
        self.state.lock().connection_lost
    }

    pub fn info(&self) -> ConnectionInfo {
        self.state.lock().info.clone()
    }

    pub fn health_check_failures(&self) -> u32 {
        self.state.lock().health_check_failures
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Open the transport and authenticate. No-op when already connected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        let limit = self.config.timeout() + self.policy.operation_grace;
        let task = tokio::task::spawn_blocking(move || connector.open(&config));
        let opened = match tokio::time::timeout(limit, task).await {
            Err(_) => Err(TransportError::Timeout(self.config.timeout())),
            Ok(Err(join)) => Err(TransportError::Other(format!("connect task failed: {join}"))),
            Ok(Ok(result)) => result,
        };

        match opened {
            Ok(shell) => {
                let mut state = self.state.lock();
                let now = Utc::now();
                state.shell = Some(Arc::new(Mutex::new(shell)));
                state.info.connected = true;
                state.info.last_used = now;
                state.connected_at = Some((Instant::now(), now));
                state.health_check_failures = 0;
                state.connection_lost = false;
                drop(state);
                tracing::info!(connection = %self.id, target = %self.config.target(), "connected");
                Ok(())
            }
            Err(TransportError::Auth { method, detail }) => {
                tracing::warn!(connection = %self.id, target = %self.config.target(), %method, "authentication failed");
                Err(SessionError::Auth {
                    id: self.id,
                    target: self.config.target(),
                    method,
                    detail,
                })
            }
            Err(TransportError::Timeout(timeout)) => Err(SessionError::Timeout {
                id: self.id,
                timeout,
            }),
            Err(source) => {
                tracing::warn!(connection = %self.id, target = %self.config.target(), error = %source, "connect failed");
                Err(SessionError::Connection {
                    id: self.id,
                    source,
                })
            }
        }
    }

    /// Close the transport and mark the session disconnected. Idempotent;
    /// close failures are logged and swallowed.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let shell = {
            let mut state = self.state.lock();
            let shell = state.shell.take();
            state.info.connected = false;
            state.connected_at = None;
            state.last_health_check = None;
            shell
        };
        if let Some(shell) = shell {
            self.release(shell).await;
            tracing::info!(connection = %self.id, target = %self.config.target(), "disconnected");
        }
    }

    /// Drop any current handle and retry `connect` with exponential backoff.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.disconnect().await;

        let policy = &self.policy.reconnect;
        let attempts = policy.max_attempts.max(1);
        let mut delay = policy.delay;
        let mut last = None;
        for attempt in 1..=attempts {
            self.state.lock().reconnect_attempts += 1;
            match self.connect().await {
                Ok(()) => {
                    tracing::info!(connection = %self.id, attempt, "reconnected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(connection = %self.id, attempt, error = %e, "reconnect attempt failed");
                    last = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(policy.backoff_multiplier.max(1));
            }
        }

        Err(SessionError::ReconnectFailed {
            id: self.id,
            attempts,
            last: Box::new(last.unwrap_or(SessionError::NotConnected { id: self.id })),
        })
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Run `command`, waiting at most `timeout` (or the policy default).
    pub async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, SessionError> {
        let shell = self.shell()?;
        if command.trim().is_empty() {
            return Err(SessionError::EmptyCommand { id: self.id });
        }
        let timeout = timeout.unwrap_or(self.policy.command_timeout);

        let started = Instant::now();
        let owned = command.to_string();
        let output = self
            .run(&shell, timeout, move |sh| sh.exec(&owned, timeout))
            .await
            .map_err(|e| self.classify(e))?;
        let elapsed = started.elapsed();

        {
            let mut state = self.state.lock();
            state.info.touch();
            state.commands_executed += 1;
        }
        tracing::debug!(connection = %self.id, exit_code = output.exit_code, elapsed_ms = elapsed.as_millis() as u64, "command finished");

        Ok(CommandResult::new(
            output.stdout,
            output.stderr,
            output.exit_code,
            elapsed,
            Some(command.to_string()),
        ))
    }

    pub async fn read_file(
        &self,
        path: &str,
        encoding: FileEncoding,
    ) -> Result<FileContent, SessionError> {
        let shell = self.shell()?;
        let owned = path.to_string();
        let timeout = self.policy.command_timeout;
        let bytes = self
            .run(&shell, timeout, move |sh| sh.read_file(&owned, timeout))
            .await
            .map_err(|e| self.classify_file(path, e))?;
        let content = encoding.decode(&bytes).map_err(|detail| SessionError::Encoding {
            id: self.id,
            path: path.to_string(),
            detail,
        })?;
        self.state.lock().info.touch();
        Ok(FileContent {
            content,
            size: bytes.len(),
        })
    }

    /// Write `content` to `path`, returning the number of bytes written.
    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        encoding: FileEncoding,
        create_dirs: bool,
    ) -> Result<usize, SessionError> {
        let shell = self.shell()?;
        let bytes = encoding.encode(content).map_err(|detail| SessionError::Encoding {
            id: self.id,
            path: path.to_string(),
            detail,
        })?;
        let written = bytes.len();
        let owned = path.to_string();
        let timeout = self.policy.command_timeout;
        self.run(&shell, timeout, move |sh| {
            if create_dirs {
                if let Some(parent) = crate::transport::remote_parent(&owned) {
                    sh.create_dir_all(parent, timeout)?;
                }
            }
            sh.write_file(&owned, &bytes, timeout)
        })
        .await
        .map_err(|e| self.classify_file(path, e))?;
        self.state.lock().info.touch();
        Ok(written)
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, SessionError> {
        let shell = self.shell()?;
        let owned = path.to_string();
        let timeout = self.policy.command_timeout;
        let entries = self
            .run(&shell, timeout, move |sh| sh.list_dir(&owned, timeout))
            .await
            .map_err(|e| self.classify_file(path, e))?;
        self.state.lock().info.touch();
        Ok(entries)
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Probe the connection with a no-op command.
    ///
    /// A session busy with another operation counts as healthy and is not
    /// probed; its failure count is left as is. Does not refresh `last_used`.
    /// Reaching the failure threshold forces a disconnect.
    pub async fn health_check(&self) -> bool {
        let Ok(shell) = self.shell() else {
            return false;
        };
        let timeout = self.policy.health_check_timeout;
        let outcome = match self
            .run_with(&shell, timeout, Access::IfIdle, move |sh| {
                sh.exec(HEALTH_CHECK_COMMAND, timeout)
            })
            .await
        {
            Ok(None) => {
                self.state.lock().last_health_check = Some((Instant::now(), Utc::now()));
                tracing::debug!(connection = %self.id, "session busy, skipping health probe");
                return true;
            }
            Ok(Some(out)) => Ok(out),
            Err(e) => Err(e),
        };
        let healthy = matches!(&outcome, Ok(out) if out.exit_code == 0 && out.stdout.contains(HEALTH_CHECK_MARKER));

        let failures = {
            let mut state = self.state.lock();
            state.last_health_check = Some((Instant::now(), Utc::now()));
            if healthy {
                state.health_check_failures = 0;
            } else {
                state.health_check_failures += 1;
            }
            state.health_check_failures
        };

        if healthy {
            return true;
        }
        match &outcome {
            Err(e) => tracing::warn!(connection = %self.id, failures, error = %e, "health check failed"),
            Ok(out) => tracing::warn!(connection = %self.id, failures, exit_code = out.exit_code, "health check returned unexpected output"),
        }
        if failures >= self.policy.max_health_check_failures {
            tracing::warn!(connection = %self.id, failures, "health check threshold reached, disconnecting");
            self.disconnect().await;
        }
        false
    }

    /// True when connected and the check interval has elapsed since the last
    /// probe (or no probe has run yet).
    pub fn is_health_check_needed(&self) -> bool {
        let state = self.state.lock();
        if !state.info.connected {
            return false;
        }
        match state.last_health_check {
            None => true,
            Some((at, _)) => at.elapsed() >= self.policy.health_check_interval,
        }
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock();
        SessionStats {
            connection_id: self.id,
            hostname: state.info.hostname.clone(),
            username: state.info.username.clone(),
            port: state.info.port,
            auth_method: self.config.auth_method(),
            connected: state.info.connected,
            created_at: state.info.created_at,
            last_used: state.info.last_used,
            connected_at: state.connected_at.map(|(_, at)| at),
            connection_duration_secs: state
                .connected_at
                .filter(|_| state.info.connected)
                .map(|(at, _)| at.elapsed().as_secs_f64()),
            last_health_check: state.last_health_check.map(|(_, at)| at),
            health_check_failures: state.health_check_failures,
            reconnect_attempts: state.reconnect_attempts,
            commands_executed: state.commands_executed,
            connection_lost: state.connection_lost,
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn shell(&self) -> Result<SharedShell, SessionError> {
        self.state
            .lock()
            .shell
            .clone()
            .ok_or(SessionError::NotConnected { id: self.id })
    }

    /// Run `op` against the handle on the blocking pool, waiting for any
    /// operation already in progress. A lost connection releases the handle
    /// before the error is returned.
    async fn run<T, F>(
        &self,
        shell: &SharedShell,
        timeout: Duration,
        op: F,
    ) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn RemoteShell) -> Result<T, TransportError> + Send + 'static,
    {
        self.run_with(shell, timeout, Access::Wait, op)
            .await?
            .ok_or_else(|| TransportError::Other("transport handle unavailable".into()))
    }

    /// Like [`Session::run`]; with [`Access::IfIdle`] it returns `Ok(None)`
    /// instead of queueing behind a busy handle.
    async fn run_with<T, F>(
        &self,
        shell: &SharedShell,
        timeout: Duration,
        access: Access,
        op: F,
    ) -> Result<Option<T>, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn RemoteShell) -> Result<T, TransportError> + Send + 'static,
    {
        let handle = Arc::clone(shell);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = match access {
                Access::Wait => handle.lock(),
                Access::IfIdle => match handle.try_lock() {
                    Some(guard) => guard,
                    None => return Ok(None),
                },
            };
            op(&mut **guard).map(Some)
        });
        let outcome = match tokio::time::timeout(timeout + self.policy.operation_grace, task).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Err(join)) => Err(TransportError::Other(format!("transport task failed: {join}"))),
            Ok(Ok(result)) => result,
        };
        if let Err(e) = &outcome {
            if e.is_connection_lost() {
                self.mark_lost(shell, e).await;
            }
        }
        outcome
    }

    async fn mark_lost(&self, shell: &SharedShell, cause: &TransportError) {
        let taken = {
            let mut state = self.state.lock();
            let current = state
                .shell
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, shell));
            if !current {
                return;
            }
            state.info.connected = false;
            state.connection_lost = true;
            state.connected_at = None;
            state.shell.take()
        };
        tracing::warn!(connection = %self.id, error = %cause, "transport lost, session disconnected");
        if let Some(shell) = taken {
            self.release(shell).await;
        }
    }

    /// Close a handle that has already been detached from the session.
    ///
    /// A handle still held by an in-flight operation is closed in the
    /// background once that operation returns; otherwise the close is awaited
    /// for at most `operation_grace`.
    async fn release(&self, shell: SharedShell) {
        let busy = shell.is_locked();
        let id = self.id;
        let task = tokio::task::spawn_blocking(move || {
            if let Err(e) = shell.lock().close() {
                tracing::warn!(connection = %id, error = %e, "error closing transport");
            }
        });
        if busy {
            tracing::debug!(connection = %id, "transport busy, closing after the current operation");
            return;
        }
        match tokio::time::timeout(self.policy.operation_grace, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(connection = %id, error = %e, "transport close task failed"),
            Err(_) => tracing::warn!(connection = %id, "transport close still pending, continuing in background"),
        }
    }

    fn classify(&self, err: TransportError) -> SessionError {
        match err {
            TransportError::Timeout(timeout) => SessionError::Timeout { id: self.id, timeout },
            TransportError::Auth { method, detail } => SessionError::Auth {
                id: self.id,
                target: self.config.target(),
                method,
                detail,
            },
            source => SessionError::Connection { id: self.id, source },
        }
    }

    fn classify_file(&self, path: &str, err: TransportError) -> SessionError {
        match err {
            TransportError::NotFound(_)
            | TransportError::PermissionDenied(_)
            | TransportError::Other(_) => SessionError::File {
                id: self.id,
                path: path.to_string(),
                source: err,
            },
            other => self.classify(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionParams;
    use crate::transport::memory::MemoryHost;
    use crate::transport::ExecOutput;

    fn session_with(host: &MemoryHost, policy: SessionPolicy) -> Session {
        let config = ConnectionConfig::new(ConnectionParams::new("sim.local", "tester")).unwrap();
        Session::new(Uuid::new_v4(), config, policy, Arc::new(host.clone()))
    }

    fn session(host: &MemoryHost) -> Session {
        session_with(host, SessionPolicy::default())
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let host = MemoryHost::new();
        let s = session(&host);
        assert!(!s.is_connected());
        s.connect().await.unwrap();
        s.connect().await.unwrap();
        assert!(s.is_connected());
        assert_eq!(host.connections_opened(), 1);
        assert!(s.stats().connected_at.is_some());
    }

    #[tokio::test]
    async fn auth_failure_leaves_session_disconnected() {
        let host = MemoryHost::new();
        host.reject_auth(true);
        let s = session(&host);
        let err = s.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Auth { method: AuthMethod::Agent, .. }), "{err:?}");
        assert_eq!(err.id(), s.id());
        assert!(!s.is_connected());
    }

    #[tokio::test]
    async fn disconnect_swallows_close_errors() {
        let host = MemoryHost::new();
        let s = session(&host);
        s.connect().await.unwrap();
        host.fail_close(true);
        s.disconnect().await;
        assert!(!s.is_connected());
        assert_eq!(host.live_connections(), 0);
        s.disconnect().await;
        let stats = s.stats();
        assert!(stats.connected_at.is_none());
        assert!(stats.last_health_check.is_none());
    }

    #[tokio::test]
    async fn execute_requires_connection_and_command() {
        let host = MemoryHost::new();
        let s = session(&host);
        assert!(matches!(
            s.execute_command("true", None).await,
            Err(SessionError::NotConnected { .. })
        ));
        s.connect().await.unwrap();
        assert!(matches!(
            s.execute_command("   ", None).await,
            Err(SessionError::EmptyCommand { .. })
        ));
        assert_eq!(host.exec_count(), 0);
    }

    #[tokio::test]
    async fn execute_captures_output_and_refreshes_last_used() {
        let host = MemoryHost::new();
        host.script(
            "uname -a",
            ExecOutput {
                stdout: "Linux sim\n".into(),
                stderr: "warn\n".into(),
                exit_code: 3,
            },
        );
        let s = session(&host);
        s.connect().await.unwrap();
        let before = s.info().last_used;

        let result = s.execute_command("uname -a", None).await.unwrap();
        assert_eq!(result.stdout(), "Linux sim\n");
        assert_eq!(result.stderr(), "warn\n");
        assert_eq!(result.exit_code(), 3);
        assert_eq!(result.command(), Some("uname -a"));
        assert!(!result.succeeded());
        assert!(s.info().last_used >= before);
        assert_eq!(s.stats().commands_executed, 1);
    }

    #[tokio::test]
    async fn timeout_keeps_session_connected() {
        let host = MemoryHost::new();
        let s = session(&host);
        s.connect().await.unwrap();
        let err = s
            .execute_command("sleep 5", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }), "{err:?}");
        assert!(s.is_connected());
    }

    #[tokio::test]
    async fn transport_error_does_not_disconnect() {
        let host = MemoryHost::new();
        let s = session(&host);
        s.connect().await.unwrap();
        host.fail_next_execs(1);
        assert!(matches!(
            s.execute_command("true", None).await,
            Err(SessionError::Connection { .. })
        ));
        assert!(s.is_connected());
        assert!(s.execute_command("true", None).await.is_ok());
    }

    #[tokio::test]
    async fn broken_pipe_releases_handle() {
        let host = MemoryHost::new();
        let s = session(&host);
        s.connect().await.unwrap();
        host.drop_connection_on_next_op();
        let err = s.execute_command("true", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Connection { .. }), "{err:?}");
        assert!(!s.is_connected());
        assert!(s.connection_lost());
        assert_eq!(host.live_connections(), 0);
        assert!(matches!(
            s.read_file("/tmp/x", FileEncoding::Utf8).await,
            Err(SessionError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn health_check_threshold_forces_disconnect() {
        let host = MemoryHost::new();
        let s = session(&host);
        s.connect().await.unwrap();
        assert!(s.health_check().await);

        host.fail_next_execs(3);
        assert!(!s.health_check().await);
        assert!(!s.health_check().await);
        assert!(s.is_connected());
        assert_eq!(s.health_check_failures(), 2);

        assert!(!s.health_check().await);
        assert!(!s.is_connected());
        assert!(!s.connection_lost());
        assert!(!s.health_check().await);
    }

    #[tokio::test]
    async fn successful_check_resets_failures() {
        let host = MemoryHost::new();
        let s = session(&host);
        s.connect().await.unwrap();
        host.fail_next_execs(2);
        s.health_check().await;
        s.health_check().await;
        assert_eq!(s.health_check_failures(), 2);
        assert!(s.health_check().await);
        assert_eq!(s.health_check_failures(), 0);
    }

    #[tokio::test]
    async fn health_check_does_not_touch_last_used() {
        let host = MemoryHost::new();
        let s = session(&host);
        s.connect().await.unwrap();
        let before = s.info().last_used;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(s.health_check().await);
        assert_eq!(s.info().last_used, before);
    }

    #[tokio::test]
    async fn health_check_needed_follows_interval() {
        let host = MemoryHost::new();
        let policy = SessionPolicy {
            health_check_interval: Duration::from_millis(40),
            ..SessionPolicy::default()
        };
        let s = session_with(&host, policy);
        assert!(!s.is_health_check_needed());
        s.connect().await.unwrap();
        assert!(s.is_health_check_needed());
        s.health_check().await;
        assert!(!s.is_health_check_needed());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(s.is_health_check_needed());
    }

    #[tokio::test]
    async fn busy_session_skips_health_probe() {
        let host = MemoryHost::new();
        let policy = SessionPolicy {
            max_health_check_failures: 1,
            health_check_timeout: Duration::from_millis(50),
            operation_grace: Duration::from_millis(10),
            ..SessionPolicy::default()
        };
        let s = Arc::new(session_with(&host, policy));
        s.connect().await.unwrap();

        let running = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.execute_command("sleep 0.5", Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        assert!(s.health_check().await);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(s.health_check_failures(), 0);
        assert!(s.is_connected());
        assert!(s.stats().last_health_check.is_some());

        running.await.unwrap().unwrap();
        // Only the long command reached the transport.
        assert_eq!(host.exec_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_does_not_wait_for_in_flight_operation() {
        let host = MemoryHost::new();
        host.put_file("/tmp/big.log", "line\n");
        host.set_file_latency(Duration::from_millis(500));
        let s = Arc::new(session(&host));
        s.connect().await.unwrap();

        let reading = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.read_file("/tmp/big.log", FileEncoding::Utf8).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_millis(200), s.disconnect())
            .await
            .expect("disconnect returned while the read was in flight");
        assert!(!s.is_connected());

        assert_eq!(reading.await.unwrap().unwrap().content, "line\n");
        for _ in 0..50 {
            if host.live_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(host.live_connections(), 0);
    }

    #[tokio::test]
    async fn slow_file_operation_times_out() {
        let host = MemoryHost::new();
        host.put_file("/tmp/a.txt", "abc");
        host.set_file_latency(Duration::from_millis(300));
        let policy = SessionPolicy {
            command_timeout: Duration::from_millis(30),
            operation_grace: Duration::from_millis(10),
            ..SessionPolicy::default()
        };
        let s = session_with(&host, policy);
        s.connect().await.unwrap();
        let err = s.read_file("/tmp/a.txt", FileEncoding::Utf8).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }), "{err:?}");
        assert!(s.is_connected());
    }

    #[tokio::test]
    async fn reconnect_retries_with_backoff() {
        let host = MemoryHost::new();
        let policy = SessionPolicy {
            reconnect: ReconnectPolicy {
                enabled: true,
                max_attempts: 2,
                delay: Duration::from_millis(5),
                backoff_multiplier: 2,
            },
            ..SessionPolicy::default()
        };
        let s = session_with(&host, policy);
        s.connect().await.unwrap();

        host.refuse_connections(true);
        let err = s.reconnect().await.unwrap_err();
        assert!(matches!(err, SessionError::ReconnectFailed { attempts: 2, .. }), "{err:?}");
        assert!(!s.is_connected());

        host.refuse_connections(false);
        s.reconnect().await.unwrap();
        assert!(s.is_connected());
        assert_eq!(s.stats().reconnect_attempts, 3);
    }

    #[tokio::test]
    async fn write_then_read_with_parent_creation() {
        let host = MemoryHost::new();
        let s = session(&host);
        s.connect().await.unwrap();

        let err = s
            .write_file("/srv/app/config.yml", "a: 1\n", FileEncoding::Utf8, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::File { .. }), "{err:?}");
        assert!(s.is_connected());

        let written = s
            .write_file("/srv/app/config.yml", "a: 1\n", FileEncoding::Utf8, true)
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert!(host.has_dir("/srv/app"));

        let read = s.read_file("/srv/app/config.yml", FileEncoding::Utf8).await.unwrap();
        assert_eq!(read.content, "a: 1\n");
        assert_eq!(read.size, 5);
    }

    #[tokio::test]
    async fn undecodable_file_is_an_encoding_error() {
        let host = MemoryHost::new();
        host.put_file("/tmp/blob.bin", vec![0xff, 0x00, 0xfe]);
        let s = session(&host);
        s.connect().await.unwrap();
        let err = s.read_file("/tmp/blob.bin", FileEncoding::Utf8).await.unwrap_err();
        assert!(matches!(err, SessionError::Encoding { .. }), "{err:?}");
        let b64 = s.read_file("/tmp/blob.bin", FileEncoding::Base64).await.unwrap();
        assert_eq!(b64.content, "/wD+");
        assert_eq!(b64.size, 3);
    }
}
