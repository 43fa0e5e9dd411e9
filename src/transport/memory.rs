//! In-process simulated host.
//!
//! Every connection opened through one [`MemoryHost`] sees the same
//! filesystem. Faults can be injected between calls to exercise the session
//! and pool failure paths without a real SSH server.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{remote_parent, Connector, ExecOutput, RemoteShell, TransportError};
use crate::model::{ConnectionConfig, DirEntry, EntryKind};

const SIMULATED_UID: u32 = 1000;

#[derive(Default)]
struct HostState {
    files: BTreeMap<String, (Vec<u8>, DateTime<Utc>)>,
    dirs: BTreeSet<String>,
    scripted: HashMap<String, ExecOutput>,
    refuse_connect: bool,
    reject_auth: bool,
    fail_execs: u32,
    drop_next_op: bool,
    fail_close: bool,
    connect_latency: Duration,
    exec_latency: Duration,
    file_latency: Duration,
    opened: usize,
    live: usize,
    exec_count: usize,
}

/// Shared simulated host. Cloning yields another handle to the same host.
#[derive(Clone)]
pub struct MemoryHost {
    state: Arc<Mutex<HostState>>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// A host with `/`, `/tmp` and `/home` already present.
    pub fn new() -> Self {
        let mut state = HostState::default();
        for dir in ["/", "/tmp", "/home"] {
            state.dirs.insert(dir.to_string());
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    // ── Fixtures ───────────────────────────────────────────────────

    /// Place a file, creating its parent directories.
    pub fn put_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let path = normalize(path);
        let mut state = self.state.lock();
        if let Some(parent) = remote_parent(&path) {
            make_dirs(&mut state, parent);
        }
        state.files.insert(path, (content.into(), Utc::now()));
    }

    pub fn put_dir(&self, path: &str) {
        make_dirs(&mut self.state.lock(), &normalize(path));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(&normalize(path)).map(|(c, _)| c.clone())
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().dirs.contains(&normalize(path))
    }

    /// Reply to exactly `command` with `output` instead of interpreting it.
    pub fn script(&self, command: &str, output: ExecOutput) {
        self.state.lock().scripted.insert(command.to_string(), output);
    }

    // ── Fault injection ────────────────────────────────────────────

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    pub fn reject_auth(&self, reject: bool) {
        self.state.lock().reject_auth = reject;
    }

    /// Make the next `n` exec calls fail with a transport error.
    pub fn fail_next_execs(&self, n: u32) {
        self.state.lock().fail_execs = n;
    }

    /// The next operation on any open handle reports a lost connection, and
    /// that handle stays dead.
    pub fn drop_connection_on_next_op(&self) {
        self.state.lock().drop_next_op = true;
    }

    pub fn fail_close(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.state.lock().connect_latency = latency;
    }

    pub fn set_exec_latency(&self, latency: Duration) {
        self.state.lock().exec_latency = latency;
    }

    /// Delay every file operation, as a slow SFTP peer would.
    pub fn set_file_latency(&self, latency: Duration) {
        self.state.lock().file_latency = latency;
    }

    // ── Observation ────────────────────────────────────────────────

    /// Handles opened over the host's lifetime.
    pub fn connections_opened(&self) -> usize {
        self.state.lock().opened
    }

    /// Handles opened and not yet closed or dropped.
    pub fn live_connections(&self) -> usize {
        self.state.lock().live
    }

    pub fn exec_count(&self) -> usize {
        self.state.lock().exec_count
    }
}

impl Connector for MemoryHost {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn RemoteShell>, TransportError> {
        let latency = self.state.lock().connect_latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let mut state = self.state.lock();
        if state.refuse_connect {
            return Err(TransportError::Connect(format!(
                "{}:{}: connection refused",
                config.hostname(),
                config.port()
            )));
        }
        if state.reject_auth {
            return Err(TransportError::Auth {
                method: config.auth_method(),
                detail: "permission denied".into(),
            });
        }
        state.opened += 1;
        state.live += 1;
        drop(state);

        Ok(Box::new(MemoryShell {
            host: self.clone(),
            alive: true,
        }))
    }
}

struct MemoryShell {
    host: MemoryHost,
    alive: bool,
}

impl MemoryShell {
    /// Gate every operation on liveness and the pending drop fault.
    fn check_alive(&mut self) -> Result<(), TransportError> {
        if !self.alive {
            return Err(TransportError::ConnectionLost("socket closed".into()));
        }
        let mut state = self.host.state.lock();
        if state.drop_next_op {
            state.drop_next_op = false;
            state.live = state.live.saturating_sub(1);
            self.alive = false;
            return Err(TransportError::ConnectionLost("broken pipe".into()));
        }
        Ok(())
    }

    /// Sleep for `latency`, or report a timeout once `timeout` has passed.
    fn stall(latency: Duration, timeout: Duration) -> Result<(), TransportError> {
        if latency.is_zero() {
            return Ok(());
        }
        if latency > timeout {
            std::thread::sleep(timeout);
            return Err(TransportError::Timeout(timeout));
        }
        std::thread::sleep(latency);
        Ok(())
    }

    fn file_op(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.check_alive()?;
        let latency = self.host.state.lock().file_latency;
        Self::stall(latency, timeout)
    }

    fn interpret(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        let trimmed = command.trim();
        let (program, rest) = trimmed
            .split_once(char::is_whitespace)
            .map(|(p, r)| (p, r.trim()))
            .unwrap_or((trimmed, ""));

        let ok = |stdout: String| ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        };
        let fail = |stderr: String, exit_code: i32| ExecOutput {
            stdout: String::new(),
            stderr,
            exit_code,
        };

        Ok(match program {
            "echo" => ok(format!("{}\n", unquote(rest))),
            "true" | ":" => ok(String::new()),
            "false" => fail(String::new(), 1),
            "exit" => fail(String::new(), rest.parse().unwrap_or(0)),
            "sleep" => {
                let secs: f64 = rest.parse().unwrap_or(0.0);
                let wanted = Duration::from_secs_f64(secs.max(0.0));
                if wanted > timeout {
                    std::thread::sleep(timeout);
                    return Err(TransportError::Timeout(timeout));
                }
                std::thread::sleep(wanted);
                ok(String::new())
            }
            "cat" => {
                let path = normalize(unquote(rest));
                match self.host.state.lock().files.get(&path) {
                    Some((content, _)) => ok(String::from_utf8_lossy(content).into_owned()),
                    None => fail(format!("cat: {path}: No such file or directory\n"), 1),
                }
            }
            "mkdir" if rest.starts_with("-p ") => {
                make_dirs(&mut self.host.state.lock(), &normalize(unquote(&rest[3..])));
                ok(String::new())
            }
            _ => fail(format!("sh: {program}: command not found\n"), 127),
        })
    }
}

impl RemoteShell for MemoryShell {
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        self.check_alive()?;
        let (scripted, latency) = {
            let mut state = self.host.state.lock();
            state.exec_count += 1;
            if state.fail_execs > 0 {
                state.fail_execs -= 1;
                return Err(TransportError::Other("simulated exec failure".into()));
            }
            (state.scripted.get(command).cloned(), state.exec_latency)
        };

        Self::stall(latency, timeout)?;

        match scripted {
            Some(output) => Ok(output),
            None => self.interpret(command, timeout),
        }
    }

    fn read_file(&mut self, path: &str, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.file_op(timeout)?;
        let path = normalize(path);
        let state = self.host.state.lock();
        if state.dirs.contains(&path) {
            return Err(TransportError::Other(format!("{path} is a directory")));
        }
        state
            .files
            .get(&path)
            .map(|(content, _)| content.clone())
            .ok_or(TransportError::NotFound(path))
    }

    fn write_file(
        &mut self,
        path: &str,
        content: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.file_op(timeout)?;
        let path = normalize(path);
        let mut state = self.host.state.lock();
        if state.dirs.contains(&path) {
            return Err(TransportError::Other(format!("{path} is a directory")));
        }
        if let Some(parent) = remote_parent(&path) {
            if !state.dirs.contains(parent) {
                return Err(TransportError::NotFound(parent.to_string()));
            }
        }
        state.files.insert(path, (content.to_vec(), Utc::now()));
        Ok(())
    }

    fn create_dir_all(&mut self, path: &str, timeout: Duration) -> Result<(), TransportError> {
        self.file_op(timeout)?;
        let path = normalize(path);
        let mut state = self.host.state.lock();
        if state.files.contains_key(&path) {
            return Err(TransportError::Other(format!("{path} exists and is not a directory")));
        }
        make_dirs(&mut state, &path);
        Ok(())
    }

    fn list_dir(&mut self, path: &str, timeout: Duration) -> Result<Vec<DirEntry>, TransportError> {
        self.file_op(timeout)?;
        let path = normalize(path);
        let state = self.host.state.lock();
        if !state.dirs.contains(&path) {
            return Err(TransportError::NotFound(path));
        }

        let is_child =
            |candidate: &str| candidate != path && remote_parent(candidate) == Some(path.as_str());
        let leaf = |candidate: &str| candidate.rsplit('/').next().unwrap_or(candidate).to_string();

        let mut entries: Vec<DirEntry> = state
            .dirs
            .iter()
            .filter(|d| is_child(d.as_str()))
            .map(|d| DirEntry {
                name: leaf(d.as_str()),
                kind: EntryKind::Directory,
                size: Some(4096),
                permissions: Some(0o755),
                modified: None,
                uid: Some(SIMULATED_UID),
                gid: Some(SIMULATED_UID),
            })
            .collect();
        entries.extend(state.files.iter().filter(|(f, _)| is_child(f.as_str())).map(
            |(f, (content, modified))| DirEntry {
                name: leaf(f.as_str()),
                kind: EntryKind::File,
                size: Some(content.len() as u64),
                permissions: Some(0o644),
                modified: Some(*modified),
                uid: Some(SIMULATED_UID),
                gid: Some(SIMULATED_UID),
            },
        ));
        Ok(entries)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;
        let mut state = self.host.state.lock();
        state.live = state.live.saturating_sub(1);
        if state.fail_close {
            return Err(TransportError::Other("simulated close failure".into()));
        }
        Ok(())
    }
}

impl Drop for MemoryShell {
    fn drop(&mut self) {
        if self.alive {
            let mut state = self.host.state.lock();
            state.live = state.live.saturating_sub(1);
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim();
    let absolute = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/home/{trimmed}")
    };
    let stripped = absolute.trim_end_matches('/');
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

fn make_dirs(state: &mut HostState, path: &str) {
    let mut current = Some(path);
    while let Some(dir) = current {
        if !state.dirs.insert(dir.to_string()) {
            break;
        }
        current = remote_parent(dir);
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}
