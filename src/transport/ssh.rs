//! libssh2-backed transport.
//!
//! Commands run over exec channels; file operations go through SFTP. Host
//! keys are accepted without verification.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ssh2::{ErrorCode, FileStat, Session, Sftp};

use super::{remote_parent, Connector, ExecOutput, RemoteShell, TransportError};
use crate::model::{AuthMethod, ConnectionConfig, DirEntry, EntryKind};

// libssh2 session error codes that mean the socket is gone.
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

// Bound on the disconnect exchange when a handle is closed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// SFTP status codes.
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

/// Opens sessions with the `ssh2` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn RemoteShell>, TransportError> {
        let connect_timeout = config.timeout();
        let tcp = connect_tcp(config.hostname(), config.port(), connect_timeout)?;

        let mut session = Session::new()
            .map_err(|e| TransportError::Connect(format!("failed to create SSH session: {e}")))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(connect_timeout));
        session
            .handshake()
            .map_err(|e| TransportError::Connect(format!("SSH handshake failed: {e}")))?;

        authenticate(&session, config)?;
        if !session.authenticated() {
            return Err(TransportError::Auth {
                method: config.auth_method(),
                detail: "server did not accept credentials".into(),
            });
        }

        tracing::debug!(target = %config.target(), "SSH session authenticated");
        Ok(Box::new(SshShell { session, sftp: None }))
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect(format!("failed to resolve {host}: {e}")))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => TransportError::Timeout(timeout),
        Some(e) => TransportError::Connect(format!("{host}:{port}: {e}")),
        None => TransportError::Connect(format!("{host} resolved to no addresses")),
    })
}

fn authenticate(session: &Session, config: &ConnectionConfig) -> Result<(), TransportError> {
    let method = config.auth_method();
    let user = config.username();
    let result = match method {
        AuthMethod::Key => {
            let key = config.resolved_key_path().ok_or(TransportError::Auth {
                method,
                detail: "no key path configured".into(),
            })?;
            session.userauth_pubkey_file(user, None, &key, None)
        }
        AuthMethod::Password => {
            let password = config.password().unwrap_or_default();
            session.userauth_password(user, password)
        }
        AuthMethod::Agent => session.userauth_agent(user),
    };
    result.map_err(|e| TransportError::Auth {
        method,
        detail: e.message().to_string(),
    })
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

pub struct SshShell {
    session: Session,
    sftp: Option<Sftp>,
}

impl SshShell {
    fn sftp(&mut self) -> Result<&Sftp, TransportError> {
        if self.sftp.is_none() {
            let sftp = self.session.sftp().map_err(|e| map_ssh_error(e, ""))?;
            self.sftp = Some(sftp);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| TransportError::Other("SFTP subsystem unavailable".into()))
    }

    /// Run `op` with libssh2's blocking timeout set to `timeout`. The timeout
    /// stays in force afterwards so the handle never blocks unbounded.
    fn bounded<T>(
        &mut self,
        timeout: Duration,
        op: impl FnOnce(&mut Self) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        self.session.set_timeout(millis(timeout));
        op(self).map_err(|e| match e {
            TransportError::Timeout(_) => TransportError::Timeout(timeout),
            other => other,
        })
    }

    fn run(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| map_ssh_error(e, ""))?;
        channel.exec(command).map_err(|e| map_ssh_error(e, ""))?;

        let mut stdout = Vec::new();
        channel
            .read_to_end(&mut stdout)
            .map_err(|e| map_io_error(e, ""))?;
        let mut stderr = Vec::new();
        channel
            .stderr()
            .read_to_end(&mut stderr)
            .map_err(|e| map_io_error(e, ""))?;

        channel.wait_close().map_err(|e| map_ssh_error(e, ""))?;
        let exit_code = channel.exit_status().map_err(|e| map_ssh_error(e, ""))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

impl RemoteShell for SshShell {
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        self.bounded(timeout, |shell| shell.run(command))
    }

    fn read_file(&mut self, path: &str, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.bounded(timeout, |shell| {
            let mut file = shell
                .sftp()?
                .open(Path::new(path))
                .map_err(|e| map_ssh_error(e, path))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .map_err(|e| map_io_error(e, path))?;
            Ok(buf)
        })
    }

    fn write_file(
        &mut self,
        path: &str,
        content: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.bounded(timeout, |shell| {
            let mut file = shell
                .sftp()?
                .create(Path::new(path))
                .map_err(|e| map_ssh_error(e, path))?;
            file.write_all(content).map_err(|e| map_io_error(e, path))?;
            file.flush().map_err(|e| map_io_error(e, path))?;
            Ok(())
        })
    }

    fn create_dir_all(&mut self, path: &str, timeout: Duration) -> Result<(), TransportError> {
        self.bounded(timeout, |shell| {
            let sftp = shell.sftp()?;
            let mut pending = Vec::new();
            let mut current = Some(path.trim_end_matches('/'));
            while let Some(dir) = current {
                if dir.is_empty() || dir == "/" {
                    break;
                }
                match sftp.stat(Path::new(dir)) {
                    Ok(stat) if stat.is_dir() => break,
                    Ok(_) => {
                        return Err(TransportError::Other(format!(
                            "{dir} exists and is not a directory"
                        )))
                    }
                    Err(_) => {
                        pending.push(dir);
                        current = remote_parent(dir);
                    }
                }
            }
            for dir in pending.into_iter().rev() {
                sftp.mkdir(Path::new(dir), 0o755)
                    .map_err(|e| map_ssh_error(e, dir))?;
            }
            Ok(())
        })
    }

    fn list_dir(&mut self, path: &str, timeout: Duration) -> Result<Vec<DirEntry>, TransportError> {
        self.bounded(timeout, |shell| {
            let listing = shell
                .sftp()?
                .readdir(Path::new(path))
                .map_err(|e| map_ssh_error(e, path))?;
            Ok(listing
                .into_iter()
                .filter_map(|(entry_path, stat)| {
                    let name = entry_path.file_name()?.to_string_lossy().into_owned();
                    if name == "." || name == ".." {
                        return None;
                    }
                    Some(dir_entry(name, &stat))
                })
                .collect())
        })
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.sftp = None;
        self.session.set_timeout(millis(CLOSE_TIMEOUT));
        self.session
            .disconnect(None, "closing connection", None)
            .map_err(|e| map_ssh_error(e, ""))
    }
}

fn dir_entry(name: String, stat: &FileStat) -> DirEntry {
    let file_type = stat.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    DirEntry {
        name,
        kind,
        size: stat.size,
        permissions: stat.perm.map(|p| p & 0o7777),
        modified: stat
            .mtime
            .and_then(|t| i64::try_from(t).ok())
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
        uid: stat.uid,
        gid: stat.gid,
    }
}

fn map_ssh_error(err: ssh2::Error, path: &str) -> TransportError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => TransportError::NotFound(path.to_string()),
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => {
            TransportError::PermissionDenied(path.to_string())
        }
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => TransportError::Timeout(Duration::ZERO),
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_RECV | LIBSSH2_ERROR_SOCKET_DISCONNECT,
        ) => TransportError::ConnectionLost(err.message().to_string()),
        _ => TransportError::Other(format!("SSH error: {}", err.message())),
    }
}

fn map_io_error(err: io::Error, path: &str) -> TransportError {
    match err.kind() {
        io::ErrorKind::TimedOut => TransportError::Timeout(Duration::ZERO),
        io::ErrorKind::NotFound => TransportError::NotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(path.to_string()),
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => TransportError::ConnectionLost(err.to_string()),
        _ => TransportError::Other(format!("I/O error: {err}")),
    }
}
