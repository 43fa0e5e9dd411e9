//! Keyed registry of sessions with capacity admission and a health sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::{CommandResult, ConnectionConfig, ConnectionInfo, DirEntry, FileEncoding};
use crate::session::{FileContent, Session, SessionError, SessionPolicy, SessionStats};
use crate::transport::Connector;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Maximum number of connections ({limit}) reached")]
    CapacityReached { limit: usize },
    #[error("Connection {0} not found")]
    NotFound(Uuid),
    #[error("{source}")]
    Session {
        id: Uuid,
        #[source]
        source: SessionError,
    },
}

impl PoolError {
    /// The connection the error concerns, if any.
    pub fn connection_id(&self) -> Option<Uuid> {
        match self {
            PoolError::CapacityReached { .. } => None,
            PoolError::NotFound(id) | PoolError::Session { id, .. } => Some(*id),
        }
    }
}

/// Pool-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    pub active_connections: usize,
    pub connected: usize,
    pub total_connections_created: u64,
    pub total_commands_executed: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: f64,
}

/// What one health sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub recovered: Vec<Uuid>,
    pub evicted: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.recovered.is_empty() && self.evicted.is_empty()
    }
}

struct PoolEntry {
    /// Insertion sequence, for stable listing order.
    seq: u64,
    session: Arc<Session>,
}

struct PoolInner {
    sessions: RwLock<HashMap<Uuid, PoolEntry>>,
    /// Registered sessions plus connects in flight.
    slots: AtomicUsize,
    max_connections: usize,
    next_seq: AtomicU64,
    policy: SessionPolicy,
    connector: Arc<dyn Connector>,
    started_at: DateTime<Utc>,
    started: Instant,
    total_created: AtomicU64,
    total_commands: AtomicU64,
}

/// RAII reservation of one pool slot. Released on drop unless committed.
struct SlotGuard<'a> {
    slots: &'a AtomicUsize,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    /// Reserve a slot if fewer than `limit` are taken. Uses a
    /// compare-exchange loop so concurrent callers cannot overshoot.
    fn acquire(slots: &'a AtomicUsize, limit: usize) -> Option<Self> {
        loop {
            let current = slots.load(Ordering::Acquire);
            if current >= limit {
                return None;
            }
            if slots
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(Self { slots, armed: true });
            }
        }
    }

    /// Keep the slot; it now belongs to a registered session.
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slots.fetch_sub(1, Ordering::Release);
        }
    }
}

/// Owns every live session. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("max_connections", &self.inner.max_connections)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new(max_connections: usize, policy: SessionPolicy, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                sessions: RwLock::new(HashMap::new()),
                slots: AtomicUsize::new(0),
                max_connections,
                next_seq: AtomicU64::new(0),
                policy,
                connector,
                started_at: Utc::now(),
                started: Instant::now(),
                total_created: AtomicU64::new(0),
                total_commands: AtomicU64::new(0),
            }),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connect a new session and register it.
    ///
    /// Capacity is reserved before any I/O; a failed connect releases the
    /// reservation and registers nothing.
    pub async fn create_connection(&self, config: ConnectionConfig) -> Result<Uuid, PoolError> {
        let limit = self.inner.max_connections;
        let slot = SlotGuard::acquire(&self.inner.slots, limit).ok_or_else(|| {
            tracing::warn!(limit, host = %config.hostname(), "connection refused, pool at capacity");
            PoolError::CapacityReached { limit }
        })?;

        let id = Uuid::new_v4();
        let session = Arc::new(Session::new(
            id,
            config,
            self.inner.policy.clone(),
            Arc::clone(&self.inner.connector),
        ));
        session
            .connect()
            .await
            .map_err(|source| PoolError::Session { id, source })?;

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner
            .sessions
            .write()
            .insert(id, PoolEntry { seq, session });
        slot.commit();
        self.inner.total_created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection = %id, active = self.len(), "connection registered");
        Ok(id)
    }

    pub fn session(&self, id: Uuid) -> Result<Arc<Session>, PoolError> {
        self.inner
            .sessions
            .read()
            .get(&id)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or(PoolError::NotFound(id))
    }

    pub fn connection_info(&self, id: Uuid) -> Result<ConnectionInfo, PoolError> {
        Ok(self.session(id)?.info())
    }

    pub async fn execute_command(
        &self,
        id: Uuid,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, PoolError> {
        let result = self
            .session(id)?
            .execute_command(command, timeout)
            .await
            .map_err(|source| PoolError::Session { id, source })?;
        self.inner.total_commands.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    pub async fn read_file(
        &self,
        id: Uuid,
        path: &str,
        encoding: FileEncoding,
    ) -> Result<FileContent, PoolError> {
        self.session(id)?
            .read_file(path, encoding)
            .await
            .map_err(|source| PoolError::Session { id, source })
    }

    pub async fn write_file(
        &self,
        id: Uuid,
        path: &str,
        content: &str,
        encoding: FileEncoding,
        create_dirs: bool,
    ) -> Result<usize, PoolError> {
        self.session(id)?
            .write_file(path, content, encoding, create_dirs)
            .await
            .map_err(|source| PoolError::Session { id, source })
    }

    pub async fn list_directory(&self, id: Uuid, path: &str) -> Result<Vec<DirEntry>, PoolError> {
        self.session(id)?
            .list_directory(path)
            .await
            .map_err(|source| PoolError::Session { id, source })
    }

    /// Remove and disconnect a session. Returns false for unknown ids.
    pub async fn disconnect_connection(&self, id: Uuid) -> bool {
        let removed = self.inner.sessions.write().remove(&id);
        let Some(entry) = removed else {
            return false;
        };
        self.inner.slots.fetch_sub(1, Ordering::Release);
        entry.session.disconnect().await;
        tracing::info!(connection = %id, active = self.len(), "connection removed");
        true
    }

    pub async fn reconnect_connection(&self, id: Uuid) -> Result<(), PoolError> {
        self.session(id)?
            .reconnect()
            .await
            .map_err(|source| PoolError::Session { id, source })
    }

    /// Snapshot of every registered session, in insertion order.
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.ordered_sessions().iter().map(|s| s.info()).collect()
    }

    pub fn session_stats(&self, id: Uuid) -> Result<SessionStats, PoolError> {
        Ok(self.session(id)?.stats())
    }

    pub fn stats(&self) -> PoolStats {
        let sessions = self.ordered_sessions();
        PoolStats {
            max_connections: self.inner.max_connections,
            active_connections: sessions.len(),
            connected: sessions.iter().filter(|s| s.is_connected()).count(),
            total_connections_created: self.inner.total_created.load(Ordering::Relaxed),
            total_commands_executed: self.inner.total_commands.load(Ordering::Relaxed),
            started_at: self.inner.started_at,
            uptime_secs: self.inner.started.elapsed().as_secs_f64(),
        }
    }

    fn ordered_sessions(&self) -> Vec<Arc<Session>> {
        let map = self.inner.sessions.read();
        let mut entries: Vec<(u64, Arc<Session>)> = map
            .values()
            .map(|e| (e.seq, Arc::clone(&e.session)))
            .collect();
        drop(map);
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, s)| s).collect()
    }

    // ── Health sweep ───────────────────────────────────────────────

    /// Probe sessions that are due, then recover or evict every session that
    /// is no longer connected.
    pub async fn sweep_once(&self) -> SweepReport {
        let sessions = self.ordered_sessions();
        let due: Vec<&Arc<Session>> = sessions
            .iter()
            .filter(|s| s.is_health_check_needed())
            .collect();
        let checked = due.len();
        join_all(due.into_iter().map(|s| s.health_check())).await;

        let down: Vec<Uuid> = sessions
            .iter()
            .filter(|s| !s.is_connected())
            .map(|s| s.id())
            .collect();

        let mut report = SweepReport {
            checked,
            ..SweepReport::default()
        };
        if down.is_empty() {
            return report;
        }

        let mut to_evict = down.clone();
        if self.inner.policy.reconnect.enabled {
            let attempts = join_all(down.iter().map(|id| async move {
                (*id, self.reconnect_connection(*id).await)
            }))
            .await;
            to_evict.clear();
            for (id, outcome) in attempts {
                match outcome {
                    Ok(()) => report.recovered.push(id),
                    Err(PoolError::NotFound(_)) => {}
                    Err(e) => {
                        tracing::warn!(connection = %id, error = %e, "recovery failed");
                        to_evict.push(id);
                    }
                }
            }
        }

        for id in to_evict {
            if self.disconnect_connection(id).await {
                tracing::warn!(connection = %id, "evicted unhealthy connection");
                report.evicted.push(id);
            }
        }
        report
    }

    /// Run [`Pool::sweep_once`] every `interval` until `cancel` fires.
    pub fn start_health_sweep(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = pool.sweep_once().await;
                        if !report.is_quiet() {
                            tracing::info!(
                                checked = report.checked,
                                recovered = report.recovered.len(),
                                evicted = report.evicted.len(),
                                "health sweep"
                            );
                        }
                    }
                }
            }
            tracing::debug!("health sweep stopped");
        })
    }

    /// Remove every session and disconnect them concurrently.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut map = self.inner.sessions.write();
            map.drain().map(|(_, entry)| entry.session).collect()
        };
        self.inner.slots.fetch_sub(drained.len(), Ordering::Release);
        join_all(drained.iter().map(|s| s.disconnect())).await;
        tracing::info!(closed = drained.len(), "pool shut down");
    }
}
