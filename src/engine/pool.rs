use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::{ReqSessionError, Result};

/// Identity of an engine, used as the key in role maps and session
/// connection tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EngineId(Uuid);

impl EngineId {
    fn new() -> Self {
        EngineId(Uuid::new_v4())
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    pub idle_connections: usize,
    pub checked_out: usize,
    pub connections_opened: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Default)]
struct EngineCounters {
    opened: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// A connection pool for one SQLite database.
pub struct Engine {
    id: EngineId,
    name: String,
    target: String,
    flags: OpenFlags,
    config: EngineConfig,
    idle: Arc<Mutex<Vec<Connection>>>,
    semaphore: Arc<Semaphore>,
    counters: EngineCounters,
}

impl Engine {
    /// Open an engine on a database file. One connection is opened eagerly so
    /// that a bad path fails at setup time instead of on the first request.
    pub fn open(name: &str, path: &str, config: EngineConfig) -> Result<Arc<Self>> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        Self::build(EngineId::new(), name, path.to_string(), flags, config)
    }

    /// Open an engine on a private shared-cache in-memory database.
    ///
    /// The database lives as long as the engine keeps at least one pooled
    /// connection, which it always does. Shared-cache databases lock at table
    /// level, so concurrent writers and readers on the same table will see
    /// `SQLITE_LOCKED`; use file-backed engines for that.
    pub fn in_memory(name: &str, config: EngineConfig) -> Result<Arc<Self>> {
        let id = EngineId::new();
        let target = format!("file:reqsession-{id}?mode=memory&cache=shared");
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        Self::build(id, name, target, flags, config)
    }

    fn build(id: EngineId, name: &str, target: String, flags: OpenFlags, config: EngineConfig) -> Result<Arc<Self>> {
        if config.pool_size == 0 {
            return Err(ReqSessionError::Configuration(format!(
                "engine {name} needs a pool size of at least 1"
            )));
        }

        let engine = Engine {
            id,
            name: name.to_string(),
            target,
            flags,
            semaphore: Arc::new(Semaphore::new(config.pool_size)),
            config,
            idle: Arc::new(Mutex::new(Vec::new())),
            counters: EngineCounters::default(),
        };

        let conn = engine.open_connection()?;
        engine.idle.lock().push(conn);

        info!("Opened engine {} ({}) on {}", engine.name, engine.id, engine.target);
        Ok(Arc::new(engine))
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Check out a connection. Never blocks: a saturated pool is an error.
    pub fn acquire(&self) -> Result<PooledConnection> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| ReqSessionError::PoolExhausted(self.name.clone()))?;

        let conn = self.idle.lock().pop();
        let conn = match conn {
            Some(c) => c,
            None => self.open_connection()?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.idle.clone(),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let max_connections = self.config.pool_size;
        PoolStats {
            max_connections,
            idle_connections: self.idle.lock().len(),
            checked_out: max_connections - self.semaphore.available_permits(),
            connections_opened: self.counters.opened.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            rollbacks: self.counters.rollbacks.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_commit(&self) {
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn open_connection(&self) -> Result<Connection> {
        debug!("Opening connection for engine {} with target: {}", self.name, self.target);

        let conn = Connection::open_with_flags(&self.target, self.flags)?;
        conn.busy_timeout(self.config.busy_timeout)?;

        let pragma_sql = format!(
            "PRAGMA journal_mode = {};
             PRAGMA synchronous = {};
             PRAGMA foreign_keys = {};
             PRAGMA temp_store = MEMORY;",
            self.config.journal_mode,
            self.config.synchronous,
            if self.config.foreign_keys { "ON" } else { "OFF" },
        );
        conn.execute_batch(&pragma_sql)?;

        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }
}

impl PartialEq for Engine {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Engine {}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("target", &self.target)
            .field("pool_size", &self.config.pool_size)
            .finish()
    }
}

pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<Mutex<Vec<Connection>>>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled connection is present until dropped")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection is present until dropped")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Never hand a connection with an open transaction to the next user
            if !conn.is_autocommit() {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!("Discarding pooled connection after failed rollback: {}", e);
                    return;
                }
            }
            self.pool.lock().push(conn);
        }
    }
}
