use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bind::{BindContext, BindResolver};
use crate::engine::{Engine, PooledConnection};
use crate::session::state::{SessionInfo, SessionState};
use crate::session::statement::{QueryResult, Statement, StatementKind};
use crate::{ReqSessionError, Result};

struct EngineConnection {
    engine: Arc<Engine>,
    conn: PooledConnection,
    in_transaction: bool,
}

/// Unit of work over one connection per engine it has touched.
///
/// Writes staged with [`Session::add`] are sent on [`Session::flush`], which
/// also runs implicitly before queries and commits. Every statement asks the
/// session's [`BindResolver`] for its engine. A transaction is opened lazily
/// on each engine the first time it is used.
///
/// Commits across several engines are not atomic: each engine commits in
/// turn and the first failure stops the sequence.
pub struct Session {
    id: Uuid,
    state: SessionState,
    resolver: Arc<dyn BindResolver>,
    info: SessionInfo,
    connections: Vec<EngineConnection>,
    pending: Vec<Statement>,
    flushing: bool,
    flush_failed: bool,
    autoflush: bool,
    last_bind: Option<Arc<Engine>>,
}

impl Session {
    pub fn new(resolver: Arc<dyn BindResolver>, info: SessionInfo) -> Self {
        let session = Session {
            id: Uuid::new_v4(),
            state: SessionState::Created,
            resolver,
            info,
            connections: Vec::new(),
            pending: Vec::new(),
            flushing: false,
            flush_failed: false,
            autoflush: true,
            last_bind: None,
        };
        debug!("Session {} created (request bound: {})", session.id, session.info.request().is_some());
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut SessionInfo {
        &mut self.info
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Whether a failed flush left the session waiting for a rollback.
    pub fn needs_rollback(&self) -> bool {
        self.flush_failed
    }

    /// Number of staged writes not yet flushed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn set_autoflush(&mut self, enabled: bool) {
        self.autoflush = enabled;
    }

    /// Engine that served the most recent statement.
    pub fn last_bind(&self) -> Option<&Arc<Engine>> {
        self.last_bind.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.connections.iter().any(|c| c.in_transaction)
    }

    /// Engines this session holds a connection to, in order of first use.
    pub fn engines(&self) -> impl Iterator<Item = &Arc<Engine>> {
        self.connections.iter().map(|c| &c.engine)
    }

    /// Stage a write to be sent on the next flush.
    pub fn add(&mut self, stmt: impl Into<Statement>) -> Result<()> {
        let stmt = stmt.into();
        self.ensure_flushable()?;
        check_statement(&stmt)?;

        self.pending.push(stmt);
        self.touch();
        Ok(())
    }

    /// Send all staged writes. Bind resolution sees the session as flushing
    /// for the duration.
    ///
    /// If a statement fails, it and every statement after it stay staged and
    /// the session refuses further work until [`Session::rollback`].
    pub fn flush(&mut self) -> Result<usize> {
        self.ensure_flushable()?;
        if self.pending.is_empty() {
            return Ok(0);
        }

        let pending = std::mem::take(&mut self.pending);
        debug!("Session {} flushing {} statements", self.id, pending.len());

        self.flushing = true;
        let mut total = 0;
        let mut failure = None;
        for (idx, stmt) in pending.iter().enumerate() {
            match self.run(stmt, run_execute) {
                Ok(n) => total += n,
                Err(e) => {
                    failure = Some((idx, e));
                    break;
                }
            }
        }
        self.flushing = false;

        match failure {
            None => Ok(total),
            Some((idx, e)) => {
                warn!(
                    "Session {} flush failed at statement {} of {}, rollback required: {}",
                    self.id,
                    idx + 1,
                    pending.len(),
                    e
                );
                self.pending = pending.into_iter().skip(idx).collect();
                self.flush_failed = true;
                Err(e)
            }
        }
    }

    /// Run a statement immediately, returning the number of affected rows.
    pub fn execute(&mut self, stmt: impl Into<Statement>) -> Result<usize> {
        let stmt = stmt.into();
        self.prepare_statement(&stmt)?;
        self.run(&stmt, run_execute)
    }

    /// Run a row-returning statement.
    pub fn query(&mut self, stmt: impl Into<Statement>) -> Result<QueryResult> {
        let stmt = stmt.into();
        self.prepare_statement(&stmt)?;
        self.run(&stmt, run_query)
    }

    /// The engine a statement would be bound to right now.
    pub fn bind_for(&self, stmt: &Statement) -> Result<Arc<Engine>> {
        self.ensure_usable()?;
        self.resolver.resolve(&BindContext::new(stmt, self.flushing, &self.info))
    }

    pub fn commit(&mut self) -> Result<()> {
        self.flush()?;

        for entry in self.connections.iter_mut().filter(|c| c.in_transaction) {
            if let Err(e) = entry.conn.execute_batch("COMMIT") {
                // A failed COMMIT may leave the transaction open (e.g. deferred
                // foreign keys); keep tracking it so a rollback can follow.
                entry.in_transaction = !entry.conn.is_autocommit();
                return Err(e.into());
            }
            entry.in_transaction = false;
            entry.engine.record_commit();
            debug!("Session {} committed on engine {}", self.id, entry.engine.name());
        }
        Ok(())
    }

    /// Discard staged writes and roll back every open transaction. All
    /// engines are attempted; the first failure is returned.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.pending.clear();
        self.flush_failed = false;

        let mut first_error = None;
        for entry in self.connections.iter_mut().filter(|c| c.in_transaction) {
            entry.in_transaction = false;
            if entry.conn.is_autocommit() {
                continue;
            }
            match entry.conn.execute_batch("ROLLBACK") {
                Ok(()) => {
                    entry.engine.record_rollback();
                    debug!("Session {} rolled back on engine {}", self.id, entry.engine.name());
                }
                Err(e) => {
                    warn!("Session {} rollback failed on engine {}: {}", self.id, entry.engine.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Roll back anything uncommitted, return all connections to their pools
    /// and clear the session info, detaching the request. Closing a closed session is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let result = if self.in_transaction() {
            self.rollback()
        } else {
            self.pending.clear();
            Ok(())
        };

        self.connections.clear();
        self.info.clear();
        self.flushing = false;
        self.flush_failed = false;
        self.state = SessionState::Closed;
        debug!("Session {} closed", self.id);
        result
    }

    pub(crate) fn begin_finalizing(&mut self) {
        if self.state.is_usable() {
            self.state = SessionState::Finalizing;
        }
    }

    fn prepare_statement(&mut self, stmt: &Statement) -> Result<()> {
        self.ensure_flushable()?;
        check_statement(stmt)?;
        if self.autoflush {
            self.flush()?;
        }
        Ok(())
    }

    fn run<T>(&mut self, stmt: &Statement, op: fn(&Connection, &Statement) -> Result<T>) -> Result<T> {
        let engine = self.resolver.resolve(&BindContext::new(stmt, self.flushing, &self.info))?;
        debug!("Session {} binds {:?} statement to engine {}", self.id, stmt.kind(), engine.name());

        self.touch();
        let entry = self.connection_for(&engine)?;
        let result = op(&*entry.conn, stmt);
        self.last_bind = Some(engine);
        result
    }

    fn connection_for(&mut self, engine: &Arc<Engine>) -> Result<&mut EngineConnection> {
        let idx = match self.connections.iter().position(|c| c.engine.id() == engine.id()) {
            Some(idx) => idx,
            None => {
                let conn = engine.acquire()?;
                self.connections.push(EngineConnection {
                    engine: engine.clone(),
                    conn,
                    in_transaction: false,
                });
                self.connections.len() - 1
            }
        };

        let entry = &mut self.connections[idx];
        if !entry.in_transaction {
            entry.conn.execute_batch("BEGIN")?;
            entry.in_transaction = true;
        }
        Ok(entry)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state.is_usable() {
            Ok(())
        } else {
            Err(ReqSessionError::SessionClosed)
        }
    }

    fn ensure_flushable(&self) -> Result<()> {
        self.ensure_usable()?;
        if self.flush_failed {
            return Err(ReqSessionError::PendingRollback);
        }
        Ok(())
    }

    fn touch(&mut self) {
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if self.in_transaction() || !self.pending.is_empty() {
            warn!("Session {} dropped while {}, rolling back", self.id, self.state);
        }
        if let Err(e) = self.close() {
            warn!("Failed to close dropped session {}: {}", self.id, e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("info", &self.info)
            .field("engines", &self.engines().map(|e| e.name()).collect::<Vec<_>>())
            .field("pending", &self.pending.len())
            .field("flushing", &self.flushing)
            .field("flush_failed", &self.flush_failed)
            .finish()
    }
}

fn check_statement(stmt: &Statement) -> Result<()> {
    if stmt.kind() == StatementKind::Transaction {
        return Err(ReqSessionError::InvalidStatement(format!(
            "transaction control is managed by the session: {}",
            stmt.sql()
        )));
    }
    Ok(())
}

fn run_execute(conn: &Connection, stmt: &Statement) -> Result<usize> {
    let mut prepared = conn.prepare(stmt.sql())?;
    Ok(prepared.execute(params_from_iter(stmt.params().iter()))?)
}

fn run_query(conn: &Connection, stmt: &Statement) -> Result<QueryResult> {
    let mut prepared = conn.prepare(stmt.sql())?;
    let columns: Vec<String> = prepared.column_names().iter().map(|s| s.to_string()).collect();
    let column_count = columns.len();

    let rows = prepared.query_map(params_from_iter(stmt.params().iter()), |row| {
        (0..column_count)
            .map(|i| row.get::<_, Value>(i))
            .collect::<rusqlite::Result<Vec<_>>>()
    })?;

    let mut result_rows = Vec::new();
    for row_result in rows {
        result_rows.push(row_result?);
    }

    Ok(QueryResult {
        columns,
        rows: result_rows,
    })
}
