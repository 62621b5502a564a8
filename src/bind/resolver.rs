use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::config::SessionOptions;
use crate::engine::Engine;
use crate::session::{SessionInfo, Statement, StatementKind};
use crate::Result;

/// Everything a resolver may look at when choosing a bind for a statement.
#[derive(Debug, Clone, Copy)]
pub struct BindContext<'a> {
    pub statement: &'a Statement,
    pub kind: StatementKind,
    /// The session is flushing staged writes.
    pub flushing: bool,
    pub info: &'a SessionInfo,
}

impl<'a> BindContext<'a> {
    pub fn new(statement: &'a Statement, flushing: bool, info: &'a SessionInfo) -> Self {
        Self {
            statement,
            kind: statement.kind(),
            flushing,
            info,
        }
    }
}

/// Bind-resolution capability handed to every session at construction.
pub trait BindResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, ctx: &BindContext<'_>) -> Result<Arc<Engine>>;
}

/// Every statement goes to one engine. Used for ad hoc sessions.
#[derive(Debug, Clone)]
pub struct PrimaryBind {
    engine: Arc<Engine>,
}

impl PrimaryBind {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl BindResolver for PrimaryBind {
    fn resolve(&self, _ctx: &BindContext<'_>) -> Result<Arc<Engine>> {
        Ok(self.engine.clone())
    }
}

/// User-supplied table-to-engine binds with a default engine for anything
/// unmapped.
#[derive(Debug, Clone)]
pub struct TableBinds {
    binds: HashMap<String, Arc<Engine>>,
    default: Arc<Engine>,
}

impl TableBinds {
    pub fn new(binds: HashMap<String, Arc<Engine>>, default: Arc<Engine>) -> Self {
        Self { binds, default }
    }

    pub fn is_empty(&self) -> bool {
        self.binds.is_empty()
    }
}

impl BindResolver for TableBinds {
    fn resolve(&self, ctx: &BindContext<'_>) -> Result<Arc<Engine>> {
        let engine = ctx
            .statement
            .table()
            .and_then(|table| self.binds.get(table))
            .unwrap_or(&self.default);
        debug!("Custom bind for table {:?}: {}", ctx.statement.table(), engine.name());
        Ok(engine.clone())
    }
}

/// Whether a statement issued within a request of `method` must go to a
/// write-capable engine.
///
/// Read-looking methods still write through autoflush or explicit DML, and
/// those writes must never be routed to a read replica.
pub fn is_write_intent(options: &SessionOptions, method: &str, ctx: &BindContext<'_>) -> bool {
    if !options.is_safe_method(method) {
        return true;
    }
    options.write_engine_if_flushing && (ctx.flushing || ctx.kind.is_write())
}
