use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bind::{BindContext, BindResolver, BindSelector, PrimaryBind, TableBinds, is_write_intent};
use crate::config::{SessionCleanup, SessionOptions};
use crate::engine::{Engine, EngineRegistry, EngineRole, IntoRole};
use crate::middleware::{Middleware, Request};
use crate::session::{RequestBinding, Session, SessionInfo};
use crate::{ReqSessionError, Result};

struct ManagerInner {
    registry: RwLock<Arc<EngineRegistry>>,
    options: RwLock<Arc<SessionOptions>>,
    binds: Option<Arc<TableBinds>>,
}

/// Hands out sessions bound to the registered engines and finalizes them.
///
/// Cloning is cheap; all clones share the same registry and options. Both
/// are published as snapshots, so engines may be registered while requests
/// are in flight.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self::with_options(engine, SessionOptions::default())
    }

    pub fn with_options(engine: Arc<Engine>, options: SessionOptions) -> Self {
        Self::build(engine, options, None)
    }

    /// A manager whose sessions route by table. The automatic read/write
    /// routing is never installed for such a manager; unmapped tables go to
    /// `engine`.
    pub fn with_binds(engine: Arc<Engine>, binds: HashMap<String, Arc<Engine>>, options: SessionOptions) -> Self {
        let binds = TableBinds::new(binds, engine.clone());
        let binds = if binds.is_empty() { None } else { Some(Arc::new(binds)) };
        Self::build(engine, options, binds)
    }

    fn build(engine: Arc<Engine>, options: SessionOptions, binds: Option<Arc<TableBinds>>) -> Self {
        let mut registry = EngineRegistry::new(engine);
        registry.set_preferences(options.read_from_rw_engines, options.write_to_rw_engines);
        info!(
            "Session manager created on engine {} (cleanup: {}, custom binds: {})",
            registry.primary().name(),
            options.session_cleanup,
            binds.is_some()
        );

        Manager {
            inner: Arc::new(ManagerInner {
                registry: RwLock::new(Arc::new(registry)),
                options: RwLock::new(Arc::new(options)),
                binds,
            }),
        }
    }

    /// Register an additional engine. `role` accepts an [`EngineRole`] or one
    /// of the strings `r`, `w`, `rw`.
    pub fn add_engine(&self, engine: Arc<Engine>, role: impl IntoRole) -> Result<()> {
        let role = role.into_role()?;
        let mut current = self.inner.registry.write();
        let mut next = EngineRegistry::clone(&current);
        next.register(engine, role)?;
        *current = Arc::new(next);
        Ok(())
    }

    /// Register a read-only engine.
    pub fn add_engine_default(&self, engine: Arc<Engine>) -> Result<()> {
        self.add_engine(engine, EngineRole::Read)
    }

    pub fn registry(&self) -> Arc<EngineRegistry> {
        self.inner.registry.read().clone()
    }

    pub fn primary(&self) -> Arc<Engine> {
        self.registry().primary().clone()
    }

    pub fn read_engines(&self) -> Vec<Arc<Engine>> {
        self.registry().read_candidates().to_vec()
    }

    pub fn write_engines(&self) -> Vec<Arc<Engine>> {
        self.registry().write_candidates().to_vec()
    }

    pub fn has_custom_binds(&self) -> bool {
        self.inner.binds.is_some()
    }

    pub fn session_options(&self) -> Arc<SessionOptions> {
        self.inner.options.read().clone()
    }

    /// Replace the options. Sessions already handed out keep the options
    /// they were created with.
    pub fn set_session_options(&self, options: SessionOptions) {
        {
            let mut current = self.inner.registry.write();
            if current.read_from_rw_engines() != options.read_from_rw_engines
                || current.write_to_rw_engines() != options.write_to_rw_engines
            {
                let mut next = EngineRegistry::clone(&current);
                next.set_preferences(options.read_from_rw_engines, options.write_to_rw_engines);
                *current = Arc::new(next);
            }
        }
        *self.inner.options.write() = Arc::new(options);
    }

    pub fn update_session_options<F>(&self, update: F)
    where
        F: FnOnce(&mut SessionOptions),
    {
        let mut options = SessionOptions::clone(&self.session_options());
        update(&mut options);
        self.set_session_options(options);
    }

    pub fn middleware(&self) -> Middleware {
        Middleware::new(self.clone())
    }

    /// Create a session. With a request, statements are routed by the
    /// request's method and sticky key; without one everything goes to the
    /// primary engine.
    pub fn get_session(&self, request: Option<&Request>) -> Session {
        let info = SessionInfo::new(request.map(RequestBinding::from_request));

        let resolver: Arc<dyn BindResolver> = match (&self.inner.binds, request) {
            (Some(binds), _) => binds.clone(),
            (None, Some(_)) => Arc::new(ManagerBinds {
                inner: self.inner.clone(),
                options: self.session_options(),
            }),
            (None, None) => Arc::new(PrimaryBind::new(self.primary())),
        };

        Session::new(resolver, info)
    }

    /// Finalize a session according to the configured cleanup mode, then
    /// close it. Runs exactly once per session since the session is consumed.
    ///
    /// A failed commit is rolled back before its error is returned; if that
    /// rollback fails too, the rollback error is returned instead. The
    /// session is closed in every case.
    pub fn close_session(&self, mut session: Session, succeeded: bool) -> Result<()> {
        if session.is_closed() {
            debug!("Session {} already closed", session.id());
            return Ok(());
        }

        let cleanup = self.session_options().session_cleanup;
        debug!(
            "Finalizing session {} (cleanup: {}, succeeded: {})",
            session.id(),
            cleanup,
            succeeded
        );

        session.begin_finalizing();
        let outcome = match cleanup {
            SessionCleanup::CommitOnSuccess if succeeded => commit_or_rollback(&mut session),
            SessionCleanup::CommitOnSuccess | SessionCleanup::Rollback => session.rollback(),
            SessionCleanup::Commit => commit_or_rollback(&mut session),
            SessionCleanup::CloseOnly => Ok(()),
        };

        let closed = session.close();
        outcome.and(closed)
    }

    /// Run `f` with a fresh session and finalize it with the observed
    /// outcome. A panic in `f` rolls the session back as it unwinds.
    ///
    /// The closure's error is never replaced by a finalization error; the
    /// latter is logged instead.
    pub fn session_scope<T, E, F>(&self, request: Option<&Request>, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Session) -> std::result::Result<T, E>,
        E: From<ReqSessionError>,
    {
        let mut session = self.get_session(request);
        match f(&mut session) {
            Ok(value) => {
                self.close_session(session, true)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(close_err) = self.close_session(session, false) {
                    warn!("Failed to finalize session after error: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// A session guard usable across `.await` points. Call
    /// [`ScopedSession::finish`] to finalize; a guard dropped unfinished is
    /// finalized as failed.
    pub fn scoped(&self, request: Option<&Request>) -> ScopedSession {
        ScopedSession {
            manager: self.clone(),
            session: Some(self.get_session(request)),
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("registry", &self.registry())
            .field("options", &self.session_options())
            .field("custom_binds", &self.inner.binds)
            .finish()
    }
}

fn commit_or_rollback(session: &mut Session) -> Result<()> {
    if let Err(commit_err) = session.commit() {
        warn!("Commit failed for session {}, rolling back: {}", session.id(), commit_err);
        session.rollback()?;
        return Err(commit_err);
    }
    Ok(())
}

/// Routes request-bound sessions through the registry: write intent picks
/// the write candidates, anything else the read candidates.
struct ManagerBinds {
    inner: Arc<ManagerInner>,
    options: Arc<SessionOptions>,
}

impl BindResolver for ManagerBinds {
    fn resolve(&self, ctx: &BindContext<'_>) -> Result<Arc<Engine>> {
        let registry = self.inner.registry.read().clone();
        let Some(request) = ctx.info.request() else {
            return Ok(registry.primary().clone());
        };

        let write = is_write_intent(&self.options, &request.method, ctx);
        let candidates = if write {
            registry.write_candidates()
        } else {
            registry.read_candidates()
        };

        let selector = BindSelector::new(self.options.sticky_binds);
        let engine = selector.select(candidates, request.request_id.as_ref())?;
        debug!(
            "{} {:?} statement (write: {}) bound to {}",
            request.method,
            ctx.kind,
            write,
            engine.name()
        );
        Ok(engine.clone())
    }
}

impl std::fmt::Debug for ManagerBinds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerBinds")
            .field("sticky_binds", &self.options.sticky_binds)
            .finish_non_exhaustive()
    }
}

pub struct ScopedSession {
    manager: Manager,
    session: Option<Session>,
}

impl ScopedSession {
    pub fn finish(mut self, succeeded: bool) -> Result<()> {
        match self.session.take() {
            Some(session) => self.manager.close_session(session, succeeded),
            None => Ok(()),
        }
    }
}

impl Deref for ScopedSession {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect("scoped session used after finish")
    }
}

impl DerefMut for ScopedSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("scoped session used after finish")
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Scoped session {} dropped unfinished", session.id());
            if let Err(e) = self.manager.close_session(session, false) {
                warn!("Failed to finalize dropped scoped session: {}", e);
            }
        }
    }
}
