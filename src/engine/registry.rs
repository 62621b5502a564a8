use std::sync::Arc;
use tracing::{debug, warn};

use crate::engine::{Engine, EngineId, EngineRole, IntoRole};
use crate::Result;

/// Registered engines, their roles, and the derived read/write candidate
/// sequences.
///
/// The registry is treated as an immutable snapshot once published by the
/// manager; registration clones it, mutates the clone and swaps it in.
#[derive(Debug, Clone)]
pub struct EngineRegistry {
    primary: Arc<Engine>,
    /// Insertion-ordered role map, primary first.
    roles: Vec<(Arc<Engine>, EngineRole)>,
    read_from_rw_engines: bool,
    write_to_rw_engines: bool,
    read_engines: Vec<Arc<Engine>>,
    write_engines: Vec<Arc<Engine>>,
}

impl EngineRegistry {
    pub fn new(primary: Arc<Engine>) -> Self {
        let mut registry = EngineRegistry {
            roles: vec![(primary.clone(), EngineRole::ReadWrite)],
            primary,
            read_from_rw_engines: true,
            write_to_rw_engines: true,
            read_engines: Vec::new(),
            write_engines: Vec::new(),
        };
        registry.rebuild();
        registry
    }

    /// Register an engine under a role. Re-registering an engine overwrites
    /// its role and keeps its original position.
    pub fn register(&mut self, engine: Arc<Engine>, role: impl IntoRole) -> Result<()> {
        let role = role.into_role()?;

        match self.roles.iter_mut().find(|(e, _)| e.id() == engine.id()) {
            Some(entry) => {
                debug!("Engine {} re-registered: {} -> {}", engine.name(), entry.1, role);
                entry.1 = role;
            }
            None => {
                debug!("Engine {} registered with role {}", engine.name(), role);
                self.roles.push((engine, role));
            }
        }

        self.rebuild();
        Ok(())
    }

    /// Change the role-preference policy and recompute the candidates.
    pub fn set_preferences(&mut self, read_from_rw_engines: bool, write_to_rw_engines: bool) {
        if self.read_from_rw_engines == read_from_rw_engines
            && self.write_to_rw_engines == write_to_rw_engines
        {
            return;
        }

        self.read_from_rw_engines = read_from_rw_engines;
        self.write_to_rw_engines = write_to_rw_engines;
        self.rebuild();
    }

    pub fn primary(&self) -> &Arc<Engine> {
        &self.primary
    }

    pub fn read_from_rw_engines(&self) -> bool {
        self.read_from_rw_engines
    }

    pub fn write_to_rw_engines(&self) -> bool {
        self.write_to_rw_engines
    }

    pub fn read_candidates(&self) -> &[Arc<Engine>] {
        &self.read_engines
    }

    pub fn write_candidates(&self) -> &[Arc<Engine>] {
        &self.write_engines
    }

    pub fn role_of(&self, id: EngineId) -> Option<EngineRole> {
        self.roles.iter().find(|(e, _)| e.id() == id).map(|(_, role)| *role)
    }

    pub fn engines(&self) -> impl Iterator<Item = (&Arc<Engine>, EngineRole)> {
        self.roles.iter().map(|(engine, role)| (engine, *role))
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    fn rebuild(&mut self) {
        let readers: Vec<_> = self
            .roles
            .iter()
            .filter(|(_, role)| role.can_read())
            .map(|(engine, _)| engine.clone())
            .collect();
        let writers: Vec<_> = self
            .roles
            .iter()
            .filter(|(_, role)| role.can_write())
            .map(|(engine, _)| engine.clone())
            .collect();

        let readers = if self.read_from_rw_engines {
            readers
        } else {
            self.filter_by_role(readers, EngineRole::Read)
        };
        let writers = if self.write_to_rw_engines {
            writers
        } else {
            self.filter_by_role(writers, EngineRole::Write)
        };

        self.read_engines = self.non_empty(readers, "read");
        self.write_engines = self.non_empty(writers, "write");
    }

    /// Keep only engines whose role is exactly `role`, unless none are.
    fn filter_by_role(&self, engines: Vec<Arc<Engine>>, role: EngineRole) -> Vec<Arc<Engine>> {
        let filtered: Vec<_> = engines
            .iter()
            .filter(|engine| self.role_of(engine.id()) == Some(role))
            .cloned()
            .collect();

        if filtered.is_empty() { engines } else { filtered }
    }

    fn non_empty(&self, engines: Vec<Arc<Engine>>, purpose: &str) -> Vec<Arc<Engine>> {
        if engines.is_empty() {
            // Only reachable when the primary itself was re-registered away
            // from this capability.
            warn!(
                "No {} engines registered, falling back to primary engine {}",
                purpose,
                self.primary.name()
            );
            return vec![self.primary.clone()];
        }
        engines
    }
}
