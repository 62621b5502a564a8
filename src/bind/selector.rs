use rand::seq::IndexedRandom;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::engine::Engine;
use crate::{ReqSessionError, Result};

/// Picks one engine out of a candidate sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindSelector {
    sticky_binds: bool,
}

impl BindSelector {
    pub fn new(sticky_binds: bool) -> Self {
        Self { sticky_binds }
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky_binds
    }

    /// Select an engine. A single candidate is returned as is; with sticky
    /// binds and a key the choice is a stable hash of the key; otherwise it
    /// is uniformly random.
    pub fn select<'a, K>(&self, candidates: &'a [Arc<Engine>], sticky_key: Option<&K>) -> Result<&'a Arc<Engine>>
    where
        K: Hash + ?Sized,
    {
        match candidates {
            [] => Err(ReqSessionError::BindResolution(
                "empty candidate sequence".to_string(),
            )),
            [only] => Ok(only),
            _ => match sticky_key {
                Some(key) if self.sticky_binds => Ok(&candidates[sticky_index(key, candidates.len())]),
                _ => candidates.choose(&mut rand::rng()).ok_or_else(|| {
                    ReqSessionError::BindResolution("empty candidate sequence".to_string())
                }),
            },
        }
    }
}

pub fn sticky_index<K: Hash + ?Sized>(key: &K, len: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % len as u64) as usize
}
