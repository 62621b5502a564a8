// Module for database engines and their roles
pub mod pool;
pub mod registry;
pub mod role;

pub use pool::{Engine, EngineId, PoolStats, PooledConnection};
pub use registry::EngineRegistry;
pub use role::{EngineRole, IntoRole};
