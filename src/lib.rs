pub mod bind;
pub mod config;
pub mod engine;
pub mod manager;
pub mod middleware;
pub mod session;

use thiserror::Error;

pub use bind::{BindContext, BindResolver, BindSelector};
pub use config::{Config, EngineConfig, SessionCleanup, SessionOptions};
pub use engine::{Engine, EngineId, EngineRegistry, EngineRole, IntoRole};
pub use manager::{Manager, ScopedSession};
pub use middleware::{Body, BodyRead, BodyStream, Middleware, Request, RequestContext, RequestId, Response};
pub use session::{QueryResult, RequestBinding, Session, SessionState, Statement, StatementKind};

#[derive(Error, Debug)]
pub enum ReqSessionError {
    #[error("Invalid engine role {0:?}: role must be one of ('r', 'rw', 'w')")]
    InvalidRole(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("No engine available to bind {0}")]
    BindResolution(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("A previous flush failed; the session must be rolled back first")]
    PendingRollback,

    #[error("No session attached to this request")]
    NoSession,

    #[error("Invalid statement: {0}")]
    InvalidStatement(String),

    #[error("Engine pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReqSessionError>;

impl ReqSessionError {
    /// Configuration errors are raised at setup time and are never
    /// recoverable per request.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ReqSessionError::InvalidRole(_)
                | ReqSessionError::Configuration(_)
                | ReqSessionError::BindResolution(_)
        )
    }
}
