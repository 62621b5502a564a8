// Module for session management
pub mod request_session;
pub mod state;
pub mod statement;

pub use request_session::Session;
pub use state::{RequestBinding, SessionInfo, SessionState};
pub use statement::{QueryResult, Statement, StatementKind};
