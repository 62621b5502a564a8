use clap::{ArgAction, Parser, ValueEnum};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::EngineRole;
use crate::middleware::RequestId;
use crate::{ReqSessionError, Result};

/// HTTP methods that by default do not require a DB session.
pub const NO_SESSION_METHODS: &[&str] = &["OPTIONS", "TRACE"];

/// HTTP methods that do not alter server state and are fine with read replicas.
pub const SAFE_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS", "TRACE"];

/// Session cleanup behavior applied when a request-bound session is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SessionCleanup {
    /// Commit if the request succeeded, roll back otherwise.
    #[default]
    #[value(name = "default")]
    CommitOnSuccess,
    Commit,
    Rollback,
    /// Neither commit nor roll back; the handler finalized explicitly.
    #[value(name = "close")]
    CloseOnly,
}

impl SessionCleanup {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionCleanup::CommitOnSuccess => "default",
            SessionCleanup::Commit => "commit",
            SessionCleanup::Rollback => "rollback",
            SessionCleanup::CloseOnly => "close",
        }
    }
}

impl fmt::Display for SessionCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type RequestIdFn = Arc<dyn Fn() -> RequestId + Send + Sync>;

/// Per-manager session options.
///
/// Options are swapped as a whole on the manager, so a running request always
/// sees one consistent set.
#[derive(Clone)]
pub struct SessionOptions {
    pub no_session_methods: HashSet<String>,
    pub safe_methods: HashSet<String>,
    pub read_from_rw_engines: bool,
    pub write_to_rw_engines: bool,
    pub write_engine_if_flushing: bool,
    pub sticky_binds: bool,
    pub wrap_response_stream: bool,
    pub session_cleanup: SessionCleanup,
    pub request_id_func: RequestIdFn,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            no_session_methods: NO_SESSION_METHODS.iter().map(|m| m.to_string()).collect(),
            safe_methods: SAFE_METHODS.iter().map(|m| m.to_string()).collect(),
            read_from_rw_engines: true,
            write_to_rw_engines: true,
            write_engine_if_flushing: true,
            sticky_binds: false,
            wrap_response_stream: true,
            session_cleanup: SessionCleanup::default(),
            request_id_func: Arc::new(|| RequestId::from(uuid::Uuid::new_v4())),
        }
    }
}

impl SessionOptions {
    /// Method sets are matched ignoring ASCII case, on both sides.
    pub fn needs_session(&self, method: &str) -> bool {
        !contains_method(&self.no_session_methods, method)
    }

    pub fn is_safe_method(&self, method: &str) -> bool {
        contains_method(&self.safe_methods, method)
    }

    pub fn new_request_id(&self) -> RequestId {
        (self.request_id_func)()
    }

    pub fn with_request_id_func<F>(mut self, func: F) -> Self
    where
        F: Fn() -> RequestId + Send + Sync + 'static,
    {
        self.request_id_func = Arc::new(func);
        self
    }
}

fn contains_method(methods: &HashSet<String>, method: &str) -> bool {
    methods.contains(method) || methods.iter().any(|m| m.eq_ignore_ascii_case(method))
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut no_session: Vec<_> = self.no_session_methods.iter().collect();
        no_session.sort();
        let mut safe: Vec<_> = self.safe_methods.iter().collect();
        safe.sort();

        f.debug_struct("SessionOptions")
            .field("no_session_methods", &no_session)
            .field("safe_methods", &safe)
            .field("read_from_rw_engines", &self.read_from_rw_engines)
            .field("write_to_rw_engines", &self.write_to_rw_engines)
            .field("write_engine_if_flushing", &self.write_engine_if_flushing)
            .field("sticky_binds", &self.sticky_binds)
            .field("wrap_response_stream", &self.wrap_response_stream)
            .field("session_cleanup", &self.session_cleanup)
            .finish_non_exhaustive()
    }
}

/// Settings applied to every connection an engine opens.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pool_size: usize,
    pub busy_timeout: Duration,
    pub journal_mode: String,
    pub synchronous: String,
    pub foreign_keys: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout: Duration::from_millis(5000),
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            foreign_keys: true,
        }
    }
}

/// A `name=path[@role]` engine declaration from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    pub name: String,
    pub path: String,
    pub role: EngineRole,
}

impl EngineSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (name, rest) = spec.split_once('=').ok_or_else(|| {
            ReqSessionError::Configuration(format!("engine spec {spec:?} must look like name=path[@role]"))
        })?;
        if name.is_empty() || rest.is_empty() {
            return Err(ReqSessionError::Configuration(format!(
                "engine spec {spec:?} has an empty name or path"
            )));
        }

        let (path, role) = match rest.rsplit_once('@') {
            Some((path, role)) => (path, role.parse()?),
            None => (rest, EngineRole::Read),
        };

        Ok(EngineSpec {
            name: name.to_string(),
            path: path.to_string(),
            role,
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "reqsession")]
#[command(about = "reqsession - request-scoped SQLite sessions with read/write engine routing", long_about = None)]
pub struct Config {
    #[arg(short, long, default_value = "reqsession.db", env = "REQSESSION_DATABASE", help = "Primary (read-write) database")]
    pub database: String,

    #[arg(long = "engine", env = "REQSESSION_ENGINES", value_delimiter = ',', help = "Additional engine as name=path[@r|w|rw], may be repeated")]
    pub engines: Vec<String>,

    #[arg(long, default_value = "info", env = "REQSESSION_LOG_LEVEL")]
    pub log_level: String,

    // Simulated request
    #[arg(short, long, default_value = "GET", help = "HTTP method of the simulated request")]
    pub method: String,

    #[arg(long = "sql", help = "Statement to run inside the simulated request, may be repeated")]
    pub statements: Vec<String>,

    // Session options
    #[arg(long, value_enum, default_value_t = SessionCleanup::CommitOnSuccess, env = "REQSESSION_SESSION_CLEANUP")]
    pub session_cleanup: SessionCleanup,

    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "REQSESSION_READ_FROM_RW_ENGINES")]
    pub read_from_rw_engines: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "REQSESSION_WRITE_TO_RW_ENGINES")]
    pub write_to_rw_engines: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "REQSESSION_WRITE_ENGINE_IF_FLUSHING")]
    pub write_engine_if_flushing: bool,

    #[arg(long, env = "REQSESSION_STICKY_BINDS", help = "Pin every statement of a request to one engine")]
    pub sticky_binds: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "REQSESSION_WRAP_RESPONSE_STREAM")]
    pub wrap_response_stream: bool,

    // Engine settings
    #[arg(long, default_value = "8", env = "REQSESSION_POOL_SIZE", help = "Maximum checked-out connections per engine")]
    pub pool_size: usize,

    #[arg(long, default_value = "5000", env = "REQSESSION_BUSY_TIMEOUT_MS")]
    pub busy_timeout_ms: u64,

    #[arg(long, default_value = "WAL", env = "REQSESSION_JOURNAL_MODE", help = "SQLite journal mode (WAL, DELETE, TRUNCATE, etc.)")]
    pub pragma_journal_mode: String,

    #[arg(long, default_value = "NORMAL", env = "REQSESSION_SYNCHRONOUS", help = "SQLite synchronous mode (NORMAL, FULL, OFF)")]
    pub pragma_synchronous: String,
}

impl Config {
    /// Get a configuration instance with all values resolved from CLI args and environment variables
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_from_rw_engines: self.read_from_rw_engines,
            write_to_rw_engines: self.write_to_rw_engines,
            write_engine_if_flushing: self.write_engine_if_flushing,
            sticky_binds: self.sticky_binds,
            wrap_response_stream: self.wrap_response_stream,
            session_cleanup: self.session_cleanup,
            ..SessionOptions::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pool_size: self.pool_size,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            journal_mode: self.pragma_journal_mode.clone(),
            synchronous: self.pragma_synchronous.clone(),
            ..EngineConfig::default()
        }
    }

    pub fn engine_specs(&self) -> Result<Vec<EngineSpec>> {
        self.engines.iter().map(|spec| EngineSpec::parse(spec)).collect()
    }
}
