use std::sync::Arc;
use tempfile::TempDir;

use reqsession::config::EngineConfig;
use reqsession::{Engine, Manager, Middleware, Request, Response, SessionOptions, Statement};

/// A scratch directory holding file-backed engines, each with a
/// `languages` table.
pub struct TestDb {
    pub dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn engine(&self, name: &str) -> Arc<Engine> {
        let path = self.dir.path().join(format!("{name}.db"));
        let engine = Engine::open(name, path.to_str().unwrap(), EngineConfig::default()).unwrap();
        engine
            .acquire()
            .unwrap()
            .execute_batch("CREATE TABLE IF NOT EXISTS languages (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .unwrap();
        engine
    }
}

/// A primary engine and a middleware over a manager with `options`.
#[allow(dead_code)]
pub fn setup(db: &TestDb, options: SessionOptions) -> (Arc<Engine>, Middleware) {
    let primary = db.engine("primary");
    let manager = Manager::with_options(primary.clone(), options);
    (primary, manager.middleware())
}

pub fn insert(name: &str) -> Statement {
    Statement::new("INSERT INTO languages (name) VALUES (?1)").bind(name.to_string())
}

/// Row count straight from the engine, outside of any session.
#[allow(dead_code)]
pub fn count(engine: &Engine) -> i64 {
    engine
        .acquire()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM languages", [], |row| row.get(0))
        .unwrap()
}

/// Language names through a fresh GET request, in primary key order.
#[allow(dead_code)]
pub fn list_languages(middleware: &Middleware) -> Vec<String> {
    let mut req = Request::new("GET", "/languages");
    let mut resp = Response::new();
    middleware
        .dispatch(&mut req, &mut resp, |req, _resp| -> reqsession::Result<Vec<String>> {
            let result = req.context.session()?.query("SELECT name FROM languages ORDER BY id")?;
            Ok(result
                .rows
                .iter()
                .filter_map(|row| match &row[0] {
                    rusqlite::types::Value::Text(name) => Some(name.clone()),
                    _ => None,
                })
                .collect())
        })
        .unwrap()
}
