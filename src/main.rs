use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::info;

use reqsession::config::Config;
use reqsession::{Engine, Manager, Request, Response, Statement};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .init();

    info!("reqsession v{}", env!("CARGO_PKG_VERSION"));

    let engine_config = config.engine_config();
    let primary = Engine::open("primary", &config.database, engine_config.clone())
        .with_context(|| format!("Failed to open primary database {}", config.database))?;
    let manager = Manager::with_options(primary, config.session_options());

    for spec in config.engine_specs()? {
        let engine = Engine::open(&spec.name, &spec.path, engine_config.clone())
            .with_context(|| format!("Failed to open engine {} at {}", spec.name, spec.path))?;
        manager.add_engine(engine, spec.role)?;
        info!("Engine {} registered at {} with role {}", spec.name, spec.path, spec.role);
    }

    // Sessions run blocking SQLite calls
    let report = tokio::task::spawn_blocking(move || simulate_request(&manager, &config)).await??;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

/// Push one request through the middleware and report which engine served
/// each statement.
fn simulate_request(manager: &Manager, config: &Config) -> Result<Value> {
    let middleware = manager.middleware();
    let mut req = Request::new(&config.method, "/");
    let mut resp = Response::new();

    let statements = middleware.dispatch(&mut req, &mut resp, |req, _resp| -> Result<Vec<Value>> {
        let Some(session) = req.context.session.as_mut() else {
            info!("{} requests get no session, skipping statements", req.method());
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        for sql in &config.statements {
            let stmt = Statement::new(sql.as_str());
            let result = if stmt.kind().returns_rows() {
                session.query(stmt)?.to_json()
            } else {
                json!({ "affected": session.execute(stmt)? })
            };
            results.push(json!({
                "sql": sql,
                "engine": session.last_bind().map(|e| e.name().to_string()),
                "result": result,
            }));
        }
        Ok(results)
    })?;

    let engines: Vec<Value> = manager
        .registry()
        .engines()
        .map(|(engine, role)| {
            json!({
                "name": engine.name(),
                "target": engine.target(),
                "role": role.as_str(),
                "stats": engine.stats(),
            })
        })
        .collect();

    Ok(json!({
        "method": req.method(),
        "request_id": req.context.request_id.as_ref().map(|id| id.to_string()),
        "cleanup": manager.session_options().session_cleanup.as_str(),
        "statements": statements,
        "engines": engines,
    }))
}
