mod common;
use common::*;

use std::collections::HashMap;

use reqsession::{Manager, ReqSessionError, Request, SessionCleanup, SessionOptions, SessionState, Statement};

#[test]
fn test_scope_commits_on_success() {
    let db = TestDb::new();
    let primary = db.engine("primary");
    let manager = Manager::new(primary.clone());

    let names = manager
        .session_scope(None, |session| -> reqsession::Result<Vec<String>> {
            session.add(insert("Rust"))?;
            session.add(insert("Go"))?;
            let result = session.query("SELECT name FROM languages ORDER BY id")?;
            let rows = result.to_json();
            Ok(rows
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|row| row["name"].as_str().map(str::to_string))
                .collect())
        })
        .unwrap();

    assert_eq!(names, vec!["Rust", "Go"]);
    assert_eq!(count(&primary), 2);
}

#[test]
fn test_scope_rolls_back_on_error() {
    let db = TestDb::new();
    let primary = db.engine("primary");
    let manager = Manager::new(primary.clone());

    let result = manager.session_scope(None, |session| -> anyhow::Result<()> {
        session.execute(insert("Rust"))?;
        anyhow::bail!("handler failed");
    });

    assert_eq!(result.unwrap_err().to_string(), "handler failed");
    assert_eq!(count(&primary), 0);
    assert_eq!(primary.stats().rollbacks, 1);
    assert_eq!(primary.stats().checked_out, 0);
}

#[test]
fn test_scope_rolls_back_on_panic() {
    let db = TestDb::new();
    let primary = db.engine("primary");
    let manager = Manager::new(primary.clone());

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _: reqsession::Result<()> = manager.session_scope(None, |session| {
            session.execute(insert("Rust"))?;
            panic!("handler panicked");
        });
    }));

    assert!(outcome.is_err());
    assert_eq!(count(&primary), 0);
    assert_eq!(primary.stats().checked_out, 0);
}

#[test]
fn test_scope_honours_cleanup_mode() {
    let db = TestDb::new();
    let primary = db.engine("primary");
    let manager = Manager::with_options(
        primary.clone(),
        SessionOptions {
            session_cleanup: SessionCleanup::Rollback,
            ..SessionOptions::default()
        },
    );

    manager
        .session_scope(None, |session| session.execute(insert("Rust")))
        .unwrap();
    assert_eq!(count(&primary), 0);

    manager.update_session_options(|options| options.session_cleanup = SessionCleanup::Commit);
    let result: reqsession::Result<()> = manager.session_scope(None, |session| {
        session.execute(insert("Rust"))?;
        Err(ReqSessionError::InvalidStatement("handler failed".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(count(&primary), 1);
}

#[test]
fn test_closed_session_is_terminal() {
    let db = TestDb::new();
    let manager = Manager::new(db.engine("primary"));

    let mut session = manager.get_session(None);
    session.execute(insert("Rust")).unwrap();
    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(session.execute(insert("Go")), Err(ReqSessionError::SessionClosed)));

    // Finalizing an already closed session changes nothing
    manager.close_session(session, true).unwrap();
}

#[test]
fn test_request_binding_cleared_at_finalization() {
    let db = TestDb::new();
    let manager = Manager::new(db.engine("primary"));
    let req = Request::new("GET", "/languages");

    let mut session = manager.get_session(Some(&req));
    session.info_mut().insert("tenant", serde_json::json!("acme"));
    assert_eq!(session.info().request().map(|b| b.method.as_str()), Some("GET"));

    session.close().unwrap();
    assert!(session.info().request().is_none());
    assert!(session.info().get("tenant").is_none());
}

#[tokio::test]
async fn test_scoped_guard_across_await() {
    let db = TestDb::new();
    let primary = db.engine("primary");
    let manager = Manager::new(primary.clone());

    let mut scoped = manager.scoped(None);
    scoped.execute(insert("Rust")).unwrap();
    tokio::task::yield_now().await;
    scoped.execute(insert("Go")).unwrap();
    scoped.finish(true).unwrap();
    assert_eq!(count(&primary), 2);

    let handle = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut scoped = manager.scoped(None);
            scoped.execute(insert("C")).unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            scoped.finish(true)
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    assert_eq!(count(&primary), 2);
    assert_eq!(primary.stats().checked_out, 0);
}

#[test]
fn test_custom_binds_route_by_table() {
    let db = TestDb::new();
    let primary = db.engine("primary");
    let archive = db.engine("archive");
    let manager = Manager::with_binds(
        primary.clone(),
        HashMap::from([("archived_languages".to_string(), archive.clone())]),
        SessionOptions::default(),
    );
    archive
        .acquire()
        .unwrap()
        .execute_batch("CREATE TABLE archived_languages (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
        .unwrap();

    let req = Request::new("POST", "/languages");
    let mut session = manager.get_session(Some(&req));
    session.execute(insert("Rust").on_table("languages")).unwrap();
    assert_eq!(session.last_bind().unwrap().id(), primary.id());
    session
        .execute(
            Statement::new("INSERT INTO archived_languages (name) VALUES (?1)")
                .bind("COBOL".to_string())
                .on_table("archived_languages"),
        )
        .unwrap();
    assert_eq!(session.last_bind().unwrap().id(), archive.id());
    assert_eq!(session.engines().count(), 2);
    manager.close_session(session, true).unwrap();

    assert_eq!(count(&primary), 1);
    assert_eq!(primary.stats().commits, 1);
    assert_eq!(archive.stats().commits, 1);
}
