mod common;
use common::*;

use reqsession::{
    EngineRole, Manager, ReqSessionError, Request, RequestId, Response, SessionCleanup, SessionOptions,
    SessionState, Statement,
};

#[test]
fn test_committed_writes_visible_to_later_reads() {
    let db = TestDb::new();
    let (_primary, middleware) = setup(&db, SessionOptions::default());

    for name in ["Rust", "Go", "Python"] {
        let mut req = Request::new("POST", "/languages").with_param("name", name);
        let mut resp = Response::new();
        middleware
            .dispatch(&mut req, &mut resp, |req, resp| -> reqsession::Result<()> {
                let name = req.param("name").unwrap_or_default().to_string();
                let session = req.context.session()?;
                session.add(insert(&name))?;
                resp.status = 201;
                Ok(())
            })
            .unwrap();
        assert_eq!(resp.status, 201);
        assert!(req.context.session.is_none());
    }

    assert_eq!(list_languages(&middleware), vec!["Rust", "Go", "Python"]);
}

#[test]
fn test_failed_handler_rolls_back() {
    let db = TestDb::new();
    let (primary, middleware) = setup(&db, SessionOptions::default());

    let mut req = Request::new("POST", "/languages").with_param("zero_division", "");
    let mut resp = Response::new();
    let result = middleware.dispatch(&mut req, &mut resp, |req, _resp| -> reqsession::Result<()> {
        req.context.session()?.execute(insert("Rust"))?;
        if req.param_as_bool("zero_division") {
            return Err(ReqSessionError::InvalidStatement("division by zero".to_string()));
        }
        Ok(())
    });

    assert!(matches!(result, Err(ReqSessionError::InvalidStatement(_))));
    assert!(list_languages(&middleware).is_empty());
    assert_eq!(primary.stats().rollbacks, 1);
    assert_eq!(primary.stats().checked_out, 0);
}

#[test]
fn test_exempt_methods_get_no_session() {
    let db = TestDb::new();
    let (primary, middleware) = setup(&db, SessionOptions::default());

    for method in ["OPTIONS", "TRACE", "options"] {
        let mut req = Request::new(method, "/languages");
        let mut resp = Response::new();
        middleware.process_request(&mut req, &mut resp);
        assert!(req.context.session.is_none());
        assert!(matches!(req.context.session(), Err(ReqSessionError::NoSession)));
        middleware.process_response(&mut req, &mut resp, true).unwrap();
    }
    assert_eq!(primary.stats().checked_out, 0);
}

#[test]
fn test_sticky_request_id_assigned_once() {
    let db = TestDb::new();
    let options = SessionOptions {
        sticky_binds: true,
        ..SessionOptions::default()
    }
    .with_request_id_func(|| RequestId::from("generated"));
    let (_primary, middleware) = setup(&db, options);

    let mut req = Request::new("GET", "/languages");
    let mut resp = Response::new();
    middleware.process_request(&mut req, &mut resp);
    assert_eq!(req.context.request_id, Some(RequestId::from("generated")));
    let binding = req.context.session().unwrap().info().request().cloned().unwrap();
    assert_eq!(binding.request_id, Some(RequestId::from("generated")));
    middleware.process_response(&mut req, &mut resp, true).unwrap();

    let mut req = Request::new("GET", "/languages");
    req.context.request_id = Some(RequestId::from("upstream"));
    middleware.process_request(&mut req, &mut resp);
    assert_eq!(req.context.request_id, Some(RequestId::from("upstream")));
    middleware.process_response(&mut req, &mut resp, true).unwrap();
}

#[test]
fn test_no_request_id_without_sticky_binds() {
    let db = TestDb::new();
    let (_primary, middleware) = setup(&db, SessionOptions::default());

    let mut req = Request::new("GET", "/languages");
    let mut resp = Response::new();
    middleware.process_request(&mut req, &mut resp);
    assert!(req.context.request_id.is_none());
    middleware.process_response(&mut req, &mut resp, true).unwrap();
}

#[test]
fn test_safe_method_writes_go_to_writer() {
    let db = TestDb::new();
    let primary = db.engine("primary");
    let replica = db.engine("replica");
    let manager = Manager::new(primary.clone());
    manager.add_engine(replica.clone(), EngineRole::Read).unwrap();
    manager.update_session_options(|options| options.read_from_rw_engines = false);
    let middleware = manager.middleware();

    let mut req = Request::new("GET", "/languages");
    let mut resp = Response::new();
    middleware
        .dispatch(&mut req, &mut resp, |req, _resp| -> reqsession::Result<()> {
            let session = req.context.session()?;

            session.query("SELECT * FROM languages")?;
            assert_eq!(session.last_bind().unwrap().id(), replica.id());

            // Autoflush before the query runs against the writer
            session.add(insert("Rust"))?;
            session.query("SELECT * FROM languages")?;
            assert_eq!(session.bind_for(&Statement::new("SELECT 1"))?.id(), replica.id());

            session.execute("UPDATE languages SET name = 'Rust 2024'")?;
            assert_eq!(session.last_bind().unwrap().id(), primary.id());
            session.execute("DELETE FROM languages WHERE name = 'C'")?;
            assert_eq!(session.last_bind().unwrap().id(), primary.id());

            for sql in [
                "WITH d AS (SELECT 1) DELETE FROM languages WHERE name = 'C'",
                "/* app:rename */ UPDATE languages SET name = 'Rust' WHERE name = 'Rust 2024'",
                "-- cleanup\nDELETE FROM languages WHERE name = 'Go'",
            ] {
                assert_eq!(session.bind_for(&Statement::new(sql))?.id(), primary.id(), "{sql}");
                session.execute(sql)?;
                assert_eq!(session.last_bind().unwrap().id(), primary.id(), "{sql}");
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(count(&primary), 1);
    assert_eq!(count(&replica), 0);
    let name: String = primary
        .acquire()
        .unwrap()
        .query_row("SELECT name FROM languages", [], |row| row.get(0))
        .unwrap();
    assert_eq!(name, "Rust");
}

#[test]
fn test_unsafe_methods_always_use_writer() {
    let db = TestDb::new();
    let primary = db.engine("primary");
    let replica = db.engine("replica");
    let manager = Manager::new(primary.clone());
    manager.add_engine(replica.clone(), "r").unwrap();

    let req = Request::new("POST", "/languages");
    let session = manager.get_session(Some(&req));
    let select = Statement::new("SELECT * FROM languages");
    for _ in 0..50 {
        assert_eq!(session.bind_for(&select).unwrap().id(), primary.id());
    }
}

#[test]
fn test_handler_may_finalize_explicitly() {
    let db = TestDb::new();
    let options = SessionOptions {
        session_cleanup: SessionCleanup::CloseOnly,
        ..SessionOptions::default()
    };
    let (primary, middleware) = setup(&db, options);

    let mut req = Request::new("POST", "/languages");
    let mut resp = Response::new();
    middleware
        .dispatch(&mut req, &mut resp, |req, _resp| -> reqsession::Result<()> {
            let session = req.context.session()?;
            session.execute(insert("Rust"))?;
            session.commit()?;
            session.execute(insert("Go"))?;
            assert_eq!(session.state(), SessionState::Active);
            Ok(())
        })
        .unwrap();

    assert_eq!(list_languages(&middleware), vec!["Rust"]);
    assert_eq!(primary.stats().commits, 1);
}

#[test]
fn test_dropped_request_releases_session() {
    let db = TestDb::new();
    let (primary, middleware) = setup(&db, SessionOptions::default());

    {
        let mut req = Request::new("POST", "/languages");
        let mut resp = Response::new();
        middleware.process_request(&mut req, &mut resp);
        req.context.session().unwrap().execute(insert("Rust")).unwrap();
        assert_eq!(primary.stats().checked_out, 1);
        // Client went away before the response was processed
    }

    assert_eq!(primary.stats().checked_out, 0);
    assert_eq!(count(&primary), 0);
}
