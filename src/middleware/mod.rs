// Module for binding sessions to the request/response cycle
pub mod http;
pub mod stream;

pub use http::{Body, BodyRead, BodyStream, Request, RequestContext, RequestId, Response};
pub use stream::{ClosingReader, ClosingStream};

use tracing::{debug, warn};

use crate::manager::Manager;
use crate::{ReqSessionError, Result};
use stream::SessionFinalizer;

/// Opens a session when a request starts and finalizes it when the request
/// ends, or once a streamed response body has been consumed.
#[derive(Debug, Clone)]
pub struct Middleware {
    manager: Manager,
}

impl Middleware {
    pub fn new(manager: Manager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Attach a session to the request, unless its method is exempt. Under
    /// sticky binds the request gets its id before the session is created,
    /// so every bind of the request hashes the same key.
    pub fn process_request(&self, req: &mut Request, _resp: &mut Response) {
        let options = self.manager.session_options();
        if !options.needs_session(req.method()) {
            debug!("{} {} needs no session", req.method(), req.path());
            req.context.session = None;
            return;
        }

        if options.sticky_binds && req.context.request_id.is_none() {
            req.context.request_id = Some(options.new_request_id());
        }

        let session = self.manager.get_session(Some(&*req));
        debug!(
            "Session {} attached to {} {} (request id: {:?})",
            session.id(),
            req.method(),
            req.path(),
            req.context.request_id
        );
        req.context.session = Some(session);
    }

    /// Finalize the request's session. A streamed body takes ownership of
    /// the session and finalizes it when the body is closed or dropped.
    pub fn process_response(&self, req: &mut Request, resp: &mut Response, succeeded: bool) -> Result<()> {
        let Some(session) = req.context.session.take() else {
            return Ok(());
        };

        if self.manager.session_options().wrap_response_stream && resp.body.is_stream() {
            debug!("Deferring finalization of session {} until the body is consumed", session.id());
            return resp
                .body
                .defer_finalize(SessionFinalizer::new(self.manager.clone(), session, succeeded));
        }

        self.manager.close_session(session, succeeded)
    }

    /// Run `handler` between [`process_request`](Self::process_request) and
    /// [`process_response`](Self::process_response). The handler's error is
    /// returned as is; a finalization error after a failed handler is only
    /// logged.
    pub fn dispatch<T, E, F>(&self, req: &mut Request, resp: &mut Response, handler: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Request, &mut Response) -> std::result::Result<T, E>,
        E: From<ReqSessionError>,
    {
        self.process_request(req, resp);

        match handler(&mut *req, &mut *resp) {
            Ok(value) => {
                self.process_response(req, resp, true)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(finalize_err) = self.process_response(req, resp, false) {
                    warn!("Failed to finalize session of failed {} {}: {}", req.method(), req.path(), finalize_err);
                }
                Err(e)
            }
        }
    }
}
