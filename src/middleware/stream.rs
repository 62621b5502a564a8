use bytes::Bytes;
use futures::Stream;
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

use crate::manager::Manager;
use crate::middleware::http::{BodyRead, BodyStream};
use crate::session::Session;
use crate::Result;

/// Owns a request's session until its response body is done, then
/// finalizes it. Finalization happens at most once; a finalizer dropped
/// before running finalizes on drop.
pub(crate) struct SessionFinalizer {
    manager: Manager,
    session: Option<Session>,
    succeeded: bool,
}

impl SessionFinalizer {
    pub(crate) fn new(manager: Manager, session: Session, succeeded: bool) -> Self {
        Self {
            manager,
            session: Some(session),
            succeeded,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn finalize(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => {
                debug!("Finalizing session {} after response body", session.id());
                self.manager.close_session(session, self.succeeded)
            }
            None => Ok(()),
        }
    }
}

impl Drop for SessionFinalizer {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            error!("Deferred session finalization failed: {}", e);
        }
    }
}

/// Finalize first, then close and release the inner body. A failed close
/// never skips finalization; the finalization error takes precedence.
fn release<B, F>(finalizer: &mut SessionFinalizer, inner: &mut Option<B>, close: F) -> io::Result<()>
where
    F: FnOnce(&mut B) -> io::Result<()>,
{
    let finalized = finalizer.finalize();
    let closed = match inner.take() {
        Some(mut body) => close(&mut body),
        None => Ok(()),
    };

    match (finalized, closed) {
        (Err(e), closed) => {
            if let Err(close_err) = closed {
                warn!("Response body close failed after finalization error: {}", close_err);
            }
            Err(io::Error::other(e))
        }
        (Ok(()), closed) => closed,
    }
}

/// Pull-based body that finalizes the session at end of input, on close or
/// on drop, whichever comes first.
pub struct ClosingReader<R: BodyRead> {
    inner: Option<R>,
    finalizer: SessionFinalizer,
}

impl<R: BodyRead> ClosingReader<R> {
    pub(crate) fn new(inner: R, finalizer: SessionFinalizer) -> Self {
        Self {
            inner: Some(inner),
            finalizer,
        }
    }

    fn release(&mut self) -> io::Result<()> {
        release(&mut self.finalizer, &mut self.inner, |body| body.close())
    }
}

impl<R: BodyRead> Read for ClosingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(0);
        };
        let n = inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.release()?;
        }
        Ok(n)
    }
}

impl<R: BodyRead> BodyRead for ClosingReader<R> {
    fn close(&mut self) -> io::Result<()> {
        self.release()
    }
}

impl<R: BodyRead> Drop for ClosingReader<R> {
    fn drop(&mut self) {
        if !self.finalizer.is_pending() && self.inner.is_none() {
            return;
        }
        if let Err(e) = self.release() {
            error!("Failed to close abandoned response body: {}", e);
        }
    }
}

/// Push-based body that finalizes the session once the stream is
/// exhausted, on close or on drop, whichever comes first.
pub struct ClosingStream<S: BodyStream> {
    inner: Option<S>,
    finalizer: SessionFinalizer,
}

impl<S: BodyStream> ClosingStream<S> {
    pub(crate) fn new(inner: S, finalizer: SessionFinalizer) -> Self {
        Self {
            inner: Some(inner),
            finalizer,
        }
    }

    fn release(&mut self) -> io::Result<()> {
        release(&mut self.finalizer, &mut self.inner, |body| body.close())
    }
}

impl<S: BodyStream> Stream for ClosingStream<S> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        let polled = Pin::new(inner).poll_next(cx);
        match polled {
            Poll::Ready(None) => match this.release() {
                Ok(()) => Poll::Ready(None),
                Err(e) => Poll::Ready(Some(Err(e))),
            },
            other => other,
        }
    }
}

impl<S: BodyStream> BodyStream for ClosingStream<S> {
    fn close(&mut self) -> io::Result<()> {
        self.release()
    }
}

impl<S: BodyStream> Drop for ClosingStream<S> {
    fn drop(&mut self) {
        if !self.finalizer.is_pending() && self.inner.is_none() {
            return;
        }
        if let Err(e) = self.release() {
            error!("Failed to close abandoned response stream: {}", e);
        }
    }
}

impl<T: BodyRead + ?Sized> BodyRead for Box<T> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<T: BodyStream + ?Sized> BodyStream for Box<T> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}
