use bytes::Bytes;
use futures::Stream;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::middleware::stream::{ClosingReader, ClosingStream, SessionFinalizer};
use crate::session::Session;
use crate::{ReqSessionError, Result};

/// Sticky key of a request. Stable for the request's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<uuid::Uuid> for RequestId {
    fn from(id: uuid::Uuid) -> Self {
        RequestId(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId(id.to_string())
    }
}

/// Per-request mutable bag.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub session: Option<Session>,
    pub request_id: Option<RequestId>,
    pub extras: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    pub fn session(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(ReqSessionError::NoSession)
    }
}

#[derive(Debug)]
pub struct Request {
    method: String,
    path: String,
    params: HashMap<String, String>,
    pub context: RequestContext,
}

impl Request {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            params: HashMap::new(),
            context: RequestContext::default(),
        }
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// A present parameter with an empty value counts as true.
    pub fn param_as_bool(&self, name: &str) -> bool {
        matches!(self.param(name), Some("" | "1" | "true" | "yes" | "on"))
    }
}

/// A pull-based body. `close` releases the body's resources and reports
/// anything that went wrong doing so.
pub trait BodyRead: Read + Send {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A push-based body.
pub trait BodyStream: Stream<Item = io::Result<Bytes>> + Send + Unpin {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PlainReader<R>(R);

impl<R: Read> Read for PlainReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read + Send> BodyRead for PlainReader<R> {}

struct PlainStream(BoxStream<'static, io::Result<Bytes>>);

impl Stream for PlainStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.as_mut().poll_next(cx)
    }
}

impl BodyStream for PlainStream {}

pub enum Body {
    Empty,
    Bytes(Bytes),
    Json(serde_json::Value),
    Reader(Box<dyn BodyRead>),
    Stream(Box<dyn BodyStream>),
}

impl Body {
    pub fn reader<R: Read + Send + 'static>(reader: R) -> Self {
        Body::Reader(Box::new(PlainReader(reader)))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Body::Stream(Box::new(PlainStream(Box::pin(stream))))
    }

    /// The body is produced lazily and outlives the handler.
    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Reader(_) | Body::Stream(_))
    }

    /// Attach a finalizer that runs when a streaming body is closed or
    /// dropped. Materialized bodies finalize immediately.
    pub(crate) fn defer_finalize(&mut self, mut finalizer: SessionFinalizer) -> Result<()> {
        match std::mem::replace(self, Body::Empty) {
            Body::Reader(inner) => {
                *self = Body::Reader(Box::new(ClosingReader::new(inner, finalizer)));
                Ok(())
            }
            Body::Stream(inner) => {
                *self = Body::Stream(Box::new(ClosingStream::new(inner, finalizer)));
                Ok(())
            }
            other => {
                *self = other;
                finalizer.finalize()
            }
        }
    }

    /// Close a streaming body, releasing it. The body is empty afterwards.
    pub fn close(&mut self) -> io::Result<()> {
        match std::mem::replace(self, Body::Empty) {
            Body::Reader(mut inner) => inner.close(),
            Body::Stream(mut inner) => inner.close(),
            _ => Ok(()),
        }
    }

    /// Read the whole body. Streaming bodies are drained and closed.
    pub fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Body::Empty => Ok(Vec::new()),
            Body::Bytes(bytes) => Ok(bytes.to_vec()),
            Body::Json(value) => serde_json::to_vec(value).map_err(io::Error::other),
            Body::Reader(inner) => {
                let mut buf = Vec::new();
                inner.read_to_end(&mut buf)?;
                self.close()?;
                Ok(buf)
            }
            Body::Stream(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "push-based bodies must be polled as a stream",
            )),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Body::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Body::Reader(_) => f.write_str("Reader(..)"),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub body: Body,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 200,
            body: Body::Empty,
        }
    }

    pub fn set_json(&mut self, value: serde_json::Value) {
        self.body = Body::Json(value);
    }

    pub fn set_bytes(&mut self, bytes: impl Into<Bytes>) {
        self.body = Body::Bytes(bytes.into());
    }

    pub fn set_reader<R: Read + Send + 'static>(&mut self, reader: R) {
        self.body = Body::reader(reader);
    }

    pub fn set_stream<S>(&mut self, stream: S)
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.body = Body::stream(stream);
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        match &self.body {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn test_request_params() {
        let req = Request::new("get", "/languages")
            .with_param("zero_division", "")
            .with_param("limit", "10");

        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/languages");
        assert!(req.param_as_bool("zero_division"));
        assert!(!req.param_as_bool("limit"));
        assert!(!req.param_as_bool("missing"));
        assert_eq!(req.param("limit"), Some("10"));
    }

    #[test]
    fn test_context_without_session() {
        let mut ctx = RequestContext::default();
        assert!(matches!(ctx.session(), Err(ReqSessionError::NoSession)));
    }

    #[test]
    fn test_body_kinds() {
        let mut resp = Response::new();
        assert!(!resp.body.is_stream());

        resp.set_json(json!({"ok": true}));
        assert_eq!(resp.json(), Some(&json!({"ok": true})));
        assert_eq!(resp.body.read_to_end().unwrap(), br#"{"ok":true}"#.to_vec());

        resp.set_reader(io::Cursor::new(b"hello".to_vec()));
        assert!(resp.body.is_stream());
        assert_eq!(resp.body.read_to_end().unwrap(), b"hello".to_vec());
        assert!(matches!(resp.body, Body::Empty));
    }

    #[tokio::test]
    async fn test_stream_body_proxies_chunks() {
        let mut resp = Response::new();
        resp.set_stream(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"b")),
        ]));
        assert!(resp.body.is_stream());

        let Body::Stream(mut stream) = std::mem::replace(&mut resp.body, Body::Empty) else {
            panic!("expected a stream body");
        };
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"ab".to_vec());
    }
}
