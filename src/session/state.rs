use std::collections::HashMap;
use std::fmt;

use crate::middleware::{Request, RequestId};

/// Lifecycle of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Finalizing,
    Closed,
}

impl SessionState {
    /// Whether statements, commits and rollbacks are still accepted.
    pub fn is_usable(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Finalizing => "finalizing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The part of a request a session needs for bind decisions: the method and
/// the sticky key. A detached copy, so the session never keeps the request
/// itself alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBinding {
    pub method: String,
    pub request_id: Option<RequestId>,
}

impl RequestBinding {
    pub fn new(method: impl Into<String>, request_id: Option<RequestId>) -> Self {
        Self {
            method: method.into(),
            request_id,
        }
    }

    pub fn from_request(req: &Request) -> Self {
        Self::new(req.method(), req.context.request_id.clone())
    }
}

/// Per-session key/value store. The request binding is stashed here at
/// creation and detached at finalization.
#[derive(Debug, Default, Clone)]
pub struct SessionInfo {
    request: Option<RequestBinding>,
    values: HashMap<String, serde_json::Value>,
}

impl SessionInfo {
    pub fn new(request: Option<RequestBinding>) -> Self {
        Self {
            request,
            values: HashMap::new(),
        }
    }

    pub fn request(&self) -> Option<&RequestBinding> {
        self.request.as_ref()
    }

    pub fn detach_request(&mut self) -> Option<RequestBinding> {
        self.request.take()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) -> Option<serde_json::Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    /// Drop the request binding and every stashed value.
    pub fn clear(&mut self) {
        self.request = None;
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_from_request() {
        let mut req = Request::new("POST", "/languages");
        req.context.request_id = Some(RequestId::from("abc"));

        let binding = RequestBinding::from_request(&req);
        assert_eq!(binding.method, "POST");
        assert_eq!(binding.request_id, Some(RequestId::from("abc")));
    }

    #[test]
    fn test_info_detaches_request() {
        let mut info = SessionInfo::new(Some(RequestBinding::new("GET", None)));
        info.insert("tenant", serde_json::json!("acme"));

        assert!(info.request().is_some());
        assert_eq!(info.detach_request().map(|b| b.method), Some("GET".to_string()));
        assert!(info.request().is_none());
        assert_eq!(info.get("tenant"), Some(&serde_json::json!("acme")));
        assert_eq!(info.remove("tenant"), Some(serde_json::json!("acme")));

        info.insert("tenant", serde_json::json!("acme"));
        info.clear();
        assert!(info.get("tenant").is_none());
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(SessionState::Finalizing.is_usable());
        assert!(!SessionState::Closed.is_usable());
        assert_eq!(SessionState::Active.to_string(), "active");
    }
}
