//! Per-exchange contexts that policies run against.
//!
//! A `RequestContext` is mutated in place by the executor as each request
//! policy's action is applied. When the response phase starts, the request
//! fields are frozen into a `RequestSnapshot` and the same `Metadata` handle
//! is moved into the `ResponseContext`.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::action::{RequestAction, ResponseAction};
use crate::expr::Bindings;
use crate::headers::Headers;

/// Inter-policy key/value store scoped to one request lifecycle.
///
/// Cloning yields another handle to the same map.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    inner: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        // Poisoned lock means a policy panicked mid-write; read as empty instead of panicking.
        self.inner.read().ok().and_then(|m| m.get(key).cloned())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_owned))
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        if let Ok(mut m) = self.inner.write() {
            m.insert(key.into(), value.into());
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().ok().and_then(|mut m| m.remove(key))
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when both handles point at the same map.
    pub fn same_map(&self, other: &Metadata) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .inner
            .read()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Value::Object(map)
    }
}

/// Mutable request state for the request phase.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    /// `None` when the proxy did not buffer the body.
    pub body: Option<Bytes>,
    pub metadata: Metadata,
}

impl RequestContext {
    pub fn new(
        request_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: Headers,
        metadata: Metadata,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method: method.into(),
            path: path.into(),
            headers,
            body: None,
            metadata,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Apply a request action in place. Terminal actions leave the context untouched.
    pub fn apply(&mut self, action: &RequestAction) {
        let RequestAction::Continue(m) = action else {
            return;
        };
        for op in &m.header_ops {
            op.apply(&mut self.headers);
        }
        if let Some(body) = &m.body {
            self.body = Some(body.clone());
        }
        if let Some(path) = &m.path {
            self.path = path.clone();
        }
        if let Some(method) = &m.method {
            self.method = method.clone();
        }
    }

    /// Freeze the request fields for the response phase.
    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            request_id: self.request_id.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    fn request_value(&self) -> Value {
        request_json(
            &self.request_id,
            &self.method,
            &self.path,
            &self.headers,
            self.body.as_ref(),
        )
    }
}

impl Bindings for RequestContext {
    fn resolve(&self, root: &str) -> Option<Value> {
        match root {
            "request" => Some(self.request_value()),
            "metadata" => Some(self.metadata.to_value()),
            _ => None,
        }
    }
}

/// Immutable request fields carried into the response phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

/// Mutable response state for the response phase.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub request: Arc<RequestSnapshot>,
    pub status: u16,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub metadata: Metadata,
}

impl ResponseContext {
    pub fn new(request: Arc<RequestSnapshot>, status: u16, headers: Headers, metadata: Metadata) -> Self {
        Self {
            request,
            status,
            headers,
            body: None,
            metadata,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn apply(&mut self, action: &ResponseAction) {
        let ResponseAction::Continue(m) = action;
        for op in &m.header_ops {
            op.apply(&mut self.headers);
        }
        if let Some(body) = &m.body {
            self.body = Some(body.clone());
        }
        if let Some(status) = m.status {
            self.status = status;
        }
    }
}

impl Bindings for ResponseContext {
    fn resolve(&self, root: &str) -> Option<Value> {
        match root {
            "request" => {
                let r = &self.request;
                Some(request_json(
                    &r.request_id,
                    &r.method,
                    &r.path,
                    &r.headers,
                    r.body.as_ref(),
                ))
            }
            "response" => Some(json!({
                "status": self.status,
                "headers": self.headers.to_value(),
                "body": body_value(self.body.as_ref()),
            })),
            "metadata" => Some(self.metadata.to_value()),
            _ => None,
        }
    }
}

fn request_json(id: &str, method: &str, path: &str, headers: &Headers, body: Option<&Bytes>) -> Value {
    json!({
        "id": id,
        "method": method,
        "path": path,
        "headers": headers.to_value(),
        "body": body_value(body),
    })
}

fn body_value(body: Option<&Bytes>) -> Value {
    match body {
        Some(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        None => Value::Null,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::action::{RequestModifications, ResponseModifications};

    fn ctx() -> RequestContext {
        RequestContext::new("r1", "GET", "/a", Headers::new(), Metadata::new())
    }

    #[test]
    fn apply_is_last_writer_wins_per_field() {
        let mut c = ctx();
        c.apply(&RequestModifications::new().with_path("/b").into());
        c.apply(&RequestModifications::new().with_method("POST").into());
        c.apply(&RequestModifications::new().with_path("/c").into());
        assert_eq!(c.path, "/c");
        assert_eq!(c.method, "POST");
    }

    #[test]
    fn response_shares_metadata_identity() {
        let c = ctx();
        c.metadata.insert("sub", "alice");
        let resp = ResponseContext::new(Arc::new(c.snapshot()), 200, Headers::new(), c.metadata.clone());
        assert!(resp.metadata.same_map(&c.metadata));
        assert_eq!(resp.metadata.get_str("sub").as_deref(), Some("alice"));
    }

    #[test]
    fn response_status_override() {
        let c = ctx();
        let mut resp = ResponseContext::new(Arc::new(c.snapshot()), 200, Headers::new(), Metadata::new());
        resp.apply(&ResponseModifications::new().with_status(418).into());
        assert_eq!(resp.status, 418);
    }
}
