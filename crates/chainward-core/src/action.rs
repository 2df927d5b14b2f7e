//! Action vocabulary returned by policies.
//!
//! Actions are closed sum types: the request phase can either continue with
//! modifications or answer immediately, the response phase can only continue
//! with modifications. A terminal action in the response phase is therefore
//! unrepresentable.

use bytes::Bytes;

use crate::headers::Headers;

/// One header operation. Operations compose in the order they were recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOp {
    Set { name: String, value: String },
    Remove { name: String },
    Append { name: String, value: String },
}

impl HeaderOp {
    pub fn apply(&self, headers: &mut Headers) {
        match self {
            HeaderOp::Set { name, value } => headers.set(name, value.clone()),
            HeaderOp::Remove { name } => {
                headers.remove(name);
            }
            HeaderOp::Append { name, value } => headers.append(name, value.clone()),
        }
    }
}

/// Behaviour shared by both phases' actions, as seen by the executor.
pub trait PolicyAction {
    /// True when the chain must stop after this action.
    fn stops_chain(&self) -> bool;
}

/// Changes to forward to the upstream. `None` fields mean "no change".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestModifications {
    pub header_ops: Vec<HeaderOp>,
    pub body: Option<Bytes>,
    pub path: Option<String>,
    pub method: Option<String>,
    /// Skip the remaining request policies without answering the client.
    pub stop: bool,
}

impl RequestModifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_ops.push(HeaderOp::Set {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn remove_header(mut self, name: impl Into<String>) -> Self {
        self.header_ops.push(HeaderOp::Remove { name: name.into() });
        self
    }

    pub fn append_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_ops.push(HeaderOp::Append {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.header_ops.is_empty()
            && self.body.is_none()
            && self.path.is_none()
            && self.method.is_none()
    }
}

/// Terminal answer sent to the client instead of contacting the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmediateResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl ImmediateResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// JSON error body: `{"error": code, "message": msg}`.
    pub fn json_error(status: u16, code: &str, message: &str) -> Self {
        let body = serde_json::json!({ "error": code, "message": message }).to_string();
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body)
    }
}

/// Request-phase action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    /// Non-terminal: continue upstream with these changes.
    Continue(RequestModifications),
    /// Terminal: answer the client now.
    Respond(ImmediateResponse),
}

impl PolicyAction for RequestAction {
    fn stops_chain(&self) -> bool {
        match self {
            RequestAction::Continue(m) => m.stop,
            RequestAction::Respond(_) => true,
        }
    }
}

impl RequestAction {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestAction::Respond(_))
    }
}

impl From<RequestModifications> for RequestAction {
    fn from(m: RequestModifications) -> Self {
        RequestAction::Continue(m)
    }
}

impl From<ImmediateResponse> for RequestAction {
    fn from(r: ImmediateResponse) -> Self {
        RequestAction::Respond(r)
    }
}

/// Changes to forward to the client. `None` fields mean "no change".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseModifications {
    pub header_ops: Vec<HeaderOp>,
    pub body: Option<Bytes>,
    pub status: Option<u16>,
    /// Skip the remaining response policies.
    pub stop: bool,
}

impl ResponseModifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_ops.push(HeaderOp::Set {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn remove_header(mut self, name: impl Into<String>) -> Self {
        self.header_ops.push(HeaderOp::Remove { name: name.into() });
        self
    }

    pub fn append_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_ops.push(HeaderOp::Append {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.header_ops.is_empty() && self.body.is_none() && self.status.is_none()
    }
}

/// Response-phase action. There is no terminal variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    Continue(ResponseModifications),
}

impl PolicyAction for ResponseAction {
    fn stops_chain(&self) -> bool {
        match self {
            ResponseAction::Continue(m) => m.stop,
        }
    }
}

impl From<ResponseModifications> for ResponseAction {
    fn from(m: ResponseModifications) -> Self {
        ResponseAction::Continue(m)
    }
}
