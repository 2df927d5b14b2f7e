//! Processing protocol envelopes.
//!
//! Each WebSocket text frame carries exactly one message. Requests from the
//! proxy name their phase by key:
//!
//! ```json
//! {"request_headers": {"headers": [{"key": ":path", "value": "/orders"}], "end_of_stream": false},
//!  "metadata_context": {"filter_metadata": {"chainward": {"route_key": "orders"}}}}
//! ```
//!
//! Replies mirror the phase (`request_headers`, `request_body`, ...) or carry
//! an `immediate_response`. Body bytes are base64 strings.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::headers::Headers;

/// Pseudo-header carrying the request path.
pub const PSEUDO_PATH: &str = ":path";
/// Pseudo-header carrying the request method.
pub const PSEUDO_METHOD: &str = ":method";
/// Pseudo-header carrying the response status.
pub const PSEUDO_STATUS: &str = ":status";
/// Header carrying the exchange identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderValue {
    pub key: String,
    pub value: String,
}

impl HeaderValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Header map as sent by the proxy (pseudo-headers included).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaders {
    #[serde(default)]
    pub headers: Vec<HeaderValue>,
    #[serde(default)]
    pub end_of_stream: bool,
}

impl HttpHeaders {
    /// Value of a pseudo-header such as `:path`.
    pub fn pseudo(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Regular (non-pseudo) headers, order preserved.
    pub fn regular(&self) -> Headers {
        self.headers
            .iter()
            .filter(|h| !h.key.starts_with(':'))
            .map(|h| (h.key.as_str(), h.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBody {
    #[serde(default, with = "super::b64")]
    pub body: Bytes,
    #[serde(default)]
    pub end_of_stream: bool,
}

/// Dynamic metadata the proxy attaches (route key lives here).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataContext {
    #[serde(default)]
    pub filter_metadata: BTreeMap<String, Map<String, Value>>,
}

impl MetadataContext {
    pub fn is_empty(&self) -> bool {
        self.filter_metadata.is_empty()
    }

    /// String field `field` under `namespace`.
    pub fn lookup(&self, namespace: &str, field: &str) -> Option<&str> {
        self.filter_metadata
            .get(namespace)
            .and_then(|ns| ns.get(field))
            .and_then(Value::as_str)
    }

    pub fn with_field(mut self, namespace: &str, field: &str, value: &str) -> Self {
        self.filter_metadata
            .entry(namespace.to_string())
            .or_default()
            .insert(field.to_string(), Value::String(value.to_string()));
        self
    }
}

/// Phase message from the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMessage {
    RequestHeaders(HttpHeaders),
    RequestBody(HttpBody),
    ResponseHeaders(HttpHeaders),
    ResponseBody(HttpBody),
}

impl ProcessingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingMessage::RequestHeaders(_) => "request_headers",
            ProcessingMessage::RequestBody(_) => "request_body",
            ProcessingMessage::ResponseHeaders(_) => "response_headers",
            ProcessingMessage::ResponseBody(_) => "response_body",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRequest {
    #[serde(flatten)]
    pub message: ProcessingMessage,
    #[serde(default, skip_serializing_if = "MetadataContext::is_empty")]
    pub metadata_context: MetadataContext,
}

impl ProcessingRequest {
    pub fn new(message: ProcessingMessage) -> Self {
        Self {
            message,
            metadata_context: MetadataContext::default(),
        }
    }

    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::BadRequest(format!("invalid processing request: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::Internal(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderValueOption {
    pub header: HeaderValue,
    /// `false` replaces existing values, `true` adds another value.
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMutation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_headers: Vec<HeaderValueOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_headers: Vec<String>,
}

impl HeaderMutation {
    pub fn is_empty(&self) -> bool {
        self.set_headers.is_empty() && self.remove_headers.is_empty()
    }

    pub fn set(&mut self, key: &str, value: &str, append: bool) {
        self.set_headers.push(HeaderValueOption {
            header: HeaderValue::new(key, value),
            append,
        });
    }

    /// Header value set (not appended) for `key`, if any.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.set_headers
            .iter()
            .find(|o| o.header.key.eq_ignore_ascii_case(key))
            .map(|o| o.header.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyMutation {
    #[serde(with = "super::b64")]
    pub body: Bytes,
}

/// Continue-with-changes reply for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_mutation: Option<HeaderMutation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_mutation: Option<BodyMutation>,
}

impl CommonResponse {
    pub fn is_empty(&self) -> bool {
        self.header_mutation.as_ref().map_or(true, HeaderMutation::is_empty)
            && self.body_mutation.is_none()
    }
}

/// Answer the client directly; the upstream is never contacted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpImmediateResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderValue>,
    #[serde(default, with = "super::b64")]
    pub body: Bytes,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySendMode {
    None,
    Buffered,
}

/// Directive telling the proxy which bodies to send for this exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingMode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body_mode: Option<BodySendMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body_mode: Option<BodySendMode>,
}

impl ProcessingMode {
    pub fn from_flags(request_body: bool, response_body: bool) -> Self {
        let mode = |b: bool| Some(if b { BodySendMode::Buffered } else { BodySendMode::None });
        Self {
            request_body_mode: mode(request_body),
            response_body_mode: mode(response_body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingReply {
    RequestHeaders(CommonResponse),
    RequestBody(CommonResponse),
    ResponseHeaders(CommonResponse),
    ResponseBody(CommonResponse),
    ImmediateResponse(HttpImmediateResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResponse {
    #[serde(flatten)]
    pub reply: ProcessingReply,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_override: Option<ProcessingMode>,
}

impl ProcessingResponse {
    pub fn new(reply: ProcessingReply) -> Self {
        Self {
            reply,
            mode_override: None,
        }
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode_override = Some(mode);
        self
    }

    /// Unmodified pass-through reply for the phase `message` belongs to.
    pub fn pass_through(message: &ProcessingMessage) -> Self {
        let common = CommonResponse::default();
        Self::new(match message {
            ProcessingMessage::RequestHeaders(_) => ProcessingReply::RequestHeaders(common),
            ProcessingMessage::RequestBody(_) => ProcessingReply::RequestBody(common),
            ProcessingMessage::ResponseHeaders(_) => ProcessingReply::ResponseHeaders(common),
            ProcessingMessage::ResponseBody(_) => ProcessingReply::ResponseBody(common),
        })
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.reply, ProcessingReply::ImmediateResponse(_))
    }

    /// The phase reply's common part, if this is not an immediate response.
    pub fn common(&self) -> Option<&CommonResponse> {
        match &self.reply {
            ProcessingReply::RequestHeaders(c)
            | ProcessingReply::RequestBody(c)
            | ProcessingReply::ResponseHeaders(c)
            | ProcessingReply::ResponseBody(c) => Some(c),
            ProcessingReply::ImmediateResponse(_) => None,
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::BadRequest(format!("invalid processing response: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::Internal(e.to_string()))
    }
}
