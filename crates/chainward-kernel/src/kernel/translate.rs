//! Translation between protocol messages and policy contexts/results.
//!
//! Header changes are emitted as a diff between the headers the proxy sent
//! and the headers after the chain ran. Since the context already applied
//! every operation in execution order, the diff carries exactly the composed
//! effect: repeated identical sets collapse into one, a set followed by a
//! remove disappears. Body, path, method and status are last-writer-wins,
//! which the context also already reflects.

use bytes::Bytes;

use chainward_core::action::{ImmediateResponse, RequestAction};
use chainward_core::context::{RequestContext, ResponseContext};
use chainward_core::headers::Headers;
use chainward_core::protocol::extproc::{
    BodyMutation, CommonResponse, HeaderMutation, HeaderValue, HttpHeaders, HttpImmediateResponse,
    MetadataContext, ProcessingReply, PSEUDO_METHOD, PSEUDO_PATH, PSEUDO_STATUS, REQUEST_ID_HEADER,
};

use crate::worker::ExecutionResult;

/// Which phase message a reply answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySlot {
    Headers,
    Body,
}

/// Request-phase input extracted from a `request_headers` message.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub route_key: Option<String>,
}

impl IncomingRequest {
    /// `x-request-id` is used as the identifier; one is generated when absent.
    pub fn from_message(h: &HttpHeaders, meta: &MetadataContext, namespace: &str, field: &str) -> Self {
        let headers = h.regular();
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            request_id,
            method: h.pseudo(PSEUDO_METHOD).unwrap_or("GET").to_string(),
            path: h.pseudo(PSEUDO_PATH).unwrap_or("/").to_string(),
            headers,
            body: None,
            route_key: meta.lookup(namespace, field).map(str::to_owned),
        }
    }
}

/// Response-phase input extracted from a `response_headers` message.
#[derive(Debug, Clone)]
pub struct IncomingResponse {
    pub request_id: String,
    pub status: u16,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl IncomingResponse {
    pub fn from_message(request_id: impl Into<String>, h: &HttpHeaders) -> Self {
        Self {
            request_id: request_id.into(),
            status: h
                .pseudo(PSEUDO_STATUS)
                .and_then(|s| s.parse().ok())
                .unwrap_or(200),
            headers: h.regular(),
            body: None,
        }
    }
}

/// Mutation turning `before` into `after`.
pub fn header_mutation(before: &Headers, after: &Headers) -> HeaderMutation {
    let mut m = HeaderMutation::default();
    for name in before.names() {
        if !after.contains(name) {
            m.remove_headers.push(name.to_string());
        }
    }
    for name in after.names() {
        let new = after.get_all(name);
        if new == before.get_all(name) {
            continue;
        }
        for (i, v) in new.iter().enumerate() {
            m.set(name, v, i > 0);
        }
    }
    m
}

fn common(headers: HeaderMutation, body: Option<Bytes>) -> CommonResponse {
    CommonResponse {
        header_mutation: (!headers.is_empty()).then_some(headers),
        body_mutation: body.map(|body| BodyMutation { body }),
    }
}

fn changed_body(before: Option<&Bytes>, after: Option<&Bytes>) -> Option<Bytes> {
    match after {
        Some(a) if before != Some(a) => Some(a.clone()),
        _ => None,
    }
}

pub fn request_slot(slot: ReplySlot, c: CommonResponse) -> ProcessingReply {
    match slot {
        ReplySlot::Headers => ProcessingReply::RequestHeaders(c),
        ReplySlot::Body => ProcessingReply::RequestBody(c),
    }
}

pub fn response_slot(slot: ReplySlot, c: CommonResponse) -> ProcessingReply {
    match slot {
        ReplySlot::Headers => ProcessingReply::ResponseHeaders(c),
        ReplySlot::Body => ProcessingReply::ResponseBody(c),
    }
}

/// Answer the client directly.
pub fn immediate(resp: &ImmediateResponse, details: impl Into<String>) -> ProcessingReply {
    ProcessingReply::ImmediateResponse(HttpImmediateResponse {
        status: resp.status,
        headers: resp
            .headers
            .iter()
            .map(|(k, v)| HeaderValue::new(k, v))
            .collect(),
        body: resp.body.clone(),
        details: details.into(),
    })
}

/// Translate a finished request phase.
///
/// A terminal action wins outright: every mutation recorded before it is
/// discarded and only the immediate response is sent.
pub fn request_reply(
    slot: ReplySlot,
    original: &IncomingRequest,
    ctx: &RequestContext,
    exec: &ExecutionResult<RequestAction>,
) -> ProcessingReply {
    for r in &exec.results {
        if let Some(RequestAction::Respond(resp)) = &r.action {
            return immediate(resp, format!("policy {}", r.policy_name));
        }
    }

    let mut headers = header_mutation(&original.headers, &ctx.headers);
    if ctx.path != original.path {
        headers.set(PSEUDO_PATH, &ctx.path, false);
    }
    if ctx.method != original.method {
        headers.set(PSEUDO_METHOD, &ctx.method, false);
    }
    let body = changed_body(original.body.as_ref(), ctx.body.as_ref());
    request_slot(slot, common(headers, body))
}

/// Translate a finished response phase.
pub fn response_reply(slot: ReplySlot, original: &IncomingResponse, ctx: &ResponseContext) -> ProcessingReply {
    let mut headers = header_mutation(&original.headers, &ctx.headers);
    if ctx.status != original.status {
        headers.set(PSEUDO_STATUS, &ctx.status.to_string(), false);
    }
    let body = changed_body(original.body.as_ref(), ctx.body.as_ref());
    response_slot(slot, common(headers, body))
}
