#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]


use axum::extract::ws::Message;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use chainward_core::protocol::discovery::{PolicyRef, RouteChainResource};
use chainward_core::protocol::extproc::{
    BodySendMode, HeaderValue, HttpBody, HttpHeaders, MetadataContext, ProcessingMessage, ProcessingReply,
    ProcessingRequest, ProcessingResponse,
};
use chainward_kernel::transport::codec::{self, Inbound};
use chainward_kernel::transport::ext_proc::Exchange;

use harness::*;

fn transform_route() -> RouteChainResource {
    RouteChainResource::new("orders")
        .request(set_header("x-a", "1"))
        .request(PolicyRef::new("json-body-transform").param("set_fields", json!({"source": "edge"})))
}

fn headers_message(end_of_stream: bool) -> ProcessingRequest {
    let mut req = ProcessingRequest::new(ProcessingMessage::RequestHeaders(HttpHeaders {
        headers: vec![
            HeaderValue::new(":method", "POST"),
            HeaderValue::new(":path", "/orders"),
            HeaderValue::new("x-request-id", "b-1"),
            HeaderValue::new("content-length", "7"),
        ],
        end_of_stream,
    }));
    req.metadata_context = MetadataContext::default().with_field("chainward", "route_key", "orders");
    req
}

fn body(chunk: &'static str, end_of_stream: bool) -> ProcessingRequest {
    ProcessingRequest::new(ProcessingMessage::RequestBody(HttpBody {
        body: Bytes::from_static(chunk.as_bytes()),
        end_of_stream,
    }))
}

#[tokio::test]
async fn body_chain_waits_for_the_whole_body() {
    let kernel = kernel("fail_closed");
    install(&kernel, "1", vec![transform_route()]);
    let cancel = CancellationToken::new();
    let mut exchange = Exchange::new();

    let first = exchange.on_message(&kernel, headers_message(false), &cancel).await;
    assert_eq!(first.reply, ProcessingReply::RequestHeaders(Default::default()));
    let mode = first.mode_override.unwrap();
    assert_eq!(mode.request_body_mode, Some(BodySendMode::Buffered));
    assert!(kernel.inflight().is_empty());
    assert_eq!(exchange.request_id(), Some("b-1"));

    let partial = exchange.on_message(&kernel, body(r#"{"a":"#, false), &cancel).await;
    assert_eq!(partial.reply, ProcessingReply::RequestBody(Default::default()));

    let done = exchange.on_message(&kernel, body("1}", true), &cancel).await;
    let ProcessingReply::RequestBody(common) = &done.reply else {
        panic!("expected a request_body reply, got {:?}", done.reply);
    };
    let new_body: Value = serde_json::from_slice(&common.body_mutation.as_ref().unwrap().body).unwrap();
    assert_eq!(new_body, json!({"a": 1, "source": "edge"}));
    assert!(removed(&done).contains(&"content-length".to_string()));
    assert_eq!(set_values(&done, "x-a"), vec!["1".to_string()]);
    assert_eq!(kernel.inflight().len(), 1);
}

#[tokio::test]
async fn response_body_is_accumulated_before_the_response_phase() {
    let kernel = kernel("fail_closed");
    install(&kernel, "1", vec![transform_route()]);
    let cancel = CancellationToken::new();
    let mut exchange = Exchange::new();

    let _ = exchange.on_message(&kernel, headers_message(true), &cancel).await;
    assert_eq!(kernel.inflight().len(), 1);

    let resp_headers = ProcessingRequest::new(ProcessingMessage::ResponseHeaders(HttpHeaders {
        headers: vec![HeaderValue::new(":status", "200")],
        end_of_stream: false,
    }));
    let held = exchange.on_message(&kernel, resp_headers, &cancel).await;
    assert_eq!(held.reply, ProcessingReply::ResponseHeaders(Default::default()));
    assert_eq!(kernel.inflight().len(), 1);

    let chunk = ProcessingRequest::new(ProcessingMessage::ResponseBody(HttpBody {
        body: Bytes::from_static(b"{}"),
        end_of_stream: true,
    }));
    let done = exchange.on_message(&kernel, chunk, &cancel).await;
    assert!(matches!(done.reply, ProcessingReply::ResponseBody(_)));
    assert!(kernel.inflight().is_empty());
}

#[tokio::test]
async fn headers_only_route_answers_immediately() {
    let kernel = kernel("fail_closed");
    install(
        &kernel,
        "1",
        vec![RouteChainResource::new("orders").request(set_header("x-a", "1"))],
    );
    let mut exchange = Exchange::new();

    let reply = exchange
        .on_message(&kernel, headers_message(false), &CancellationToken::new())
        .await;
    assert_eq!(set_values(&reply, "x-a"), vec!["1".to_string()]);
    let mode = reply.mode_override.unwrap();
    assert_eq!(mode.request_body_mode, Some(BodySendMode::None));
    assert_eq!(mode.response_body_mode, Some(BodySendMode::None));
}

#[tokio::test]
async fn abandoned_exchange_can_be_released() {
    let kernel = kernel("fail_closed");
    install(&kernel, "1", vec![transform_route()]);
    let mut exchange = Exchange::new();

    let _ = exchange
        .on_message(&kernel, headers_message(true), &CancellationToken::new())
        .await;
    let id = exchange.request_id().unwrap().to_string();
    assert!(kernel.release(&id));
    assert!(kernel.inflight().is_empty());
}

#[tokio::test]
async fn rejected_duplicate_stream_leaves_the_owner_alone() {
    let kernel = kernel("fail_closed");
    install(
        &kernel,
        "1",
        vec![RouteChainResource::new("orders").request(set_header("x-a", "1"))],
    );
    let cancel = CancellationToken::new();
    let mut owner = Exchange::new();
    let mut intruder = Exchange::new();

    let _ = owner.on_message(&kernel, headers_message(true), &cancel).await;
    assert!(owner.owns_state());

    let reply = intruder.on_message(&kernel, headers_message(true), &cancel).await;
    assert_eq!(immediate_status(&reply), Some(409));
    assert!(!intruder.owns_state());

    let resp_headers = ProcessingRequest::new(ProcessingMessage::ResponseHeaders(HttpHeaders {
        headers: vec![HeaderValue::new(":status", "200")],
        end_of_stream: true,
    }));
    let passed = intruder.on_message(&kernel, resp_headers, &cancel).await;
    assert_eq!(passed.reply, ProcessingReply::ResponseHeaders(Default::default()));
    assert!(!intruder.release(&kernel));
    assert_eq!(kernel.inflight().len(), 1);

    assert!(owner.release(&kernel));
    assert!(kernel.inflight().is_empty());
}

#[test]
fn frames_carry_base64_bodies() {
    let text = json!({
        "request_body": { "body": STANDARD.encode(br#"{"a":1}"#), "end_of_stream": true }
    })
    .to_string();
    let Inbound::Frame(req) = codec::decode::<ProcessingRequest>(Message::Text(text)).unwrap() else {
        panic!("expected a frame");
    };
    let ProcessingMessage::RequestBody(b) = req.message else {
        panic!("expected a request_body message");
    };
    assert_eq!(&b.body[..], br#"{"a":1}"#);
    assert!(b.end_of_stream);

    let reply = ProcessingResponse::new(ProcessingReply::RequestBody(Default::default()));
    let Message::Text(out) = codec::encode(&reply).unwrap() else {
        panic!("expected a text frame");
    };
    let back: Value = serde_json::from_str(&out).unwrap();
    assert!(back.get("request_body").is_some());
}
