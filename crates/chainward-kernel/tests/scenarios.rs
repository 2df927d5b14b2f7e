#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]


use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use chainward_core::action::RequestAction;
use chainward_core::context::{Metadata, RequestContext};
use chainward_core::headers::Headers;
use chainward_core::protocol::discovery::{DiscoveryResponse, PolicyRef, RouteChainResource, ROUTE_CHAIN_TYPE_URL};
use chainward_kernel::chain::build_chain;
use chainward_kernel::config::FailureMode;
use chainward_kernel::worker::{Executor, RequestStage};
use chainward_kernel::xds::ConfigSubscriber;

use harness::*;

fn auth_chain() -> RouteChainResource {
    RouteChainResource::new("orders")
        .request(api_key(&["k-1", "k-2"]))
        .request(jwt())
        .request(set_header("x-custom", "v"))
}

fn push(version: &str, resources: Vec<RouteChainResource>) -> DiscoveryResponse {
    DiscoveryResponse {
        version_info: version.into(),
        resources,
        nonce: format!("nonce-{version}"),
        type_url: ROUTE_CHAIN_TYPE_URL.into(),
    }
}

#[tokio::test]
async fn invalid_api_key_short_circuits_with_403() {
    let reg = registry();
    let chain = build_chain(&reg, &auth_chain()).unwrap();
    let executor = Executor::new(Duration::from_millis(200), FailureMode::FailClosed);

    let headers = Headers::from_pairs([("x-api-key", "wrong"), ("authorization", "Bearer nope")]);
    let mut ctx = RequestContext::new("r-1", "GET", "/orders", headers, Metadata::new());
    let exec = executor
        .execute_phase::<RequestStage>(&chain.request, &mut ctx, &CancellationToken::new())
        .await;

    assert_eq!(exec.results.len(), 1);
    assert_eq!(exec.results[0].index, 0);
    assert!(exec.short_circuited);
    assert!(exec.failure.is_none());
    match exec.last_action() {
        Some(RequestAction::Respond(r)) => assert_eq!(r.status, 403),
        other => panic!("expected a 403 response, got {other:?}"),
    }
}

#[tokio::test]
async fn valid_credentials_run_the_whole_chain() {
    let reg = registry();
    let chain = build_chain(&reg, &auth_chain()).unwrap();
    let executor = Executor::new(Duration::from_millis(200), FailureMode::FailClosed);

    let bearer = format!("Bearer {}", token("alice"));
    let headers = Headers::from_pairs([("x-api-key", "k-2"), ("authorization", bearer.as_str())]);
    let mut ctx = RequestContext::new("r-2", "GET", "/orders", headers, Metadata::new());
    let exec = executor
        .execute_phase::<RequestStage>(&chain.request, &mut ctx, &CancellationToken::new())
        .await;

    assert_eq!(exec.results.len(), 3);
    assert!(!exec.short_circuited);
    assert!(exec.results.iter().all(|r| r.error.is_none()));
    assert_eq!(ctx.headers.get("x-user-id"), Some("alice"));
    assert_eq!(ctx.headers.get("x-custom"), Some("v"));
    assert!(!ctx.headers.contains("x-api-key"));
    assert_eq!(ctx.metadata.get_str("auth.subject").as_deref(), Some("alice"));
    assert_eq!(ctx.metadata.get_str("auth.api_key_id").as_deref(), Some("key-1"));
}

#[tokio::test]
async fn valid_credentials_through_the_kernel() {
    let kernel = kernel("fail_closed");
    install(&kernel, "1", vec![auth_chain()]);

    let bearer = format!("Bearer {}", token("alice"));
    let resp = request_phase(
        &kernel,
        Some("orders"),
        "r-3",
        &[("x-api-key", "k-1"), ("authorization", bearer.as_str())],
    )
    .await;

    assert!(!resp.is_immediate());
    assert_eq!(set_values(&resp, "x-user-id"), vec!["alice".to_string()]);
    assert_eq!(set_values(&resp, "x-custom"), vec!["v".to_string()]);
    assert!(removed(&resp).contains(&"x-api-key".to_string()));
    assert_eq!(kernel.inflight().len(), 1);

    let missing = request_phase(&kernel, Some("orders"), "r-4", &[]).await;
    assert_eq!(immediate_status(&missing), Some(401));
    assert_eq!(kernel.inflight().len(), 1);
}

#[test]
fn body_requirement_is_the_union_of_the_chain() {
    let reg = registry();
    let plain = RouteChainResource::new("plain").request(set_header("x-a", "1"));
    assert!(!build_chain(&reg, &plain).unwrap().requires_request_body());

    for position in 0..3 {
        let mut res = RouteChainResource::new("body")
            .request(set_header("x-a", "1"))
            .request(set_header("x-b", "2"));
        res.request_policies
            .insert(position, PolicyRef::new("json-body-transform"));
        let chain = build_chain(&reg, &res).unwrap();
        assert!(chain.requires_request_body(), "position {position}");
    }

    let disabled = RouteChainResource::new("off").request(PolicyRef::new("json-body-transform").disabled());
    assert!(build_chain(&reg, &disabled).unwrap().requires_request_body());

    let response_side = RouteChainResource::new("resp").response(PolicyRef::new("json-body-transform"));
    let chain = build_chain(&reg, &response_side).unwrap();
    assert!(chain.requires_request_body());
    assert!(chain.requires_response_body());
}

#[tokio::test]
async fn body_requirement_survives_a_registry_reload() {
    let kernel = kernel("fail_open");
    install(
        &kernel,
        "1",
        vec![RouteChainResource::new("orders")
            .request(set_header("x-a", "1"))
            .request(PolicyRef::new("json-body-transform").param("set_fields", json!({"k": "v"})))],
    );
    assert!(kernel.chain_for(Some("orders")).unwrap().requires_request_body());

    kernel.reload_registry(registry()).unwrap();
    let chain = kernel.chain_for(Some("orders")).unwrap();
    assert!(chain.requires_request_body());
    assert_eq!(kernel.routes().version(), "1");
}

#[tokio::test]
async fn metadata_never_leaks_between_exchanges() {
    let kernel = kernel("fail_closed");
    install(
        &kernel,
        "1",
        vec![
            RouteChainResource::new("writer")
                .request(step("A"))
                .response(step_mode("r", "read")),
            RouteChainResource::new("reader").response(step_mode("r", "read")),
        ],
    );

    let _ = request_phase(&kernel, Some("writer"), "r1", &[]).await;
    let _ = request_phase(&kernel, Some("reader"), "r2", &[]).await;

    let r2 = response_phase(&kernel, "r2", 200).await;
    let r1 = response_phase(&kernel, "r1", 200).await;

    assert_eq!(set_values(&r1, "x-seen"), vec!["A".to_string()]);
    assert_eq!(set_values(&r2, "x-seen"), vec!["none".to_string()]);
    assert!(kernel.inflight().is_empty());
}

#[tokio::test]
async fn reused_request_id_cannot_take_over_stored_state() {
    let kernel = kernel("fail_closed");
    install(
        &kernel,
        "1",
        vec![
            RouteChainResource::new("writer")
                .request(step("A"))
                .response(step_mode("r", "read")),
            RouteChainResource::new("reader").response(step_mode("r", "read")),
        ],
    );

    let first = request_phase(&kernel, Some("writer"), "dup", &[]).await;
    assert!(!first.is_immediate());
    let second = request_phase(&kernel, Some("reader"), "dup", &[]).await;
    assert_eq!(immediate_status(&second), Some(409));
    assert_eq!(kernel.inflight().len(), 1);

    let resp = response_phase(&kernel, "dup", 200).await;
    assert_eq!(set_values(&resp, "x-seen"), vec!["A".to_string()]);
    assert!(kernel.inflight().is_empty());

    // the id is free again once the first exchange is done
    let third = request_phase(&kernel, Some("reader"), "dup", &[]).await;
    assert!(!third.is_immediate());
    let resp = response_phase(&kernel, "dup", 200).await;
    assert_eq!(set_values(&resp, "x-seen"), vec!["none".to_string()]);
}

#[tokio::test]
async fn rejected_update_keeps_the_previous_routes() {
    let kernel = kernel("fail_closed");
    let mut sub = ConfigSubscriber::new(kernel.clone(), "node-a", vec![]);

    let good = RouteChainResource::new("orders").request(set_header("x-v", "1"));
    let ack = sub.handle_push(&push("1", vec![good]));
    assert!(!ack.is_nack());
    assert_eq!(ack.version_info, "1");
    assert_eq!(ack.response_nonce, "nonce-1");

    let bad = RouteChainResource::new("orders")
        .request(PolicyRef::new("jwt-auth").param("secret", SECRET).param("leeway_secs", 9999));
    let nack = sub.handle_push(&push("2", vec![bad]));
    assert!(nack.is_nack());
    assert_eq!(nack.version_info, "1");
    assert_eq!(nack.response_nonce, "nonce-2");
    assert_eq!(nack.error_detail.as_ref().unwrap().code, "INVALID_PARAMETER");

    assert_eq!(sub.accepted_version(), "1");
    assert_eq!(kernel.routes().version(), "1");
    let resp = request_phase(&kernel, Some("orders"), "r-5", &[]).await;
    assert_eq!(set_values(&resp, "x-v"), vec!["1".to_string()]);
    assert_eq!(kernel.metrics().config_updates.get(&[("result", "nack")]), 1);
}

#[tokio::test]
async fn push_with_unsubscribed_route_is_rejected() {
    let kernel = kernel("fail_closed");
    let mut sub = ConfigSubscriber::new(kernel.clone(), "node-a", vec!["orders".into()]);
    let nack = sub.handle_push(&push("1", vec![RouteChainResource::new("users")]));
    assert!(nack.is_nack());
    assert_eq!(nack.version_info, "");
    assert!(kernel.routes().is_empty());
}
