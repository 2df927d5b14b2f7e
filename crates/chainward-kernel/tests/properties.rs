#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]


use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use chainward_core::action::RequestAction;
use chainward_core::context::{Metadata, RequestContext};
use chainward_core::headers::Headers;
use chainward_core::protocol::discovery::RouteChainResource;
use chainward_core::protocol::extproc::ProcessingReply;
use chainward_kernel::chain::build_chain;
use chainward_kernel::config::FailureMode;
use chainward_kernel::kernel::translate::ReplySlot;
use chainward_kernel::kernel::Kernel;
use chainward_kernel::obs::EngineMetrics;
use chainward_kernel::worker::{ExecutionResult, Executor, RequestStage};

use harness::*;

async fn run(route: RouteChainResource, mode: FailureMode) -> (RequestContext, ExecutionResult<RequestAction>) {
    let reg = registry();
    let chain = build_chain(&reg, &route).unwrap();
    let executor = Executor::new(Duration::from_millis(100), mode);
    let mut ctx = RequestContext::new("r", "GET", "/orders", Headers::new(), Metadata::new());
    let exec = executor
        .execute_phase::<RequestStage>(&chain.request, &mut ctx, &CancellationToken::new())
        .await;
    (ctx, exec)
}

#[tokio::test]
async fn results_cover_only_executed_policies_in_order() {
    let route = RouteChainResource::new("r")
        .request(step("A"))
        .request(step("B").disabled())
        .request(step("C").condition("request.method == 'POST'"))
        .request(step_mode("D", "respond"))
        .request(step("E"));
    let (ctx, exec) = run(route, FailureMode::FailClosed).await;

    let indices: Vec<usize> = exec.results.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 3]);
    assert!(exec.short_circuited);
    assert_eq!(ctx.headers.get_all("x-trace"), vec!["A"]);
}

#[tokio::test]
async fn conditions_see_earlier_mutations() {
    let route = RouteChainResource::new("r")
        .request(step("A"))
        .request(step("B").condition("request.headers['x-trace'] == 'A'"))
        .request(step("C").condition("has(metadata['seen'])"))
        .request(step("D").condition("request.headers['x-trace'] == 'nope'"));
    let (ctx, exec) = run(route, FailureMode::FailClosed).await;

    assert_eq!(exec.results.len(), 3);
    assert_eq!(ctx.headers.get_all("x-trace"), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn condition_error_skips_the_policy() {
    let route = RouteChainResource::new("r")
        .request(step("A").condition("request.path > 3"))
        .request(step("B"));
    let (ctx, exec) = run(route, FailureMode::FailClosed).await;

    assert_eq!(exec.results.len(), 1);
    assert_eq!(exec.results[0].index, 1);
    assert!(exec.failure.is_none());
    assert_eq!(ctx.headers.get_all("x-trace"), vec!["B"]);
}

#[tokio::test]
async fn stop_action_ends_the_phase_without_responding() {
    let route = RouteChainResource::new("r")
        .request(step_mode("S", "stop"))
        .request(step("B"));
    let (ctx, exec) = run(route, FailureMode::FailClosed).await;

    assert_eq!(exec.results.len(), 1);
    assert!(exec.short_circuited);
    assert_eq!(ctx.headers.get_all("x-trace"), vec!["S"]);
}

#[tokio::test]
async fn fail_open_keeps_going_after_errors_timeouts_and_panics() {
    let route = RouteChainResource::new("r")
        .request(step_mode("F", "fail"))
        .request(step_mode("T", "sleep"))
        .request(step_mode("P", "panic"))
        .request(step("B"));
    let (ctx, exec) = run(route, FailureMode::FailOpen).await;

    assert_eq!(exec.results.len(), 4);
    assert!(exec.failure.is_none());
    let codes: Vec<&str> = exec
        .results
        .iter()
        .map(|r| r.error.as_ref().map(|e| e.code().as_str()).unwrap_or("OK"))
        .collect();
    assert_eq!(codes, vec!["POLICY_FAILED", "POLICY_TIMEOUT", "POLICY_FAILED", "OK"]);
    assert_eq!(ctx.headers.get_all("x-trace"), vec!["B"]);
}

#[tokio::test]
async fn fail_closed_stops_at_the_first_failure() {
    let route = RouteChainResource::new("r")
        .request(step("A"))
        .request(step_mode("T", "sleep"))
        .request(step("B"));
    let (_, exec) = run(route, FailureMode::FailClosed).await;

    assert_eq!(exec.results.len(), 2);
    let failure = exec.failure.unwrap();
    assert_eq!(failure.index, 1);
    assert_eq!(failure.error.code().as_str(), "POLICY_TIMEOUT");
}

#[tokio::test]
async fn fail_closed_request_failure_answers_500() {
    let kernel = kernel("fail_closed");
    install(&kernel, "1", vec![RouteChainResource::new("r").request(step_mode("F", "fail"))]);

    let resp = request_phase(&kernel, Some("r"), "x-1", &[]).await;
    assert_eq!(immediate_status(&resp), Some(500));
    assert!(kernel.inflight().is_empty());
    assert_eq!(
        kernel
            .metrics()
            .policy_errors
            .get(&[("policy", "test-step"), ("phase", "request"), ("kind", "error")]),
        1
    );
}

#[tokio::test]
async fn fail_open_request_failure_forwards_the_rest() {
    let kernel = kernel("fail_open");
    install(
        &kernel,
        "1",
        vec![RouteChainResource::new("r")
            .request(step_mode("F", "fail"))
            .request(step("B"))],
    );

    let resp = request_phase(&kernel, Some("r"), "x-1", &[]).await;
    assert!(!resp.is_immediate());
    assert_eq!(set_values(&resp, "x-trace"), vec!["B".to_string()]);
    assert_eq!(kernel.inflight().len(), 1);
}

#[tokio::test]
async fn terminal_action_discards_earlier_mutations() {
    let kernel = kernel("fail_closed");
    install(
        &kernel,
        "1",
        vec![RouteChainResource::new("r")
            .request(step("A"))
            .request(step_mode("no", "respond"))],
    );

    let resp = request_phase(&kernel, Some("r"), "x-1", &[]).await;
    match &resp.reply {
        ProcessingReply::ImmediateResponse(r) => {
            assert_eq!(r.status, 418);
            assert!(r.headers.iter().all(|h| h.key != "x-trace"));
        }
        other => panic!("expected an immediate response, got {other:?}"),
    }
    assert!(resp.mode_override.is_none());
    assert!(kernel.inflight().is_empty());
}

#[tokio::test]
async fn repeated_identical_sets_collapse() {
    let kernel = kernel("fail_closed");
    install(
        &kernel,
        "1",
        vec![RouteChainResource::new("r")
            .request(set_header("x-a", "1"))
            .request(set_header("x-a", "1"))],
    );

    let resp = request_phase(&kernel, Some("r"), "x-1", &[]).await;
    assert_eq!(set_values(&resp, "x-a"), vec!["1".to_string()]);
}

#[tokio::test]
async fn cancelled_exchange_stores_nothing() {
    let kernel = kernel("fail_closed");
    install(&kernel, "1", vec![RouteChainResource::new("r").request(step("A"))]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let req = request_headers(Some("r"), "x-1", &[]);
    let resp = kernel
        .handle_request_phase(incoming(&kernel, &req), ReplySlot::Headers, &cancel)
        .await;

    assert!(!resp.is_immediate());
    assert!(set_values(&resp, "x-trace").is_empty());
    assert!(kernel.inflight().is_empty());
}

#[tokio::test]
async fn missing_route_follows_the_configured_mode() {
    let closed = kernel("fail_open");
    let resp = request_phase(&closed, Some("ghost"), "x-1", &[]).await;
    assert_eq!(immediate_status(&resp), Some(503));

    let open = Kernel::new(
        engine("fail_open", "fail_open"),
        registry(),
        Arc::new(EngineMetrics::default()),
    );
    let resp = request_phase(&open, Some("ghost"), "x-2", &[]).await;
    assert!(!resp.is_immediate());
    assert!(resp.common().unwrap().is_empty());
    let resp = request_phase(&open, None, "x-3", &[]).await;
    assert!(!resp.is_immediate());
    assert!(open.inflight().is_empty());
    assert_eq!(open.metrics().missing_routes.get(&[("mode", "fail_open")]), 2);
}

#[tokio::test]
async fn orphan_response_passes_through() {
    let kernel = kernel("fail_closed");
    let resp = response_phase(&kernel, "never-seen", 200).await;
    assert_eq!(resp.reply, ProcessingReply::ResponseHeaders(Default::default()));
    assert_eq!(kernel.metrics().orphaned_responses.get(&[]), 1);
}

#[tokio::test]
async fn response_failure_under_fail_closed_forwards_upstream_untouched() {
    let kernel = kernel("fail_closed");
    install(
        &kernel,
        "1",
        vec![RouteChainResource::new("r")
            .response(step("A"))
            .response(step_mode("F", "fail"))],
    );

    let _ = request_phase(&kernel, Some("r"), "x-1", &[]).await;
    let resp = response_phase(&kernel, "x-1", 502).await;
    assert_eq!(resp.reply, ProcessingReply::ResponseHeaders(Default::default()));
    assert!(kernel.inflight().is_empty());
}

#[tokio::test]
async fn released_state_is_gone() {
    let kernel = kernel("fail_closed");
    install(&kernel, "1", vec![RouteChainResource::new("r").response(step("A"))]);

    let _ = request_phase(&kernel, Some("r"), "x-1", &[]).await;
    assert!(kernel.release("x-1"));
    assert!(!kernel.release("x-1"));
    let resp = response_phase(&kernel, "x-1", 200).await;
    assert!(set_values(&resp, "x-trace").is_empty());
}
