//! Phase adapters. The executor is written once over `Stage`; the two
//! phases only differ in the policy trait they call, the context they run
//! against, and the action vocabulary they get back.

use futures_util::future::BoxFuture;

use chainward_core::action::{PolicyAction, RequestAction, ResponseAction};
use chainward_core::context::{RequestContext, ResponseContext};
use chainward_core::error::Result;
use chainward_core::expr::Bindings;
use chainward_core::params::Params;
use chainward_core::policy::{Phase, RequestPolicy, ResponsePolicy};

pub trait Stage {
    type Policy: ?Sized + Send + Sync;
    type Context: Bindings + Send + Sync;
    type Action: PolicyAction + Send;

    const PHASE: Phase;

    fn invoke<'a>(
        policy: &'a Self::Policy,
        ctx: &'a Self::Context,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Option<Self::Action>>>;

    /// Make the action visible to the next policy.
    fn apply(ctx: &mut Self::Context, action: &Self::Action);
}

pub struct RequestStage;

impl Stage for RequestStage {
    type Policy = dyn RequestPolicy;
    type Context = RequestContext;
    type Action = RequestAction;

    const PHASE: Phase = Phase::Request;

    fn invoke<'a>(
        policy: &'a dyn RequestPolicy,
        ctx: &'a RequestContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Option<RequestAction>>> {
        policy.on_request(ctx, params)
    }

    fn apply(ctx: &mut RequestContext, action: &RequestAction) {
        ctx.apply(action);
    }
}

pub struct ResponseStage;

impl Stage for ResponseStage {
    type Policy = dyn ResponsePolicy;
    type Context = ResponseContext;
    type Action = ResponseAction;

    const PHASE: Phase = Phase::Response;

    fn invoke<'a>(
        policy: &'a dyn ResponsePolicy,
        ctx: &'a ResponseContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Option<ResponseAction>>> {
        policy.on_response(ctx, params)
    }

    fn apply(ctx: &mut ResponseContext, action: &ResponseAction) {
        ctx.apply(action);
    }
}
