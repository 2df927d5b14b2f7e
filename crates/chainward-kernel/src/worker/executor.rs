//! Chain executor.
//!
//! For each policy, in chain order: skip when disabled, skip when its
//! condition is false against the *current* context, otherwise run it under
//! the per-policy timeout, record the result, and apply the action to the
//! context before the next policy runs. A terminal or stop action ends the
//! phase. Nothing is retried.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use chainward_core::action::PolicyAction;
use chainward_core::error::EngineError;

use crate::chain::BoundPolicy;
use crate::config::FailureMode;
use crate::worker::stage::Stage;

/// One executed policy.
#[derive(Debug, Clone)]
pub struct PolicyResult<A> {
    pub index: usize,
    pub policy_name: String,
    pub duration: Duration,
    /// `None` when the policy had nothing to change or failed.
    pub action: Option<A>,
    /// Set when the policy failed or timed out (fail-open keeps going).
    pub error: Option<EngineError>,
}

/// The failure that ended a phase under fail-closed.
#[derive(Debug, Clone)]
pub struct PolicyFailure {
    pub index: usize,
    pub policy_name: String,
    pub error: EngineError,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult<A> {
    /// Executed policies in chain order (skipped ones are absent).
    pub results: Vec<PolicyResult<A>>,
    pub total_duration: Duration,
    /// A policy returned a terminal or stop action.
    pub short_circuited: bool,
    pub failure: Option<PolicyFailure>,
    /// Cancelled at a policy boundary.
    pub cancelled: bool,
}

impl<A> ExecutionResult<A> {
    fn new() -> Self {
        Self {
            results: Vec::new(),
            total_duration: Duration::ZERO,
            short_circuited: false,
            failure: None,
            cancelled: false,
        }
    }

    /// Actions in execution order.
    pub fn actions(&self) -> impl Iterator<Item = &A> {
        self.results.iter().filter_map(|r| r.action.as_ref())
    }

    /// The action that ended the phase, if one did.
    pub fn last_action(&self) -> Option<&A> {
        self.results.last().and_then(|r| r.action.as_ref())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Executor {
    timeout: Duration,
    on_error: FailureMode,
}

impl Executor {
    pub fn new(timeout: Duration, on_error: FailureMode) -> Self {
        Self { timeout, on_error }
    }

    pub fn on_error(&self) -> FailureMode {
        self.on_error
    }

    pub async fn execute_phase<S: Stage>(
        &self,
        steps: &[BoundPolicy<S::Policy>],
        ctx: &mut S::Context,
        cancel: &CancellationToken,
    ) -> ExecutionResult<S::Action> {
        let phase = S::PHASE;
        let started = Instant::now();
        let mut out = ExecutionResult::new();

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::debug!(%phase, index, "execution cancelled at policy boundary");
                out.cancelled = true;
                break;
            }
            if !step.enabled {
                continue;
            }
            if let Some(cond) = &step.condition {
                match cond.evaluate_bool(&*ctx) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::warn!(%phase, policy = %step.key(), error = %e, "condition failed to evaluate; skipping policy");
                        continue;
                    }
                }
            }

            let t0 = Instant::now();
            let call = AssertUnwindSafe(S::invoke(&step.policy, &*ctx, &step.params)).catch_unwind();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    out.cancelled = true;
                    break;
                }
                r = tokio::time::timeout(self.timeout, call) => r,
            };
            let duration = t0.elapsed();

            let result = match outcome {
                Ok(Ok(r)) => r,
                Ok(Err(_panic)) => Err(EngineError::policy_failed(step.key(), "policy panicked")),
                Err(_elapsed) => Err(EngineError::PolicyTimeout {
                    policy: step.key(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(action) => {
                    let stops = action.as_ref().is_some_and(PolicyAction::stops_chain);
                    if let Some(a) = &action {
                        S::apply(ctx, a);
                    }
                    out.results.push(PolicyResult {
                        index,
                        policy_name: step.name.clone(),
                        duration,
                        action,
                        error: None,
                    });
                    if stops {
                        out.short_circuited = true;
                        break;
                    }
                }
                Err(error) => {
                    out.results.push(PolicyResult {
                        index,
                        policy_name: step.name.clone(),
                        duration,
                        action: None,
                        error: Some(error.clone()),
                    });
                    match self.on_error {
                        FailureMode::FailOpen => {
                            tracing::warn!(%phase, policy = %step.key(), %error, "policy failed; continuing (fail_open)");
                        }
                        FailureMode::FailClosed => {
                            tracing::warn!(%phase, policy = %step.key(), %error, "policy failed; stopping chain (fail_closed)");
                            out.failure = Some(PolicyFailure {
                                index,
                                policy_name: step.name.clone(),
                                error,
                            });
                            break;
                        }
                    }
                }
            }
        }

        out.total_duration = started.elapsed();
        out
    }
}
