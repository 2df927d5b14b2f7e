//! Kernel: owns the route table, the in-flight table and the registry, and
//! turns processing-protocol phases into chain executions.

pub mod inflight;
pub mod route_table;
pub mod translate;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chainward_core::action::ImmediateResponse;
use chainward_core::context::{Metadata, RequestContext, ResponseContext};
use chainward_core::error::{EngineError, ErrorCode, Result};
use chainward_core::protocol::discovery::RouteChainResource;
use chainward_core::protocol::extproc::{CommonResponse, ProcessingMode, ProcessingReply, ProcessingResponse};

use crate::chain::{build_chains, PolicyChain};
use crate::config::{EngineSection, FailureMode};
use crate::obs::EngineMetrics;
use crate::registry::PolicyRegistry;
use crate::worker::{ExecutionResult, Executor, RequestStage, ResponseStage};

use inflight::{InflightEntry, InflightTable};
use route_table::{RouteSnapshot, RouteTable};
use translate::{IncomingRequest, IncomingResponse, ReplySlot};

pub struct Kernel {
    cfg: EngineSection,
    registry: ArcSwap<PolicyRegistry>,
    routes: RouteTable,
    inflight: InflightTable,
    executor: Executor,
    metrics: Arc<EngineMetrics>,
    /// Serializes route-table and registry writers.
    update: Mutex<()>,
}

/// Request-phase reply plus whether in-flight state was stored for it.
pub struct RequestOutcome {
    pub response: ProcessingResponse,
    pub stored: bool,
}

impl Kernel {
    pub fn new(cfg: EngineSection, registry: PolicyRegistry, metrics: Arc<EngineMetrics>) -> Self {
        let executor = Executor::new(cfg.policy_timeout(), cfg.on_policy_error);
        let inflight = InflightTable::new(cfg.inflight_ttl());
        Self {
            cfg,
            registry: ArcSwap::from_pointee(registry),
            routes: RouteTable::new(),
            inflight,
            executor,
            metrics,
            update: Mutex::new(()),
        }
    }

    fn update_lock(&self) -> MutexGuard<'_, ()> {
        self.update.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &EngineSection {
        &self.cfg
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn inflight(&self) -> &InflightTable {
        &self.inflight
    }

    pub fn registry(&self) -> Arc<PolicyRegistry> {
        self.registry.load_full()
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn chain_for(&self, route_key: Option<&str>) -> Option<Arc<PolicyChain>> {
        route_key.and_then(|k| self.routes.get(k))
    }

    /// Body directive for a route; unknown routes need no bodies.
    pub fn processing_mode_for(&self, route_key: Option<&str>) -> ProcessingMode {
        self.chain_for(route_key)
            .map(|c| c.processing_mode())
            .unwrap_or_else(|| ProcessingMode::from_flags(false, false))
    }

    /// Validate and install a full snapshot. On error nothing changes.
    pub fn apply_snapshot(&self, version: &str, resources: &[RouteChainResource]) -> Result<()> {
        let _guard = self.update_lock();
        let registry = self.registry.load();
        let chains = build_chains(&registry, resources)?;
        let count = chains.len();
        self.routes.replace(RouteSnapshot {
            version: version.to_string(),
            chains,
        });
        self.metrics.set_config_ready();
        tracing::info!(version, routes = count, "route table replaced");
        Ok(())
    }

    /// Swap in a new registry and rebuild every active chain against it.
    /// If any chain fails to rebuild, the previous registry and chains stay.
    pub fn reload_registry(&self, registry: PolicyRegistry) -> Result<()> {
        let _guard = self.update_lock();
        let current = self.routes.snapshot();
        let resources: Vec<RouteChainResource> =
            current.chains.values().map(|c| c.resource.clone()).collect();
        let chains = build_chains(&registry, &resources)?;
        let definitions = registry.len();
        self.routes.replace(RouteSnapshot {
            version: current.version.clone(),
            chains,
        });
        self.registry.store(Arc::new(registry));
        tracing::info!(definitions, routes = resources.len(), "policy registry reloaded");
        Ok(())
    }

    /// Request phase: resolve the chain, run it, store state, translate.
    pub async fn handle_request_phase(
        &self,
        req: IncomingRequest,
        slot: ReplySlot,
        cancel: &CancellationToken,
    ) -> ProcessingResponse {
        self.run_request_phase(req, slot, cancel).await.response
    }

    /// Like [`Kernel::handle_request_phase`], also reporting whether this
    /// exchange now owns in-flight state under its request id.
    pub async fn run_request_phase(
        &self,
        req: IncomingRequest,
        slot: ReplySlot,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        let started = Instant::now();
        let route = req.route_key.as_deref().unwrap_or("");

        let Some(chain) = self.chain_for(req.route_key.as_deref()) else {
            return RequestOutcome {
                response: self.missing_route(&req, slot),
                stored: false,
            };
        };

        let metadata = Metadata::new();
        let mut ctx = RequestContext::new(
            req.request_id.clone(),
            req.method.clone(),
            req.path.clone(),
            req.headers.clone(),
            metadata.clone(),
        );
        ctx.body = req.body.clone();

        let exec = self
            .executor
            .execute_phase::<RequestStage>(&chain.request, &mut ctx, cancel)
            .await;
        self.record("request", route, &exec);

        if exec.cancelled {
            tracing::debug!(request_id = %req.request_id, route, "request phase cancelled");
            self.metrics.exchanges.inc(&[("phase", "request"), ("outcome", "cancelled")]);
            return RequestOutcome {
                response: ProcessingResponse::new(translate::request_slot(slot, CommonResponse::default())),
                stored: false,
            };
        }

        let mode = chain.processing_mode();
        let mut stored = false;
        let reply = if let Some(f) = &exec.failure {
            // fail-closed policy failure
            self.metrics.exchanges.inc(&[("phase", "request"), ("outcome", "error")]);
            let resp = ImmediateResponse::json_error(500, f.error.code().as_str(), "policy execution failed");
            translate::immediate(&resp, format!("policy {} failed", f.policy_name))
        } else {
            let reply = translate::request_reply(slot, &req, &ctx, &exec);
            if matches!(reply, ProcessingReply::ImmediateResponse(_)) {
                self.metrics.exchanges.inc(&[("phase", "request"), ("outcome", "immediate")]);
                reply
            } else {
                let entry = InflightEntry::new(ctx.snapshot(), chain.clone(), metadata);
                if self.inflight.insert(req.request_id.clone(), entry) {
                    stored = true;
                    self.metrics.inflight_entries.set(&[], self.inflight.len() as i64);
                    self.metrics.exchanges.inc(&[("phase", "request"), ("outcome", "continue")]);
                    reply
                } else {
                    // another live exchange holds this id; its state stays untouched
                    tracing::warn!(request_id = %req.request_id, route, "request id already in flight; rejecting");
                    self.metrics.exchanges.inc(&[("phase", "request"), ("outcome", "duplicate")]);
                    let resp = ImmediateResponse::json_error(
                        409,
                        ErrorCode::Conflict.as_str(),
                        "request id already in flight",
                    );
                    translate::immediate(&resp, "duplicate request id")
                }
            }
        };

        let terminal = matches!(reply, ProcessingReply::ImmediateResponse(_));

        self.metrics
            .phase_duration
            .observe(&[("phase", "request")], started.elapsed());
        tracing::debug!(
            request_id = %req.request_id,
            route,
            policies = exec.results.len(),
            short_circuited = exec.short_circuited,
            terminal,
            "request phase done"
        );

        let resp = ProcessingResponse::new(reply);
        let response = if terminal { resp } else { resp.with_mode(mode) };
        RequestOutcome { response, stored }
    }

    /// Response phase: take stored state, run the response chain, translate.
    pub async fn handle_response_phase(
        &self,
        resp: IncomingResponse,
        slot: ReplySlot,
        cancel: &CancellationToken,
    ) -> ProcessingResponse {
        let started = Instant::now();
        let pass_through = ProcessingResponse::new(translate::response_slot(slot, CommonResponse::default()));

        let Some(entry) = self.inflight.take(&resp.request_id) else {
            tracing::warn!(request_id = %resp.request_id, "no in-flight state for response; passing through");
            self.metrics.orphaned_responses.inc(&[]);
            self.metrics
                .exchanges
                .inc(&[("phase", "response"), ("outcome", "pass_through")]);
            return pass_through;
        };
        self.metrics.inflight_entries.set(&[], self.inflight.len() as i64);

        let chain = entry.chain;
        let mut ctx = ResponseContext::new(entry.request, resp.status, resp.headers.clone(), entry.metadata);
        ctx.body = resp.body.clone();

        let exec = self
            .executor
            .execute_phase::<ResponseStage>(&chain.response, &mut ctx, cancel)
            .await;
        self.record("response", &chain.route_key, &exec);

        let out = if exec.cancelled {
            self.metrics
                .exchanges
                .inc(&[("phase", "response"), ("outcome", "cancelled")]);
            pass_through
        } else if exec.failure.is_some() {
            // fail-closed in the response phase: forward the upstream response untouched
            self.metrics.exchanges.inc(&[("phase", "response"), ("outcome", "error")]);
            pass_through
        } else {
            self.metrics
                .exchanges
                .inc(&[("phase", "response"), ("outcome", "continue")]);
            ProcessingResponse::new(translate::response_reply(slot, &resp, &ctx))
        };

        self.metrics
            .phase_duration
            .observe(&[("phase", "response")], started.elapsed());
        tracing::debug!(
            request_id = %resp.request_id,
            route = %chain.route_key,
            policies = exec.results.len(),
            "response phase done"
        );
        out
    }

    /// Drop stored state for an exchange the proxy abandoned.
    pub fn release(&self, request_id: &str) -> bool {
        let removed = self.inflight.remove(request_id);
        if removed {
            self.metrics.inflight_entries.set(&[], self.inflight.len() as i64);
        }
        removed
    }

    /// Periodically evict expired in-flight entries until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(kernel.cfg.sweep_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let evicted = kernel.inflight.sweep();
                        if evicted > 0 {
                            tracing::warn!(evicted, ttl_ms = kernel.cfg.inflight_ttl_ms, "evicted stale in-flight entries");
                            kernel.metrics.inflight_evictions.add(&[], evicted as u64);
                        }
                        kernel.metrics.inflight_entries.set(&[], kernel.inflight.len() as i64);
                    }
                }
            }
        })
    }

    fn missing_route(&self, req: &IncomingRequest, slot: ReplySlot) -> ProcessingResponse {
        let mode = self.cfg.on_missing_route;
        self.metrics.missing_routes.inc(&[("mode", mode.as_str())]);
        tracing::warn!(
            request_id = %req.request_id,
            route = req.route_key.as_deref().unwrap_or("<none>"),
            mode = mode.as_str(),
            "no policy chain for route"
        );
        match mode {
            FailureMode::FailOpen => {
                self.metrics
                    .exchanges
                    .inc(&[("phase", "request"), ("outcome", "pass_through")]);
                ProcessingResponse::new(translate::request_slot(slot, CommonResponse::default()))
                    .with_mode(ProcessingMode::from_flags(false, false))
            }
            FailureMode::FailClosed => {
                self.metrics.exchanges.inc(&[("phase", "request"), ("outcome", "error")]);
                let err = EngineError::RouteNotFound(req.route_key.clone().unwrap_or_default());
                let resp = ImmediateResponse::json_error(503, err.code().as_str(), &err.to_string());
                ProcessingResponse::new(translate::immediate(&resp, "route not found"))
            }
        }
    }

    fn record<A>(&self, phase: &str, route: &str, exec: &ExecutionResult<A>) {
        for r in &exec.results {
            self.metrics
                .policy_duration
                .observe(&[("policy", r.policy_name.as_str()), ("phase", phase)], r.duration);
            if let Some(e) = &r.error {
                let kind = match e {
                    EngineError::PolicyTimeout { .. } => "timeout",
                    _ => "error",
                };
                self.metrics
                    .policy_errors
                    .inc(&[("policy", r.policy_name.as_str()), ("phase", phase), ("kind", kind)]);
            }
        }
        if exec.short_circuited {
            if let Some(last) = exec.results.last() {
                self.metrics
                    .short_circuits
                    .inc(&[("route", route), ("policy", last.policy_name.as_str())]);
            }
        }
    }
}
