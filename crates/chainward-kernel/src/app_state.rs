//! Shared application state for the engine.
//!
//! Owns the kernel, the embedded distribution server and the metrics, and
//! starts the background tasks that keep them fed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chainward_core::error::Result;
use chainward_core::protocol::discovery::RouteChainResource;

use crate::chain::build_chains;
use crate::config::{self, EngineConfig};
use crate::kernel::Kernel;
use crate::obs::EngineMetrics;
use crate::registry::{load_registry, PolicyRegistry};
use crate::reload;
use crate::xds::{self, ConfigSubscriber, DistributionServer};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cfg: EngineConfig,
    kernel: Arc<Kernel>,
    distribution: Arc<DistributionServer>,
    metrics: Arc<EngineMetrics>,
}

impl AppState {
    /// Build application state from validated config.
    /// Returns Result so main can report boot errors without panicking.
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        let registry = load_registry(cfg.policies.definitions_dir.as_deref())?;
        Self::with_registry(cfg, registry)
    }

    pub fn with_registry(cfg: EngineConfig, registry: PolicyRegistry) -> Result<Self> {
        let metrics = Arc::new(EngineMetrics::default());
        let kernel = Arc::new(Kernel::new(cfg.engine.clone(), registry, metrics.clone()));
        let distribution = Arc::new(DistributionServer::new());

        tracing::info!(
            definitions = kernel.registry().len(),
            on_missing_route = cfg.engine.on_missing_route.as_str(),
            on_policy_error = cfg.engine.on_policy_error.as_str(),
            "engine initialised"
        );

        let state = Self {
            inner: Arc::new(AppStateInner {
                cfg,
                kernel,
                distribution,
                metrics,
            }),
        };

        if let Some(path) = &state.cfg().distribution.routes_file {
            let routes = config::load_routes_file(path)?;
            let version = state
                .publish_routes(routes.routes)
                .map_err(|e| e.context(&path.display().to_string()))?;
            tracing::info!(path = %path.display(), version, "seed routes published");
        }
        Ok(state)
    }

    pub fn cfg(&self) -> &EngineConfig {
        &self.inner.cfg
    }

    pub fn kernel(&self) -> Arc<Kernel> {
        Arc::clone(&self.inner.kernel)
    }

    pub fn distribution(&self) -> Arc<DistributionServer> {
        Arc::clone(&self.inner.distribution)
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn set_draining(&self) {
        self.inner.metrics.set_draining();
    }

    pub fn is_draining(&self) -> bool {
        self.inner.metrics.is_draining()
    }

    /// Ready once a configuration was accepted and until draining starts.
    pub fn is_ready(&self) -> bool {
        !self.is_draining() && self.inner.metrics.is_config_ready()
    }

    /// Check a full snapshot against the local registry, then publish it.
    pub fn publish_routes(&self, routes: Vec<RouteChainResource>) -> Result<u64> {
        build_chains(&self.inner.kernel.registry(), &routes)?;
        self.inner.distribution.publish_snapshot(routes)
    }

    /// Gauges computed at scrape time.
    pub fn metrics_extra(&self) -> Vec<(&'static str, u64)> {
        let kernel = &self.inner.kernel;
        vec![
            ("chainward_routes", kernel.routes().len() as u64),
            ("chainward_registered_policies", kernel.registry().len() as u64),
            ("chainward_snapshot_version", self.inner.distribution.version()),
            ("chainward_subscribers", self.inner.distribution.subscribers().len() as u64),
        ]
    }

    /// Start the local subscriber, the in-flight sweeper and any reload pollers.
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let cfg = self.cfg();
        let mut tasks = Vec::new();

        let subscriber = ConfigSubscriber::new(
            self.kernel(),
            cfg.distribution.node_id.clone(),
            cfg.distribution.resource_names.clone(),
        );
        tasks.push(xds::spawn_local(self.distribution(), subscriber, cancel.clone()));
        tasks.push(self.inner.kernel.spawn_sweeper(cancel.clone()));

        if let (Some(path), ms) = (&cfg.distribution.routes_file, cfg.distribution.reload_interval_ms) {
            if ms > 0 {
                tasks.push(reload::spawn_routes_reload(
                    self.clone(),
                    path.clone(),
                    Duration::from_millis(ms),
                    cancel.clone(),
                ));
            }
        }
        if let (Some(dir), ms) = (&cfg.policies.definitions_dir, cfg.policies.reload_interval_ms) {
            if ms > 0 {
                tasks.push(reload::spawn_definitions_reload(
                    self.clone(),
                    dir.clone(),
                    Duration::from_millis(ms),
                    cancel.clone(),
                ));
            }
        }
        tasks
    }
}
