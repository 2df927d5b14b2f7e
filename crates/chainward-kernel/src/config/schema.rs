use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chainward_core::error::{EngineError, Result};
use chainward_core::protocol::discovery::RouteChainResource;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub version: u32,

    #[serde(default)]
    pub server: ServerSection,

    /// Failure modes and eviction have no defaults: an operator must choose them.
    pub engine: EngineSection,

    #[serde(default)]
    pub policies: PoliciesSection,

    #[serde(default)]
    pub distribution: DistributionSection,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(EngineError::InvalidConfig(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        self.server.validate()?;
        self.engine.validate()?;
        self.policies.validate()?;
        self.distribution.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Grace period for in-flight streams on shutdown.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

impl ServerSection {
    pub fn validate(&self) -> Result<()> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(EngineError::InvalidConfig(
                "server.listen must be a valid socket address".into(),
            ));
        }
        if self.drain_grace_ms > 120_000 {
            return Err(EngineError::InvalidConfig(
                "server.drain_grace_ms must be at most 120000".into(),
            ));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:9001".into()
}
fn default_drain_grace_ms() -> u64 {
    5000
}

/// What to do when a route is unknown or a policy fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Skip the failing piece and let traffic through.
    FailOpen,
    /// Answer with an error instead of contacting the upstream.
    FailClosed,
}

impl FailureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureMode::FailOpen => "fail_open",
            FailureMode::FailClosed => "fail_closed",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default = "default_namespace")]
    pub route_metadata_namespace: String,
    #[serde(default = "default_route_key_field")]
    pub route_key_field: String,

    pub on_missing_route: FailureMode,
    pub on_policy_error: FailureMode,
    pub inflight_ttl_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_policy_timeout_ms")]
    pub policy_timeout_ms: u64,
}

impl EngineSection {
    pub fn validate(&self) -> Result<()> {
        if self.route_metadata_namespace.is_empty() || self.route_key_field.is_empty() {
            return Err(EngineError::InvalidConfig(
                "engine.route_metadata_namespace and engine.route_key_field must not be empty".into(),
            ));
        }
        if !(1_000..=3_600_000).contains(&self.inflight_ttl_ms) {
            return Err(EngineError::InvalidConfig(
                "engine.inflight_ttl_ms must be between 1000 and 3600000".into(),
            ));
        }
        if self.sweep_interval_ms < 100 || self.sweep_interval_ms >= self.inflight_ttl_ms {
            return Err(EngineError::InvalidConfig(
                "engine.sweep_interval_ms must be >= 100 and less than inflight_ttl_ms".into(),
            ));
        }
        if !(1..=60_000).contains(&self.policy_timeout_ms) {
            return Err(EngineError::InvalidConfig(
                "engine.policy_timeout_ms must be between 1 and 60000".into(),
            ));
        }
        Ok(())
    }

    pub fn inflight_ttl(&self) -> Duration {
        Duration::from_millis(self.inflight_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn policy_timeout(&self) -> Duration {
        Duration::from_millis(self.policy_timeout_ms)
    }
}

fn default_namespace() -> String {
    "chainward".into()
}
fn default_route_key_field() -> String {
    "route_key".into()
}
fn default_sweep_interval_ms() -> u64 {
    5000
}
fn default_policy_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoliciesSection {
    /// Extra descriptors (`*.yaml`) loaded on top of the built-in set.
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,
    /// 0 disables polling.
    #[serde(default)]
    pub reload_interval_ms: u64,
}

impl PoliciesSection {
    pub fn validate(&self) -> Result<()> {
        if self.reload_interval_ms != 0 && self.reload_interval_ms < 100 {
            return Err(EngineError::InvalidConfig(
                "policies.reload_interval_ms must be 0 or >= 100".into(),
            ));
        }
        if self.reload_interval_ms != 0 && self.definitions_dir.is_none() {
            return Err(EngineError::InvalidConfig(
                "policies.reload_interval_ms requires policies.definitions_dir".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributionSection {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Route keys this engine subscribes to; empty means all.
    #[serde(default)]
    pub resource_names: Vec<String>,
    /// Seed snapshot published at startup.
    #[serde(default)]
    pub routes_file: Option<PathBuf>,
    /// 0 disables polling.
    #[serde(default)]
    pub reload_interval_ms: u64,
}

impl Default for DistributionSection {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            resource_names: Vec::new(),
            routes_file: None,
            reload_interval_ms: 0,
        }
    }
}

impl DistributionSection {
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "distribution.node_id must not be empty".into(),
            ));
        }
        if self.reload_interval_ms != 0 && self.reload_interval_ms < 100 {
            return Err(EngineError::InvalidConfig(
                "distribution.reload_interval_ms must be 0 or >= 100".into(),
            ));
        }
        if self.reload_interval_ms != 0 && self.routes_file.is_none() {
            return Err(EngineError::InvalidConfig(
                "distribution.reload_interval_ms requires distribution.routes_file".into(),
            ));
        }
        Ok(())
    }
}

fn default_node_id() -> String {
    "chainward".into()
}

/// Routes seed file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutesFile {
    #[serde(default)]
    pub routes: Vec<RouteChainResource>,
}

impl RoutesFile {
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for r in &self.routes {
            if r.route_key.is_empty() {
                return Err(EngineError::InvalidConfig("route_key must not be empty".into()));
            }
            if !seen.insert(r.route_key.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate route_key `{}`",
                    r.route_key
                )));
            }
        }
        Ok(())
    }
}
