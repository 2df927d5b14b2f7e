//! Route chains: validated, immutable policy lists bound to a route key.
//!
//! Chains are built once from a `RouteChainResource` against the registry.
//! Every reference is resolved, every parameter bag validated, every
//! condition compiled; a single failure rejects the whole build.

use std::collections::HashMap;
use std::sync::Arc;

use semver::Version;

use chainward_core::error::{EngineError, Result};
use chainward_core::expr::{Expression, REQUEST_ROOTS, RESPONSE_ROOTS};
use chainward_core::params::Params;
use chainward_core::policy::{Phase, RequestPolicy, ResponsePolicy};
use chainward_core::protocol::discovery::{PolicyRef, RouteChainResource};
use chainward_core::protocol::extproc::ProcessingMode;

use crate::registry::{PolicyRegistry, RegisteredPolicy};

/// One policy as placed in a chain.
pub struct BoundPolicy<P: ?Sized> {
    pub name: String,
    pub version: Version,
    pub enabled: bool,
    pub condition: Option<Expression>,
    pub params: Params,
    pub policy: Arc<P>,
}

impl<P: ?Sized> BoundPolicy<P> {
    /// `name@version`
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl<P: ?Sized> std::fmt::Debug for BoundPolicy<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundPolicy")
            .field("name", &self.name)
            .field("version", &self.version.to_string())
            .field("enabled", &self.enabled)
            .field("condition", &self.condition.as_ref().map(Expression::source))
            .finish()
    }
}

pub type RequestStep = BoundPolicy<dyn RequestPolicy>;
pub type ResponseStep = BoundPolicy<dyn ResponsePolicy>;

#[derive(Debug)]
pub struct PolicyChain {
    pub route_key: String,
    pub request: Vec<RequestStep>,
    pub response: Vec<ResponseStep>,
    requires_request_body: bool,
    requires_response_body: bool,
    /// Resource this chain was built from (served back by admin endpoints).
    pub resource: RouteChainResource,
}

impl PolicyChain {
    pub fn requires_request_body(&self) -> bool {
        self.requires_request_body
    }

    pub fn requires_response_body(&self) -> bool {
        self.requires_response_body
    }

    /// Body-send directive for the proxy.
    pub fn processing_mode(&self) -> ProcessingMode {
        ProcessingMode::from_flags(self.requires_request_body, self.requires_response_body)
    }
}

/// Built route table contents.
pub type ChainMap = HashMap<String, Arc<PolicyChain>>;

/// Build a chain. Errors carry the route key and list position.
pub fn build_chain(registry: &PolicyRegistry, resource: &RouteChainResource) -> Result<PolicyChain> {
    let route = resource.route_key.as_str();
    if route.is_empty() {
        return Err(EngineError::InvalidConfig("route_key must not be empty".into()));
    }

    let mut requires_request_body = false;
    let mut requires_response_body = false;

    let mut request = Vec::with_capacity(resource.request_policies.len());
    for (i, r) in resource.request_policies.iter().enumerate() {
        let ctx = format!("route `{route}` request_policies[{i}]");
        let (reg, params, condition) = prepare(registry, r, Phase::Request).map_err(|e| e.context(&ctx))?;
        let Some(policy) = reg.capabilities.request.clone() else {
            return Err(EngineError::InvalidConfig(format!(
                "{ctx}: {} cannot run in the request phase",
                reg.definition.key()
            )));
        };
        requires_request_body |= reg.definition.requires_request_body;
        requires_response_body |= reg.definition.requires_response_body;
        request.push(BoundPolicy {
            name: reg.definition.name.clone(),
            version: reg.definition.version.clone(),
            enabled: r.enabled,
            condition,
            params,
            policy,
        });
    }

    let mut response = Vec::with_capacity(resource.response_policies.len());
    for (i, r) in resource.response_policies.iter().enumerate() {
        let ctx = format!("route `{route}` response_policies[{i}]");
        let (reg, params, condition) = prepare(registry, r, Phase::Response).map_err(|e| e.context(&ctx))?;
        let Some(policy) = reg.capabilities.response.clone() else {
            return Err(EngineError::InvalidConfig(format!(
                "{ctx}: {} cannot run in the response phase",
                reg.definition.key()
            )));
        };
        requires_request_body |= reg.definition.requires_request_body;
        requires_response_body |= reg.definition.requires_response_body;
        response.push(BoundPolicy {
            name: reg.definition.name.clone(),
            version: reg.definition.version.clone(),
            enabled: r.enabled,
            condition,
            params,
            policy,
        });
    }

    Ok(PolicyChain {
        route_key: route.to_string(),
        request,
        response,
        requires_request_body,
        requires_response_body,
        resource: resource.clone(),
    })
}

fn prepare<'r>(
    registry: &'r PolicyRegistry,
    r: &PolicyRef,
    phase: Phase,
) -> Result<(&'r RegisteredPolicy, Params, Option<Expression>)> {
    let reg = registry.resolve(&r.name, r.version.as_deref())?;
    if !reg.definition.supports(phase) {
        return Err(EngineError::InvalidConfig(format!(
            "{} does not support the {phase} phase",
            reg.definition.key()
        )));
    }
    let params = reg.definition.validate_params(&r.parameters)?;
    reg.capabilities.validate(&params)?;

    let roots = match phase {
        Phase::Request => REQUEST_ROOTS,
        Phase::Response => RESPONSE_ROOTS,
    };
    let condition = match &r.condition {
        Some(src) => Some(Expression::compile(src, roots)?),
        None => None,
    };
    Ok((reg, params, condition))
}

/// Build every chain of a snapshot, all or nothing.
pub fn build_chains(registry: &PolicyRegistry, resources: &[RouteChainResource]) -> Result<ChainMap> {
    let mut out = HashMap::with_capacity(resources.len());
    for res in resources {
        let chain = build_chain(registry, res)?;
        if out.insert(res.route_key.clone(), Arc::new(chain)).is_some() {
            return Err(EngineError::InvalidConfig(format!(
                "duplicate route_key `{}`",
                res.route_key
            )));
        }
    }
    Ok(out)
}
