//! Configuration-distribution envelopes (xDS-style state-of-the-world).
//!
//! The server pushes full snapshots of route chains. Every push carries a
//! monotonically increasing `version_info` and a fresh `nonce`. A subscriber
//! acknowledges by echoing both; it rejects (NACK) by echoing the nonce with
//! the last version it accepted plus an `error_detail`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Resource type served on the distribution stream.
pub const ROUTE_CHAIN_TYPE_URL: &str = "type.chainward.dev/chainward.v1.RouteChain";

/// Subscription to every route.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl From<&EngineError> for ErrorDetail {
    fn from(e: &EngineError) -> Self {
        Self {
            code: e.code().as_str().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryRequest {
    pub node_id: String,
    /// Last version the subscriber accepted (empty before the first ACK).
    #[serde(default)]
    pub version_info: String,
    /// Empty or `["*"]` subscribes to every route.
    #[serde(default)]
    pub resource_names: Vec<String>,
    /// Nonce of the push being answered (empty on the initial request).
    #[serde(default)]
    pub response_nonce: String,
    #[serde(default)]
    pub type_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
}

impl DiscoveryRequest {
    /// Initial subscription request.
    pub fn subscribe(node_id: impl Into<String>, resource_names: Vec<String>) -> Self {
        Self {
            node_id: node_id.into(),
            resource_names,
            type_url: ROUTE_CHAIN_TYPE_URL.to_string(),
            ..Default::default()
        }
    }

    pub fn ack(&self, resp: &DiscoveryResponse) -> Self {
        Self {
            version_info: resp.version_info.clone(),
            response_nonce: resp.nonce.clone(),
            error_detail: None,
            ..self.clone()
        }
    }

    /// Reject `resp`, keeping `accepted_version` as the last good version.
    pub fn nack(&self, resp: &DiscoveryResponse, accepted_version: &str, err: &EngineError) -> Self {
        Self {
            version_info: accepted_version.to_string(),
            response_nonce: resp.nonce.clone(),
            error_detail: Some(err.into()),
            ..self.clone()
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.resource_names.is_empty() || self.resource_names.iter().any(|n| n == WILDCARD)
    }

    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }

    /// Whether this subscription covers `route_key`.
    pub fn wants(&self, route_key: &str) -> bool {
        self.is_wildcard() || self.resource_names.iter().any(|n| n == route_key)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::BadRequest(format!("invalid discovery request: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::Internal(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryResponse {
    pub version_info: String,
    #[serde(default)]
    pub resources: Vec<RouteChainResource>,
    pub nonce: String,
    #[serde(default)]
    pub type_url: String,
}

impl DiscoveryResponse {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::BadRequest(format!("invalid discovery response: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::Internal(e.to_string()))
    }
}

/// Reference to a registered policy inside a route chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRef {
    pub name: String,
    /// Omitted: highest registered version of `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl PolicyRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            enabled: true,
            parameters: Map::new(),
            condition: None,
        }
    }

    pub fn version(mut self, v: impl Into<String>) -> Self {
        self.version = Some(v.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Bookkeeping maintained by the distribution server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_version: u64,
}

/// One route key bound to its request and response policy lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteChainResource {
    pub route_key: String,
    #[serde(default)]
    pub request_policies: Vec<PolicyRef>,
    #[serde(default)]
    pub response_policies: Vec<PolicyRef>,
    #[serde(default)]
    pub metadata: ResourceMeta,
}

impl RouteChainResource {
    pub fn new(route_key: impl Into<String>) -> Self {
        Self {
            route_key: route_key.into(),
            request_policies: Vec::new(),
            response_policies: Vec::new(),
            metadata: ResourceMeta::default(),
        }
    }

    pub fn request(mut self, p: PolicyRef) -> Self {
        self.request_policies.push(p);
        self
    }

    pub fn response(mut self, p: PolicyRef) -> Self {
        self.response_policies.push(p);
        self
    }

    /// Equality of the policy content, ignoring bookkeeping.
    pub fn same_content(&self, other: &RouteChainResource) -> bool {
        self.route_key == other.route_key
            && self.request_policies == other.request_policies
            && self.response_policies == other.response_policies
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_forms() {
        let mut req = DiscoveryRequest::subscribe("n1", vec![]);
        assert!(req.is_wildcard());
        req.resource_names = vec!["*".into()];
        assert!(req.wants("anything"));
        req.resource_names = vec!["orders".into()];
        assert!(req.wants("orders"));
        assert!(!req.wants("users"));
    }

    #[test]
    fn nack_keeps_accepted_version_and_echoes_nonce() {
        let sub = DiscoveryRequest::subscribe("n1", vec![]);
        let push = DiscoveryResponse {
            version_info: "7".into(),
            nonce: "abc".into(),
            ..Default::default()
        };
        let err = EngineError::UnknownPolicy {
            name: "nope".into(),
            version: "1.0.0".into(),
        };
        let nack = sub.nack(&push, "6", &err);
        assert_eq!(nack.version_info, "6");
        assert_eq!(nack.response_nonce, "abc");
        assert_eq!(nack.error_detail.unwrap().code, "UNKNOWN_POLICY");

        let ack = sub.ack(&push);
        assert_eq!((ack.version_info.as_str(), ack.response_nonce.as_str()), ("7", "abc"));
        assert!(!ack.is_nack());
    }

    #[test]
    fn policy_ref_defaults_enabled() {
        let p: PolicyRef = serde_json::from_str(r#"{"name": "api-key"}"#).unwrap();
        assert!(p.enabled);
        assert!(p.version.is_none());
        assert!(serde_json::from_str::<PolicyRef>(r#"{"name": "x", "bogus": 1}"#).is_err());
    }
}
