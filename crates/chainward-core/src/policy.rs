//! Policy contract: capability traits and registered definitions.
//!
//! A policy implementation opts into the request phase, the response phase, or
//! both by implementing `RequestPolicy` and/or `ResponsePolicy`. The chain
//! builder only places a policy on a list it has a capability for, so the
//! executor never asks a policy to run in a phase it cannot serve.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::{RequestAction, ResponseAction};
use crate::context::{RequestContext, ResponseContext};
use crate::error::{EngineError, Result};
use crate::params::{validate_params, CompiledParam, ParamSchema, Params};

/// Base contract shared by both capabilities.
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Cross-field checks the declarative schema cannot express.
    /// Runs once per chain build, after schema validation.
    fn validate(&self, _params: &Params) -> Result<()> {
        Ok(())
    }
}

/// Request-phase capability. `Ok(None)` means "nothing to change".
#[async_trait]
pub trait RequestPolicy: Policy {
    async fn on_request(&self, ctx: &RequestContext, params: &Params) -> Result<Option<RequestAction>>;
}

/// Response-phase capability. `Ok(None)` means "nothing to change".
#[async_trait]
pub trait ResponsePolicy: Policy {
    async fn on_response(
        &self,
        ctx: &ResponseContext,
        params: &Params,
    ) -> Result<Option<ResponseAction>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Request,
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Request => "request",
            Phase::Response => "response",
        })
    }
}

/// The phase entry points one implementation provides.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub request: Option<Arc<dyn RequestPolicy>>,
    pub response: Option<Arc<dyn ResponsePolicy>>,
}

impl Capabilities {
    pub fn request_only(p: Arc<dyn RequestPolicy>) -> Self {
        Self {
            request: Some(p),
            response: None,
        }
    }

    pub fn response_only(p: Arc<dyn ResponsePolicy>) -> Self {
        Self {
            request: None,
            response: Some(p),
        }
    }

    pub fn both<P>(p: Arc<P>) -> Self
    where
        P: RequestPolicy + ResponsePolicy + 'static,
    {
        Self {
            request: Some(p.clone()),
            response: Some(p),
        }
    }

    pub fn supports(&self, phase: Phase) -> bool {
        match phase {
            Phase::Request => self.request.is_some(),
            Phase::Response => self.response.is_some(),
        }
    }

    /// Run the implementation's own parameter checks.
    pub fn validate(&self, params: &Params) -> Result<()> {
        if let Some(p) = &self.request {
            return p.validate(params);
        }
        if let Some(p) = &self.response {
            return p.validate(params);
        }
        Ok(())
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("request", &self.request.as_ref().map(|p| p.name().to_string()))
            .field("response", &self.response.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

/// Example configuration shipped with a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefinitionExample {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// On-disk descriptor shape (one YAML document per policy version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefinitionDoc {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub requires_request_body: bool,
    #[serde(default)]
    pub requires_response_body: bool,
    #[serde(default)]
    pub parameters: Vec<ParamSchema>,
    #[serde(default)]
    pub examples: Vec<DefinitionExample>,
}

/// A registered, immutable policy definition keyed by `(name, version)`.
#[derive(Debug, Clone)]
pub struct PolicyDefinition {
    pub name: String,
    pub version: Version,
    pub description: String,
    pub phases: BTreeSet<Phase>,
    pub requires_request_body: bool,
    pub requires_response_body: bool,
    pub parameters: Vec<CompiledParam>,
    pub examples: Vec<DefinitionExample>,
}

impl PolicyDefinition {
    /// Validate a descriptor and compile its parameter schemas.
    ///
    /// Shipped examples are validated against the schemas too, so a
    /// descriptor whose own examples are wrong never registers.
    pub fn from_doc(doc: DefinitionDoc) -> Result<Self> {
        let bad = |msg: String| EngineError::InvalidConfig(format!("definition `{}`: {msg}", doc.name));

        if doc.name.is_empty()
            || !doc
                .name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(bad("name must be non-empty lowercase [a-z0-9-]".into()));
        }
        let version = Version::parse(&doc.version)
            .map_err(|e| bad(format!("version `{}` is not semver: {e}", doc.version)))?;

        let phases: BTreeSet<Phase> = doc.phases.iter().copied().collect();
        if phases.is_empty() {
            return Err(bad("at least one phase is required".into()));
        }
        if phases.len() != doc.phases.len() {
            return Err(bad("duplicate phase".into()));
        }
        if doc.requires_request_body && !phases.contains(&Phase::Request) {
            return Err(bad("requires_request_body without the request phase".into()));
        }
        if doc.requires_response_body && !phases.contains(&Phase::Response) {
            return Err(bad("requires_response_body without the response phase".into()));
        }

        let mut seen = BTreeSet::new();
        let mut parameters = Vec::with_capacity(doc.parameters.len());
        for schema in doc.parameters.iter().cloned() {
            if !seen.insert(schema.name.clone()) {
                return Err(bad(format!("duplicate parameter `{}`", schema.name)));
            }
            parameters.push(CompiledParam::compile(schema).map_err(|e| bad(e.to_string()))?);
        }

        let def = Self {
            name: doc.name.clone(),
            version,
            description: doc.description.clone(),
            phases,
            requires_request_body: doc.requires_request_body,
            requires_response_body: doc.requires_response_body,
            parameters,
            examples: doc.examples.clone(),
        };

        for (i, ex) in def.examples.iter().enumerate() {
            def.validate_params(&ex.parameters)
                .map_err(|e| bad(format!("example {i} is invalid: {e}")))?;
        }
        Ok(def)
    }

    /// `name@version`
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    pub fn supports(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    pub fn requires_body(&self, phase: Phase) -> bool {
        match phase {
            Phase::Request => self.requires_request_body,
            Phase::Response => self.requires_response_body,
        }
    }

    pub fn validate_params(&self, raw: &Map<String, Value>) -> Result<Params> {
        validate_params(&self.key(), &self.parameters, raw)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> DefinitionDoc {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn builds_definition_and_validates_examples() {
        let d = PolicyDefinition::from_doc(doc(json!({
            "name": "rate-note",
            "version": "1.2.0",
            "phases": ["request"],
            "parameters": [{"name": "limit", "type": "integer", "minimum": 1, "default": 10}],
            "examples": [{"parameters": {"limit": 5}}]
        })))
        .unwrap();
        assert_eq!(d.key(), "rate-note@1.2.0");
        assert!(d.supports(Phase::Request));
        assert!(!d.supports(Phase::Response));
    }

    #[test]
    fn invalid_example_rejects_definition() {
        let err = PolicyDefinition::from_doc(doc(json!({
            "name": "rate-note",
            "version": "1.0.0",
            "phases": ["request"],
            "parameters": [{"name": "limit", "type": "integer", "minimum": 1}],
            "examples": [{"parameters": {"limit": 0}}]
        })))
        .unwrap_err();
        assert!(err.to_string().contains("example 0"));
    }

    #[test]
    fn body_requirement_must_match_phase() {
        let err = PolicyDefinition::from_doc(doc(json!({
            "name": "x",
            "version": "1.0.0",
            "phases": ["request"],
            "requires_response_body": true
        })));
        assert!(err.is_err());
    }

    #[test]
    fn bad_semver_is_rejected() {
        assert!(PolicyDefinition::from_doc(doc(json!({
            "name": "x", "version": "one", "phases": ["request"]
        })))
        .is_err());
    }
}
