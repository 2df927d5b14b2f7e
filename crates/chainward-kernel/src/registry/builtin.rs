//! Reference policies shipped with the engine.

use std::sync::Arc;

use chainward_core::error::Result;
use chainward_core::policy::Capabilities;

use super::{PolicyRegistry, RegistryBuilder};
use crate::policies::{ApiKey, JsonBodyTransform, JwtAuth, SetHeader};

const DESCRIPTORS: &[(&str, &str)] = &[
    ("set-header.yaml", include_str!("../../policies/set-header.yaml")),
    ("jwt-auth.yaml", include_str!("../../policies/jwt-auth.yaml")),
    ("api-key.yaml", include_str!("../../policies/api-key.yaml")),
    ("json-body-transform.yaml", include_str!("../../policies/json-body-transform.yaml")),
];

/// Builder pre-loaded with the reference policies; callers may add more.
pub fn builtin_builder() -> Result<RegistryBuilder> {
    let mut b = RegistryBuilder::new()
        .implementation("set-header", "^1", Capabilities::both(Arc::new(SetHeader)))?
        .implementation("jwt-auth", "^1", Capabilities::request_only(Arc::new(JwtAuth)))?
        .implementation("api-key", "^1", Capabilities::request_only(Arc::new(ApiKey)))?
        .implementation(
            "json-body-transform",
            "^1",
            Capabilities::both(Arc::new(JsonBodyTransform)),
        )?;
    for (origin, src) in DESCRIPTORS {
        b = b.definition_yaml(src, &format!("builtin:{origin}"))?;
    }
    Ok(b)
}

/// Registry with only the reference policies.
pub fn builtin_registry() -> Result<PolicyRegistry> {
    builtin_builder()?.build()
}
