//! Engine config loader (strict parsing).

pub mod schema;

use std::fs;
use std::path::Path;

use chainward_core::error::{EngineError, Result};

pub use schema::{
    DistributionSection, EngineConfig, EngineSection, FailureMode, PoliciesSection, RoutesFile,
    ServerSection,
};

pub fn load_from_file(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let path = path.as_ref();
    let s = fs::read_to_string(path).map_err(|e| {
        EngineError::InvalidConfig(format!("read config {} failed: {e}", path.display()))
    })?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<EngineConfig> {
    let cfg: EngineConfig = serde_yaml::from_str(s)
        .map_err(|e| EngineError::InvalidConfig(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load a routes seed file (`routes: [...]`).
pub fn load_routes_file(path: impl AsRef<Path>) -> Result<RoutesFile> {
    let path = path.as_ref();
    let s = fs::read_to_string(path).map_err(|e| {
        EngineError::InvalidConfig(format!("read routes {} failed: {e}", path.display()))
    })?;
    let routes: RoutesFile = serde_yaml::from_str(&s)
        .map_err(|e| EngineError::InvalidConfig(format!("invalid routes yaml: {e}")))?;
    routes.validate()?;
    Ok(routes)
}
