//! Policy registry: definitions keyed by `(name, version)` plus the
//! implementations that serve them.
//!
//! A registry is immutable once built. Reloading the definitions directory
//! builds a fresh registry and swaps it in as a whole.

mod builtin;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use semver::{Version, VersionReq};

use chainward_core::error::{EngineError, Result};
use chainward_core::policy::{Capabilities, DefinitionDoc, Phase, PolicyDefinition};

pub use builtin::{builtin_builder, builtin_registry};

/// A definition together with the implementation bound to it.
#[derive(Debug, Clone)]
pub struct RegisteredPolicy {
    pub definition: Arc<PolicyDefinition>,
    pub capabilities: Capabilities,
}

struct Implementation {
    name: String,
    versions: VersionReq,
    capabilities: Capabilities,
}

#[derive(Default)]
pub struct RegistryBuilder {
    definitions: Vec<PolicyDefinition>,
    implementations: Vec<Implementation>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn definition(mut self, def: PolicyDefinition) -> Self {
        self.definitions.push(def);
        self
    }

    /// Parse one YAML descriptor. `origin` is used in error messages.
    pub fn definition_yaml(self, src: &str, origin: &str) -> Result<Self> {
        let doc: DefinitionDoc = serde_yaml::from_str(src)
            .map_err(|e| EngineError::InvalidConfig(format!("{origin}: invalid descriptor: {e}")))?;
        let def = PolicyDefinition::from_doc(doc).map_err(|e| e.context(origin))?;
        Ok(self.definition(def))
    }

    /// Load every `*.yaml` / `*.yml` file in `dir`, in file-name order.
    pub fn definitions_dir(mut self, dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir).map_err(|e| {
            EngineError::InvalidConfig(format!("read definitions dir {} failed: {e}", dir.display()))
        })?;
        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(p.extension().and_then(|x| x.to_str()), Some("yaml" | "yml"))
            })
            .collect();
        files.sort();

        for path in files {
            let src = fs::read_to_string(&path).map_err(|e| {
                EngineError::InvalidConfig(format!("read {} failed: {e}", path.display()))
            })?;
            self = self.definition_yaml(&src, &path.display().to_string())?;
        }
        Ok(self)
    }

    /// Bind an implementation to every definition of `name` whose version
    /// matches `versions` (e.g. `^1`).
    pub fn implementation(mut self, name: &str, versions: &str, capabilities: Capabilities) -> Result<Self> {
        let versions = VersionReq::parse(versions).map_err(|e| {
            EngineError::InvalidConfig(format!("implementation {name}: bad version requirement: {e}"))
        })?;
        self.implementations.push(Implementation {
            name: name.to_string(),
            versions,
            capabilities,
        });
        Ok(self)
    }

    /// Cross-check definitions against implementations.
    ///
    /// Every definition must have exactly one implementation, and that
    /// implementation must provide every phase the definition declares.
    pub fn build(self) -> Result<PolicyRegistry> {
        let mut policies: BTreeMap<String, BTreeMap<Version, RegisteredPolicy>> = BTreeMap::new();

        for def in self.definitions {
            let key = def.key();
            let mut matching = self
                .implementations
                .iter()
                .filter(|i| i.name == def.name && i.versions.matches(&def.version));
            let Some(imp) = matching.next() else {
                return Err(EngineError::InvalidConfig(format!(
                    "definition {key} has no registered implementation"
                )));
            };
            if matching.next().is_some() {
                return Err(EngineError::InvalidConfig(format!(
                    "definition {key} matches more than one implementation"
                )));
            }
            for phase in &def.phases {
                if !imp.capabilities.supports(*phase) {
                    return Err(EngineError::InvalidConfig(format!(
                        "definition {key} declares the {phase} phase but its implementation does not provide it"
                    )));
                }
            }

            let versions = policies.entry(def.name.clone()).or_default();
            if versions.contains_key(&def.version) {
                return Err(EngineError::InvalidConfig(format!("duplicate definition {key}")));
            }
            versions.insert(
                def.version.clone(),
                RegisteredPolicy {
                    definition: Arc::new(def),
                    capabilities: imp.capabilities.clone(),
                },
            );
        }

        Ok(PolicyRegistry { policies })
    }
}

#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, BTreeMap<Version, RegisteredPolicy>>,
}

impl PolicyRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Resolve a reference. `None` picks the highest registered version.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Result<&RegisteredPolicy> {
        let unknown = || EngineError::UnknownPolicy {
            name: name.to_string(),
            version: version.unwrap_or("latest").to_string(),
        };
        let versions = self.policies.get(name).ok_or_else(unknown)?;
        match version {
            None => versions.values().next_back().ok_or_else(unknown),
            Some(v) => {
                let v = Version::parse(v).map_err(|e| EngineError::InvalidConfig(format!(
                    "policy {name}: version `{v}` is not semver: {e}"
                )))?;
                versions.get(&v).ok_or_else(unknown)
            }
        }
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Arc<PolicyDefinition>> {
        self.policies
            .values()
            .flat_map(|v| v.values().map(|p| &p.definition))
    }

    pub fn len(&self) -> usize {
        self.policies.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `name@version` supports `phase`.
    pub fn supports(&self, name: &str, version: Option<&str>, phase: Phase) -> bool {
        self.resolve(name, version)
            .map(|p| p.definition.supports(phase))
            .unwrap_or(false)
    }
}

/// Build the registry the engine runs with: built-ins plus an optional
/// operator directory.
pub fn load_registry(definitions_dir: Option<&Path>) -> Result<PolicyRegistry> {
    let mut builder = builtin::builtin_builder()?;
    if let Some(dir) = definitions_dir {
        builder = builder.definitions_dir(dir)?;
    }
    builder.build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn omitted_version_resolves_to_highest() {
        let extra = r#"
name: set-header
version: 1.4.0
phases: [request, response]
parameters:
  - { name: name, type: string, required: true }
"#;
        let reg = builtin::builtin_builder()
            .unwrap()
            .definition_yaml(extra, "extra.yaml")
            .unwrap()
            .build()
            .unwrap();
        let latest = reg.resolve("set-header", None).unwrap();
        assert_eq!(latest.definition.version, Version::new(1, 4, 0));
        let pinned = reg.resolve("set-header", Some("1.0.0")).unwrap();
        assert_eq!(pinned.definition.version, Version::new(1, 0, 0));
    }

    #[test]
    fn unknown_version_is_unknown_policy() {
        let reg = builtin_registry().unwrap();
        let err = reg.resolve("api-key", Some("9.9.9")).unwrap_err();
        assert_eq!(err.code().as_str(), "UNKNOWN_POLICY");
        assert!(reg.resolve("nope", None).is_err());
    }

    #[test]
    fn definition_without_implementation_is_rejected() {
        let orphan = "name: geo-block\nversion: 1.0.0\nphases: [request]\n";
        let err = builtin::builtin_builder()
            .unwrap()
            .definition_yaml(orphan, "geo.yaml")
            .unwrap()
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no registered implementation"));
    }

    #[test]
    fn phase_without_capability_is_rejected() {
        // jwt-auth has no response capability
        let bad = "name: jwt-auth\nversion: 1.1.0\nphases: [request, response]\nparameters:\n  - { name: secret, type: string, required: true }\n";
        let err = builtin::builtin_builder()
            .unwrap()
            .definition_yaml(bad, "jwt.yaml")
            .unwrap()
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("response phase"));
    }

    #[test]
    fn duplicate_definition_is_rejected() {
        let dup = include_str!("../../policies/api-key.yaml");
        let err = builtin::builtin_builder()
            .unwrap()
            .definition_yaml(dup, "dup.yaml")
            .unwrap()
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn builtins_are_complete() {
        let reg = builtin_registry().unwrap();
        assert_eq!(reg.len(), 4);
        assert!(reg.supports("json-body-transform", None, Phase::Response));
        assert!(!reg.supports("api-key", None, Phase::Response));
    }
}
