use crate::core::errors::{ProcessionError, Result};
use crate::definition::model::ProcessDefinition;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Read-only queryable catalog of deployed process definitions, keyed by
/// definition key with ascending versions. Definitions are immutable once
/// deployed; redeploying an existing key+version is rejected.
#[derive(Debug, Default)]
pub struct DefinitionCatalog {
    by_key: DashMap<String, BTreeMap<i32, Arc<ProcessDefinition>>>,
}

impl DefinitionCatalog {
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
        }
    }

    /// Deploy a definition. Fails if the key+version pair already exists.
    pub fn deploy(&self, definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>> {
        let definition = Arc::new(definition);
        let mut versions = self
            .by_key
            .entry(definition.key().to_string())
            .or_default();
        if versions.contains_key(&definition.version()) {
            return Err(ProcessionError::validation(format!(
                "definition '{}' is already deployed; deployed versions are immutable",
                definition.id()
            )));
        }
        versions.insert(definition.version(), definition.clone());
        info!(
            definition_id = definition.id(),
            "Deployed process definition"
        );
        Ok(definition)
    }

    /// Deploy a definition from a YAML document
    pub fn deploy_yaml(&self, doc: &str) -> Result<Arc<ProcessDefinition>> {
        self.deploy(ProcessDefinition::from_yaml(doc)?)
    }

    /// Latest deployed version for a key
    pub fn latest(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        self.by_key
            .get(key)
            .and_then(|versions| versions.values().next_back().cloned())
    }

    /// A specific deployed version for a key
    pub fn by_version(&self, key: &str, version: i32) -> Option<Arc<ProcessDefinition>> {
        self.by_key
            .get(key)
            .and_then(|versions| versions.get(&version).cloned())
    }

    /// Look up by definition id (`key:version`)
    pub fn by_id(&self, definition_id: &str) -> Option<Arc<ProcessDefinition>> {
        let (key, version) = definition_id.rsplit_once(':')?;
        let version: i32 = version.parse().ok()?;
        self.by_version(key, version)
    }

    /// Latest version, failing with `DefinitionNotFound` if the key is
    /// unknown
    pub fn require_latest(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        self.latest(key)
            .ok_or_else(|| ProcessionError::definition_not_found(key))
    }

    /// Pinned version, failing with `DefinitionNotFound` if the key or
    /// the version is missing
    pub fn require_version(&self, key: &str, version: i32) -> Result<Arc<ProcessDefinition>> {
        self.by_version(key, version)
            .ok_or_else(|| ProcessionError::definition_version_not_found(key, version))
    }

    /// Pinned version, failing with `DefinitionNotFound` carrying the
    /// definition id
    pub fn require_id(&self, definition_id: &str) -> Result<Arc<ProcessDefinition>> {
        self.by_id(definition_id)
            .ok_or_else(|| ProcessionError::definition_not_found(definition_id))
    }

    pub fn deployed_keys(&self) -> Vec<String> {
        self.by_key.iter().map(|e| e.key().clone()).collect()
    }
}
