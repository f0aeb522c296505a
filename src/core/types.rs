use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque configuration payload captured from, or replayed onto, a bucket.
///
/// The engine never inspects payloads; it only stores and forwards them.
pub type Payload = serde_json::Value;

/// Destination parameters for a migration unit.
///
/// Passed through to the storage client unmodified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl TargetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// One independently migrated entity, e.g. a single bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationUnit {
    id: String,
    #[serde(default)]
    pub target: TargetConfig,
}

impl MigrationUnit {
    pub fn new(id: impl Into<String>, target: TargetConfig) -> Self {
        Self {
            id: id.into(),
            target,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}
