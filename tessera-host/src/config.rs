//! Config store - per-plugin TOML documents
//!
//! One document per plugin id, stored as `<dir>/<id>.toml`. The document
//! carries everything the host needs to bring a plugin back: the path and
//! backend kind, declared dependencies, optional resource limits and security
//! policy, and an opaque settings table handed to the plugin at initialize.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tessera_plugin_api::BackendKind;

use crate::error::HostError;
use crate::resource::ResourceLimits;
use crate::security::SecurityPolicy;

/// Persisted configuration for one plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfigDoc {
    /// Plugin id the document belongs to
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Plugin version
    #[serde(default)]
    pub version: String,
    /// Path to the plugin artifact
    pub path: PathBuf,
    /// Backend the plugin loads on
    pub kind: BackendKind,
    /// Whether the plugin should be loaded
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Plugin ids this plugin depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Resource limits to attach at load, if any
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    /// Security policy to attach at load, if any
    #[serde(default)]
    pub security_policy: Option<SecurityPolicy>,
    /// Opaque plugin settings, passed through at initialize
    #[serde(default)]
    pub settings: toml::Table,
}

fn default_enabled() -> bool {
    true
}

impl PluginConfigDoc {
    /// Create a minimal document for a plugin
    pub fn new(id: impl Into<String>, path: PathBuf, kind: BackendKind) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            version: String::new(),
            path,
            kind,
            enabled: true,
            dependencies: Vec::new(),
            resource_limits: None,
            security_policy: None,
            settings: toml::Table::new(),
        }
    }

    /// Settings as the JSON map the plugin contract expects
    pub fn settings_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.settings
            .iter()
            .filter_map(|(k, v)| {
                serde_json::to_value(v).ok().map(|v| (k.clone(), v))
            })
            .collect()
    }
}

/// Directory-backed store of plugin config documents
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Create a store rooted at a directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn doc_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.toml"))
    }

    /// Load the document for a plugin id.
    ///
    /// Returns None if no document exists.
    pub fn load(&self, id: &str) -> Result<Option<PluginConfigDoc>, HostError> {
        let path = self.doc_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let doc: PluginConfigDoc =
            toml::from_str(&content).map_err(|e| HostError::Config(e.to_string()))?;
        Ok(Some(doc))
    }

    /// Save a document, creating the store directory if needed
    pub fn save(&self, doc: &PluginConfigDoc) -> Result<(), HostError> {
        let content =
            toml::to_string_pretty(doc).map_err(|e| HostError::Config(e.to_string()))?;

        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
        }
        std::fs::write(self.doc_path(&doc.id), content)?;
        Ok(())
    }

    /// Delete the document for a plugin id. Returns true if one existed.
    pub fn remove(&self, id: &str) -> Result<bool, HostError> {
        let path = self.doc_path(id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    /// Ids of all stored documents
    pub fn list(&self) -> Result<Vec<String>, HostError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
