//! Plugin loader abstraction
//!
//! Each backend (dynamic library, subprocess RPC, sandboxed bytecode,
//! hot reload) implements [`PluginLoader`]. Loaders turn an artifact path
//! into a [`LoadedPlugin`] whose instance satisfies the capability contract;
//! everything above the loader treats all backends the same.

pub mod dynamic;
pub mod hot_reload;
pub mod rpc;
pub mod wasm;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

use tessera_plugin_api::{BackendKind, Plugin};

pub use dynamic::DynamicLoader;
pub use hot_reload::{HotReloadConfig, HotReloadLoader, InstanceFactory};
pub use rpc::{RpcLoader, RpcLoaderConfig};
pub use wasm::{SandboxConfig, WasmLoader};

/// A plugin instance shared between the loader and the host.
///
/// Calls into the instance are synchronous and happen on blocking threads,
/// so a std mutex guards it.
pub type SharedPlugin = Arc<Mutex<Box<dyn Plugin>>>;

/// Errors loaders can produce
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Artifact not found on disk
    #[error("Plugin artifact not found: {path}")]
    NotFound { path: PathBuf },

    /// Artifact exists but is not a valid plugin for this backend
    #[error("Invalid plugin format: {reason}")]
    InvalidFormat { reason: String },

    /// A required symbol or export is missing
    #[error("Required symbol missing: {symbol}")]
    SymbolMissing { symbol: String },

    /// API version mismatch between host and plugin
    #[error("API version mismatch: host expects {expected}, plugin has {found}")]
    ApiVersionMismatch { expected: u32, found: u32 },

    /// The sandbox or a policy refused to run the artifact
    #[error("Security rejected: {reason}")]
    SecurityRejected { reason: String },

    /// A backend operation exceeded its deadline
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// A plugin with this id is already loaded by this backend
    #[error("Plugin '{id}' is already loaded")]
    AlreadyLoaded { id: String },

    /// No plugin with this id is loaded by this backend
    #[error("Plugin '{id}' is not loaded")]
    NotLoaded { id: String },

    /// Failed to load the dynamic library
    #[error("Failed to load library: {0}")]
    Library(#[from] libloading::Error),

    /// Backend-specific failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A plugin that has been loaded by some backend
#[derive(Clone)]
pub struct LoadedPlugin {
    /// Plugin id, unique across the host
    pub id: String,
    /// Artifact path the plugin was loaded from
    pub path: PathBuf,
    /// Backend that produced this plugin
    pub kind: BackendKind,
    /// The live instance
    pub instance: SharedPlugin,
    /// OS process running the plugin, for out-of-process backends.
    /// In-process backends leave this `None`; their memory and CPU are the
    /// host's own and cannot be attributed to one plugin.
    pub pid: Option<u32>,
    /// When the plugin was loaded
    pub load_time: DateTime<Utc>,
    last_access: Arc<RwLock<DateTime<Utc>>>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("pid", &self.pid)
            .field("load_time", &self.load_time)
            .finish_non_exhaustive()
    }
}

impl LoadedPlugin {
    /// Create a record for a freshly loaded instance
    pub fn new(
        id: impl Into<String>,
        path: PathBuf,
        kind: BackendKind,
        instance: SharedPlugin,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            path,
            kind,
            instance,
            pid: None,
            load_time: now,
            last_access: Arc::new(RwLock::new(now)),
        }
    }

    /// Builder: attach the OS pid of the process running this plugin
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Record that the plugin was just used
    pub fn touch(&self) {
        *self.last_access.write().expect("last_access poisoned") = Utc::now();
    }

    /// When the plugin was last used
    pub fn last_access(&self) -> DateTime<Utc> {
        *self.last_access.read().expect("last_access poisoned")
    }
}

/// Contract every backend loader implements
#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Which backend this loader serves
    fn kind(&self) -> BackendKind;

    /// Check an artifact without loading it
    fn validate(&self, path: &Path) -> Result<(), LoaderError>;

    /// Load an artifact and produce a live plugin
    async fn load(&self, path: &Path) -> Result<LoadedPlugin, LoaderError>;

    /// Unload a plugin this loader produced
    async fn unload(&self, id: &str) -> Result<(), LoaderError>;

    /// Reload a plugin in place
    async fn reload(&self, id: &str) -> Result<(), LoaderError>;

    /// Ids of all plugins this loader currently holds
    async fn loaded(&self) -> Vec<String>;

    /// Whether a plugin id is currently loaded
    async fn is_loaded(&self, id: &str) -> bool {
        self.loaded().await.iter().any(|l| l == id)
    }

    /// Release everything this loader holds
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_error_display() {
        let err = LoaderError::NotFound {
            path: PathBuf::from("/missing.so"),
        };
        assert!(err.to_string().contains("/missing.so"));

        let err = LoaderError::SymbolMissing {
            symbol: "_tessera_plugin_create".to_string(),
        };
        assert!(err.to_string().contains("_tessera_plugin_create"));

        let err = LoaderError::ApiVersionMismatch {
            expected: 1,
            found: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_loaded_plugin_touch_advances_last_access() {
        struct Noop;
        impl Plugin for Noop {
            fn info(&self) -> tessera_plugin_api::PluginInfo {
                tessera_plugin_api::PluginInfo::default()
            }
            fn initialize(
                &mut self,
                _ctx: &tessera_plugin_api::PluginContext,
            ) -> Result<(), tessera_plugin_api::PluginError> {
                Ok(())
            }
        }

        let plugin = LoadedPlugin::new(
            "p1",
            PathBuf::from("/p1.so"),
            BackendKind::Dynamic,
            Arc::new(Mutex::new(Box::new(Noop))),
        );

        let before = plugin.last_access();
        std::thread::sleep(std::time::Duration::from_millis(5));
        plugin.touch();
        assert!(plugin.last_access() > before);
    }
}
