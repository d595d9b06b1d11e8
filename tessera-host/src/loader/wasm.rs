//! Sandboxed bytecode backend
//!
//! Runs wasm plugins inside an Extism sandbox with a memory ceiling and a
//! fuel budget per call. Modules are validated with `wasmparser` before
//! instantiation, and the required guest exports are checked before the
//! plugin is handed to the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use tessera_plugin_api::{
    BackendKind, HealthStatus, Plugin, PluginContext, PluginError, PluginInfo,
};

use super::{LoadedPlugin, LoaderError, PluginLoader};

/// Exports every guest module must provide
pub const REQUIRED_EXPORTS: &[&str] = &[
    "plugin_init",
    "plugin_info",
    "plugin_execute",
    "plugin_cleanup",
];

/// Exports the host uses when present
pub const OPTIONAL_EXPORTS: &[&str] = &[
    "plugin_health",
    "plugin_config",
    "plugin_event",
    "plugin_start",
    "plugin_stop",
];

/// Configuration for the wasm sandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum guest memory in bytes (rounded down to 64 KiB pages)
    pub memory_limit: usize,
    /// Fuel budget per call
    pub fuel_limit: u64,
    /// Whether WASI is available to guests. Off by default: guests cannot
    /// reach env vars, the filesystem, or stdio.
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            wasi_enabled: false,
        }
    }
}

fn classify_call_error(message: &str) -> PluginError {
    if message.contains("fuel") {
        PluginError::FuelExhausted
    } else if message.contains("memory") {
        PluginError::MemoryExceeded
    } else {
        PluginError::Internal(message.to_string())
    }
}

/// A wasm module instantiated inside the sandbox, satisfying the plugin
/// contract by dispatching to guest exports with JSON in and out.
pub struct SandboxedPlugin {
    sandbox: Mutex<extism::Plugin>,
    info: PluginInfo,
    config: serde_json::Map<String, serde_json::Value>,
}

impl SandboxedPlugin {
    /// Instantiate a module from raw bytes.
    ///
    /// Checks the required export set and fetches the plugin's self-reported
    /// info before returning.
    pub fn from_bytes(
        bytes: Vec<u8>,
        path: &Path,
        config: &SandboxConfig,
    ) -> Result<Self, LoaderError> {
        let manifest = extism::Manifest::new([extism::Wasm::data(bytes)])
            .with_memory_max((config.memory_limit / 65536) as u32);

        let mut sandbox = extism::PluginBuilder::new(manifest)
            .with_wasi(config.wasi_enabled)
            .with_fuel_limit(config.fuel_limit)
            .build()
            .map_err(|e| LoaderError::Backend(e.to_string()))?;

        for export in REQUIRED_EXPORTS {
            if !sandbox.function_exists(export) {
                return Err(LoaderError::SymbolMissing {
                    symbol: export.to_string(),
                });
            }
        }

        let info_bytes = sandbox
            .call::<&[u8], Vec<u8>>("plugin_info", b"{}")
            .map_err(|e| LoaderError::Backend(e.to_string()))?;
        let mut info: PluginInfo = serde_json::from_slice(&info_bytes)
            .map_err(|e| LoaderError::InvalidFormat {
                reason: format!("plugin_info returned invalid metadata: {e}"),
            })?;
        if info.id.is_empty() {
            return Err(LoaderError::InvalidFormat {
                reason: "plugin reported an empty id".to_string(),
            });
        }
        info.kind = BackendKind::Wasm;
        info.path = path.to_path_buf();

        Ok(Self {
            sandbox: Mutex::new(sandbox),
            info,
            config: serde_json::Map::new(),
        })
    }

    fn call(&self, export: &str, input: &[u8]) -> Result<Vec<u8>, PluginError> {
        let mut sandbox = self.sandbox.lock().expect("sandbox poisoned");
        sandbox
            .call::<&[u8], Vec<u8>>(export, input)
            .map_err(|e| classify_call_error(&e.to_string()))
    }

    fn call_if_present(&self, export: &str, input: &[u8]) -> Result<Option<Vec<u8>>, PluginError> {
        let exists = self.sandbox.lock().expect("sandbox poisoned").function_exists(export);
        if !exists {
            return Ok(None);
        }
        self.call(export, input).map(Some)
    }

    /// Run the guest's main entry point with raw JSON input
    pub fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, PluginError> {
        let output = self.call("plugin_execute", &serde_json::to_vec(&input)?)?;
        Ok(serde_json::from_slice(&output)?)
    }

    /// Deliver an event to the guest, if it handles events
    pub fn deliver_event(&self, event: serde_json::Value) -> Result<(), PluginError> {
        self.call_if_present("plugin_event", &serde_json::to_vec(&event)?)?;
        Ok(())
    }
}

impl Plugin for SandboxedPlugin {
    fn info(&self) -> PluginInfo {
        self.info.clone()
    }

    fn initialize(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.config = ctx.config().clone();
        let input = serde_json::to_vec(&serde_json::Value::Object(self.config.clone()))?;
        self.call("plugin_init", &input)?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), PluginError> {
        self.call_if_present("plugin_start", b"{}")?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PluginError> {
        self.call_if_present("plugin_stop", b"{}")?;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), PluginError> {
        self.call("plugin_cleanup", b"{}")?;
        Ok(())
    }

    fn health_check(&self) -> Result<HealthStatus, PluginError> {
        match self.call_if_present("plugin_health", b"{}")? {
            Some(output) => Ok(serde_json::from_slice(&output)?),
            None => Ok(HealthStatus::Healthy),
        }
    }

    fn get_config(&self) -> serde_json::Map<String, serde_json::Value> {
        self.config.clone()
    }

    fn set_config(
        &mut self,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), PluginError> {
        let input = serde_json::to_vec(&serde_json::Value::Object(config.clone()))?;
        self.call_if_present("plugin_config", &input)?;
        self.config = config;
        Ok(())
    }
}

/// Loader for sandboxed wasm plugins
pub struct WasmLoader {
    config: SandboxConfig,
    plugins: RwLock<HashMap<String, LoadedPlugin>>,
}

impl WasmLoader {
    /// Create a loader with the given sandbox configuration
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// Sandbox configuration in use
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn read_and_validate(&self, path: &Path) -> Result<Vec<u8>, LoaderError> {
        if !path.exists() {
            return Err(LoaderError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let bytes = std::fs::read(path)?;
        wasmparser::validate(&bytes).map_err(|e| LoaderError::InvalidFormat {
            reason: e.to_string(),
        })?;
        Ok(bytes)
    }
}

impl Default for WasmLoader {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

#[async_trait]
impl PluginLoader for WasmLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::Wasm
    }

    fn validate(&self, path: &Path) -> Result<(), LoaderError> {
        self.read_and_validate(path).map(|_| ())
    }

    async fn load(&self, path: &Path) -> Result<LoadedPlugin, LoaderError> {
        let bytes = self.read_and_validate(path)?;
        let instance = SandboxedPlugin::from_bytes(bytes, path, &self.config)?;
        let id = instance.info.id.clone();

        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&id) {
            return Err(LoaderError::AlreadyLoaded { id });
        }

        let plugin = LoadedPlugin::new(
            id.clone(),
            path.to_path_buf(),
            BackendKind::Wasm,
            Arc::new(Mutex::new(Box::new(instance) as Box<dyn Plugin>)),
        );
        tracing::info!(plugin = %id, path = %path.display(), "loaded sandboxed plugin");
        plugins.insert(id, plugin.clone());
        Ok(plugin)
    }

    async fn unload(&self, id: &str) -> Result<(), LoaderError> {
        let removed = self.plugins.write().await.remove(id);
        match removed {
            Some(_) => {
                tracing::info!(plugin = %id, "unloaded sandboxed plugin");
                Ok(())
            }
            None => Err(LoaderError::NotLoaded { id: id.to_string() }),
        }
    }

    async fn reload(&self, id: &str) -> Result<(), LoaderError> {
        let plugins = self.plugins.read().await;
        let plugin = plugins
            .get(id)
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?;

        let bytes = self.read_and_validate(&plugin.path)?;
        let fresh = SandboxedPlugin::from_bytes(bytes, &plugin.path, &self.config)?;
        *plugin.instance.lock().expect("instance poisoned") = Box::new(fresh);
        tracing::info!(plugin = %id, "reloaded sandboxed plugin");
        Ok(())
    }

    async fn loaded(&self) -> Vec<String> {
        self.plugins.read().await.keys().cloned().collect()
    }

    async fn shutdown(&self) {
        self.plugins.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Smallest valid module: magic + version, no sections
    const EMPTY_MODULE: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_limit, 32 * 1024 * 1024);
        assert_eq!(config.fuel_limit, 1_000_000);
        assert!(!config.wasi_enabled);
    }

    #[test]
    fn test_classify_call_error() {
        assert!(matches!(
            classify_call_error("all fuel consumed"),
            PluginError::FuelExhausted
        ));
        assert!(matches!(
            classify_call_error("memory limit reached"),
            PluginError::MemoryExceeded
        ));
        assert!(matches!(
            classify_call_error("trap: unreachable"),
            PluginError::Internal(_)
        ));
    }

    #[test]
    fn test_validate_missing_file() {
        let loader = WasmLoader::default();
        let err = loader.validate(Path::new("/missing.wasm")).unwrap_err();
        assert!(matches!(err, LoaderError::NotFound { .. }));
    }

    #[test]
    fn test_validate_rejects_garbage_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wasm");
        std::fs::write(&path, b"this is not wasm").unwrap();

        let loader = WasmLoader::default();
        let err = loader.validate(&path).unwrap_err();
        assert!(matches!(err, LoaderError::InvalidFormat { .. }));
    }

    #[test]
    fn test_validate_accepts_wellformed_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wasm");
        std::fs::write(&path, EMPTY_MODULE).unwrap();

        let loader = WasmLoader::default();
        assert!(loader.validate(&path).is_ok());
    }

    #[tokio::test]
    async fn test_load_rejects_module_without_required_exports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wasm");
        std::fs::write(&path, EMPTY_MODULE).unwrap();

        let loader = WasmLoader::default();
        let err = loader.load(&path).await.unwrap_err();
        // An empty module either fails to instantiate or is missing exports;
        // both reject it before the host sees an instance.
        assert!(matches!(
            err,
            LoaderError::SymbolMissing { .. } | LoaderError::Backend(_)
        ));
    }

    #[tokio::test]
    async fn test_unload_unknown_id() {
        let loader = WasmLoader::default();
        let err = loader.unload("ghost").await.unwrap_err();
        assert!(matches!(err, LoaderError::NotLoaded { .. }));
    }
}
