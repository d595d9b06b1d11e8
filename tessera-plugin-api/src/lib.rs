//! tessera-plugin-api - Plugin API for the tessera hybrid plugin host
//!
//! This crate provides the traits and types needed to write plugins for
//! tessera. The same capability contract is satisfied by every backend the
//! host supports: native dynamic libraries, subprocess RPC plugins, sandboxed
//! bytecode modules and hot-reloadable plugins.
//!
//! # Example
//!
//! ```ignore
//! use tessera_plugin_api::{export_plugin, Plugin, PluginContext, PluginError, PluginInfo};
//!
//! #[derive(Default)]
//! pub struct MyPlugin;
//!
//! impl Plugin for MyPlugin {
//!     fn info(&self) -> PluginInfo {
//!         PluginInfo {
//!             id: "my-plugin".to_string(),
//!             name: "My Plugin".to_string(),
//!             version: "0.1.0".to_string(),
//!             ..Default::default()
//!         }
//!     }
//!
//!     fn initialize(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
//!         ctx.log_info("plugin initialized");
//!         Ok(())
//!     }
//! }
//!
//! export_plugin!(MyPlugin);
//! ```

pub mod context;
pub mod error;
pub mod types;

pub use context::{EventSink, PluginContext, ServiceLocator};
pub use error::PluginError;
pub use types::*;

/// Current plugin API version. Plugins must match this exactly.
/// Checked at load time before any plugin code runs.
pub const API_VERSION: u32 = 1;

/// The core plugin trait - implement this to create a tessera plugin.
///
/// The contract is synchronous because instances cross the cdylib boundary
/// for the native backend; the host bridges calls onto blocking threads and
/// applies its own timeouts. Optional operations have default implementations,
/// so plugins only override what they support.
pub trait Plugin: Send + Sync {
    /// Return plugin metadata
    fn info(&self) -> PluginInfo;

    /// Capabilities this plugin advertises (free-form strings)
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Ids of plugins that must be loaded before this one
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called once after loading, before start. Use this to set up state.
    fn initialize(&mut self, ctx: &PluginContext) -> Result<(), PluginError>;

    /// Begin doing work. Called after a successful initialize.
    fn start(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Stop doing work. Must be safe to call more than once.
    fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Release resources before unload.
    fn cleanup(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Report current health. The default reports healthy.
    fn health_check(&self) -> Result<HealthStatus, PluginError> {
        Ok(HealthStatus::Healthy)
    }

    /// Report current metrics. The default reports a zeroed snapshot.
    fn metrics(&self) -> Result<PluginMetrics, PluginError> {
        Ok(PluginMetrics::default())
    }

    /// Current configuration values. The default stores nothing.
    fn get_config(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    /// Apply new configuration values. The default accepts anything.
    fn set_config(
        &mut self,
        _config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Snapshot state that should survive a hot reload.
    /// Plugins without reload-relevant state return None.
    fn export_state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore state snapshotted by a previous instance.
    fn import_state(&mut self, _state: serde_json::Value) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Export a plugin type for dynamic loading.
///
/// This macro generates the C ABI entry points the tessera host uses to load
/// and unload native plugins.
///
/// # Usage
///
/// ```ignore
/// tessera_plugin_api::export_plugin!(MyPlugin);
/// ```
///
/// # Generated Functions
///
/// - `_tessera_plugin_create()`: Creates a new plugin instance
/// - `_tessera_plugin_api_version()`: Returns the API version
/// - `_tessera_plugin_destroy()`: Destroys a plugin instance
#[macro_export]
macro_rules! export_plugin {
    ($plugin_type:ty) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _tessera_plugin_create() -> *mut dyn $crate::Plugin {
            let plugin: Box<dyn $crate::Plugin> = Box::new(<$plugin_type>::default());
            Box::into_raw(plugin)
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _tessera_plugin_api_version() -> u32 {
            $crate::API_VERSION
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _tessera_plugin_destroy(ptr: *mut dyn $crate::Plugin) {
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr));
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct BareMinimum;

    impl Plugin for BareMinimum {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                id: "bare".to_string(),
                ..Default::default()
            }
        }

        fn initialize(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[test]
    fn test_api_version_is_set() {
        assert_eq!(API_VERSION, 1);
    }

    #[test]
    fn test_plugin_trait_is_object_safe() {
        // This compiles only if Plugin is object-safe
        fn _takes_boxed_plugin(_: Box<dyn Plugin>) {}
    }

    #[test]
    fn test_default_operations() {
        let mut plugin = BareMinimum;

        assert!(plugin.capabilities().is_empty());
        assert!(plugin.dependencies().is_empty());
        assert!(plugin.start().is_ok());
        assert!(plugin.stop().is_ok());
        assert!(plugin.cleanup().is_ok());
        assert_eq!(plugin.health_check().unwrap(), HealthStatus::Healthy);
        assert!(plugin.get_config().is_empty());
        assert!(plugin.export_state().is_none());
        assert!(plugin.import_state(serde_json::json!({})).is_ok());
    }

    #[test]
    fn test_default_metrics_are_zeroed() {
        let plugin = BareMinimum;
        let metrics = plugin.metrics().unwrap();
        assert_eq!(metrics.memory_bytes, 0);
        assert_eq!(metrics.request_count, 0);
        assert_eq!(metrics.error_count, 0);
    }
}
