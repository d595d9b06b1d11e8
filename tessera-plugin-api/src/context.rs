//! PluginContext - a plugin's interface to host capabilities

use crate::error::PluginError;
use serde::{Serialize, de::DeserializeOwned};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Publish-only event surface the host hands to plugins.
///
/// The concrete implementation lives in the host; plugins only ever publish.
pub trait EventSink: Send + Sync {
    /// Publish an event on a topic. Delivery is best effort.
    fn publish(&self, topic: &str, payload: serde_json::Value);
}

/// Lookup surface for services other plugins have registered.
pub trait ServiceLocator: Send + Sync {
    /// Fetch a service by name. Callers downcast to the concrete type.
    fn get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Plugin's interface to host capabilities.
///
/// Passed to plugins during initialization and provides:
/// - The plugin's id and a private data directory
/// - Initial configuration values
/// - An event sink for publishing events
/// - A service locator for services other plugins expose
/// - Logging helpers that tag records with the plugin id
pub struct PluginContext {
    plugin_id: String,
    data_dir: PathBuf,
    config: serde_json::Map<String, serde_json::Value>,
    events: Option<Arc<dyn EventSink>>,
    services: Option<Arc<dyn ServiceLocator>>,
}

impl PluginContext {
    /// Create a new plugin context
    pub fn new(plugin_id: impl Into<String>, data_dir: PathBuf) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            data_dir,
            config: serde_json::Map::new(),
            events: None,
            services: None,
        }
    }

    /// Builder: set initial configuration values
    pub fn with_config(mut self, config: serde_json::Map<String, serde_json::Value>) -> Self {
        self.config = config;
        self
    }

    /// Builder: set the event sink
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builder: set the service locator
    pub fn with_services(mut self, services: Arc<dyn ServiceLocator>) -> Self {
        self.services = Some(services);
        self
    }

    /// This plugin's id
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Directory the plugin may use for its own files
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Read a configuration value
    ///
    /// # Example
    /// ```ignore
    /// let threshold: Option<u32> = ctx.config_get("threshold");
    /// ```
    pub fn config_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Write a configuration value into the context's map
    pub fn config_set<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), PluginError> {
        let value = serde_json::to_value(value)?;
        self.config.insert(key.to_string(), value);
        Ok(())
    }

    /// All configuration values
    pub fn config(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.config
    }

    /// Publish an event. No-op if the host attached no sink.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        if let Some(events) = &self.events {
            events.publish(topic, payload);
        }
    }

    /// Look up a registered service and downcast it
    pub fn get_service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services
            .as_ref()?
            .get(name)
            .and_then(|s| s.downcast::<T>().ok())
    }

    /// Log at info level, tagged with the plugin id
    pub fn log_info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin_id, "{message}");
    }

    /// Log at warn level, tagged with the plugin id
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin_id, "{message}");
    }

    /// Log at error level, tagged with the plugin id
    pub fn log_error(&self, message: &str) {
        tracing::error!(plugin = %self.plugin_id, "{message}");
    }
}
