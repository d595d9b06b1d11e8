//! tessera-host: a plugin host that runs every backend behind one interface
//!
//! This crate provides the host side of the tessera plugin system:
//!
//! - **Loaders** - [`DynamicLoader`], [`RpcLoader`], [`WasmLoader`] and
//!   [`HotReloadLoader`] turn artifacts into live plugin instances
//! - **Lifecycle** - [`LifecycleManager`] drives initialize/start/stop/cleanup
//!   with timeouts, retries and an auditable state history
//! - **Resources** - [`ResourceManager`] samples usage and enforces limits in
//!   log, warn or kill mode
//! - **Security** - [`SecurityManager`] evaluates per-plugin policies: path
//!   and network rules, permissions and rate limits
//! - **Manager** - [`HybridPluginManager`] ties it all together so callers
//!   name plugins by id and never care which backend runs them
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tessera_host::{DynamicLoader, HybridPluginManager, ManagerConfig};
//! use tessera_plugin_api::BackendKind;
//!
//! # async fn example() -> Result<(), tessera_host::HostError> {
//! let manager = HybridPluginManager::new(ManagerConfig::default());
//! manager.register_loader(Arc::new(DynamicLoader::new())).await;
//!
//! let id = manager.load(Path::new("plugins/analytics.so"), BackendKind::Dynamic).await?;
//! manager.initialize(&id).await?;
//! manager.start(&id).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod resource;
pub mod security;
pub mod services;

// Re-export key types for convenience
pub use config::{ConfigStore, PluginConfigDoc};
pub use error::HostError;
pub use events::{BroadcastEventSink, EventSink, HostEvent, NullEventSink};
pub use lifecycle::{
    LifecycleConfig, LifecycleManager, PluginState, StateListener, StateTransition,
};
pub use loader::{
    DynamicLoader, HotReloadConfig, HotReloadLoader, InstanceFactory, LoadedPlugin, LoaderError,
    PluginLoader, RpcLoader, RpcLoaderConfig, SandboxConfig, SharedPlugin, WasmLoader,
};
pub use manager::{
    HybridPluginManager, ManagedPlugin, ManagerConfig, PluginSummary, UnloadOptions,
};
pub use resource::{
    EnforceMode, MonitorConfig, ResourceLimits, ResourceManager, ResourceMonitor, ResourceUsage,
    ResourceViolation,
};
pub use security::{
    NetworkRule, PathRule, Permission, RateLimit, SecurityEnforcer, SecurityManager,
    SecurityPolicy, SecurityViolation,
};
pub use services::ServiceRegistry;
