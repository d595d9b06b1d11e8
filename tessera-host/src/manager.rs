//! Hybrid plugin manager - one front door over every backend
//!
//! [`HybridPluginManager`] composes the loaders with the lifecycle, resource
//! and security managers, the event sink, the service registry and the config
//! store. Callers name a plugin by id and never care which backend runs it.
//!
//! Unloading is the delicate part: dependents are unloaded first (deepest
//! first under cascade), Running plugins need force or graceful, retries are
//! bounded, and a plugin that still cannot be unloaded is quarantined rather
//! than silently dropped.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use tessera_plugin_api::BackendKind;

use crate::config::ConfigStore;
use crate::error::HostError;
use crate::events::{BroadcastEventSink, EventSink, HostEvent};
use crate::lifecycle::{LifecycleConfig, LifecycleManager, PluginState};
use crate::loader::{LoadedPlugin, PluginLoader};
use crate::resource::{MonitorConfig, ResourceManager};
use crate::security::SecurityManager;
use crate::services::ServiceRegistry;

/// Callback invoked at a point in the unload sequence
pub type UnloadHook = Arc<dyn Fn(&str) + Send + Sync>;
/// Callback invoked when unload ultimately fails
pub type UnloadErrorHook = Arc<dyn Fn(&str, &HostError) + Send + Sync>;

/// How to take a plugin out
#[derive(Clone)]
pub struct UnloadOptions {
    /// Proceed past Running plugins, dependents and quarantined records
    pub force: bool,
    /// Stop a Running plugin first, bounded by `graceful_timeout`
    pub graceful: bool,
    pub graceful_timeout: Duration,
    /// Skip the plugin's own cleanup call
    pub skip_cleanup: bool,
    /// Unload dependents first, deepest first
    pub cascade: bool,
    /// Attempts per plugin
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub pre: Option<UnloadHook>,
    pub post: Option<UnloadHook>,
    pub on_cleanup: Option<UnloadHook>,
    pub on_error: Option<UnloadErrorHook>,
}

impl Default for UnloadOptions {
    fn default() -> Self {
        Self {
            force: false,
            graceful: false,
            graceful_timeout: Duration::from_secs(10),
            skip_cleanup: false,
            cascade: false,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            pre: None,
            post: None,
            on_cleanup: None,
            on_error: None,
        }
    }
}

impl UnloadOptions {
    /// Stop Running plugins first, then unload
    pub fn graceful() -> Self {
        Self {
            graceful: true,
            ..Default::default()
        }
    }

    /// Proceed no matter what
    pub fn forced() -> Self {
        Self {
            force: true,
            graceful: true,
            cascade: true,
            ..Default::default()
        }
    }
}

/// One plugin under management
#[derive(Clone)]
pub struct ManagedPlugin {
    /// The loader's record, including the live instance
    pub handle: LoadedPlugin,
    /// Plugin ids this plugin declared it depends on
    pub dependencies: Vec<String>,
    /// Service names this plugin registered at start
    pub services: Vec<String>,
    /// Set when unload recovery failed; the record is retained for inspection
    pub corrupted: bool,
}

/// A point-in-time view of one managed plugin
#[derive(Debug, Clone)]
pub struct PluginSummary {
    pub id: String,
    pub kind: BackendKind,
    pub path: PathBuf,
    pub state: PluginState,
    pub dependencies: Vec<String>,
    pub corrupted: bool,
}

/// Manager tuning
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Most plugins loaded at once
    pub max_plugins: usize,
    /// Root for per-plugin data directories
    pub data_dir: PathBuf,
    /// Directory of per-plugin config documents
    pub config_dir: PathBuf,
    pub lifecycle: LifecycleConfig,
    pub monitor: MonitorConfig,
    /// Event bus capacity
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_plugins: 100,
            data_dir: PathBuf::from("data/plugins"),
            config_dir: PathBuf::from("config/plugins"),
            lifecycle: LifecycleConfig::default(),
            monitor: MonitorConfig::default(),
            event_capacity: 256,
        }
    }
}

/// The host's single entry point for plugins of every backend
pub struct HybridPluginManager {
    config: ManagerConfig,
    loaders: RwLock<HashMap<BackendKind, Arc<dyn PluginLoader>>>,
    records: RwLock<HashMap<String, ManagedPlugin>>,
    lifecycle: LifecycleManager,
    resources: ResourceManager,
    security: SecurityManager,
    services: Arc<ServiceRegistry>,
    events: Arc<BroadcastEventSink>,
    config_store: ConfigStore,
}

impl HybridPluginManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let events = Arc::new(BroadcastEventSink::new(config.event_capacity));
        let services = Arc::new(ServiceRegistry::new());
        let lifecycle = LifecycleManager::new(config.lifecycle.clone(), config.data_dir.clone())
            .with_events(events.clone())
            .with_services(services.clone());
        let config_store = ConfigStore::new(config.config_dir.clone());

        Arc::new(Self {
            config,
            loaders: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            lifecycle,
            resources: ResourceManager::new(),
            security: SecurityManager::new(),
            services,
            events,
            config_store,
        })
    }

    /// Register a backend loader. Replaces any loader for the same kind.
    pub async fn register_loader(&self, loader: Arc<dyn PluginLoader>) {
        self.loaders.write().await.insert(loader.kind(), loader);
    }

    /// Subscribe to host events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// The shared service registry
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// The per-plugin config store
    pub fn config_store(&self) -> &ConfigStore {
        &self.config_store
    }

    async fn loader_for(&self, kind: BackendKind) -> Result<Arc<dyn PluginLoader>, HostError> {
        self.loaders
            .read()
            .await
            .get(&kind)
            .cloned()
            .ok_or_else(|| {
                HostError::InvalidInput(format!("no loader registered for backend '{kind}'"))
            })
    }

    /// Load an artifact through the backend's loader.
    ///
    /// The plugin's declared id becomes its id under management; a collision
    /// with an already-loaded plugin is an error. When a config document
    /// exists for the id, its resource limits and security policy are
    /// attached. Returns the id.
    pub async fn load(
        self: &Arc<Self>,
        path: &Path,
        kind: BackendKind,
    ) -> Result<String, HostError> {
        let loader = self.loader_for(kind).await?;

        {
            let records = self.records.read().await;
            if records.len() >= self.config.max_plugins {
                return Err(HostError::LimitExceeded {
                    what: "loaded plugins".to_string(),
                    limit: self.config.max_plugins as u64,
                    requested: records.len() as u64 + 1,
                });
            }
        }

        let handle = loader.load(path).await?;
        let id = handle.id.clone();

        let dependencies = {
            let instance = handle.instance.clone();
            tokio::task::spawn_blocking(move || {
                instance.lock().expect("plugin instance poisoned").dependencies()
            })
            .await
            .unwrap_or_default()
        };

        if let Err(e) = self.admit(&handle, dependencies).await {
            if let Err(unload_err) = loader.unload(&id).await {
                tracing::warn!(plugin = %id, error = %unload_err, "rollback unload failed");
            }
            return Err(e);
        }

        self.events.publish(
            "plugin.loaded",
            json!({ "id": id, "kind": kind.as_str(), "path": path.display().to_string() }),
        );
        tracing::info!(plugin = %id, kind = %kind, "plugin loaded");
        Ok(id)
    }

    /// Register a freshly loaded plugin with every subsystem
    async fn admit(
        self: &Arc<Self>,
        handle: &LoadedPlugin,
        dependencies: Vec<String>,
    ) -> Result<(), HostError> {
        let id = handle.id.clone();

        {
            let records = self.records.read().await;
            if records.contains_key(&id) {
                return Err(HostError::InvalidInput(format!(
                    "plugin id '{id}' is already loaded"
                )));
            }
        }

        let doc = self.config_store.load(&id)?;
        if let Some(doc) = &doc
            && !doc.enabled
        {
            return Err(HostError::InvalidInput(format!(
                "plugin '{id}' is disabled by its config document"
            )));
        }

        self.lifecycle.register(&id, handle.instance.clone()).await?;

        if let Some(limits) = doc.as_ref().and_then(|d| d.resource_limits.clone()) {
            let attach = async {
                let monitor = self
                    .resources
                    .attach(&id, limits, self.config.monitor.clone(), handle.pid)
                    .await?;
                // The host holds one channel or library handle per backend
                match handle.kind {
                    BackendKind::Rpc => monitor.record_conn_opened(),
                    BackendKind::Dynamic => monitor.record_file_opened(),
                    BackendKind::Wasm | BackendKind::HotReload => {}
                }
                let weak = Arc::downgrade(self);
                let rt = tokio::runtime::Handle::current();
                monitor.set_kill_hook(Arc::new(move |plugin_id, violation| {
                    let Some(manager) = weak.upgrade() else { return };
                    let plugin_id = plugin_id.to_string();
                    let limit = violation.kind.as_str();
                    rt.spawn(async move {
                        tracing::error!(plugin = %plugin_id, limit, "limit breached, forcing stop");
                        if let Err(e) = manager.lifecycle.stop(&plugin_id).await {
                            tracing::warn!(plugin = %plugin_id, error = %e, "forced stop failed");
                        }
                    });
                }));
                Ok::<_, HostError>(())
            }
            .await;
            if let Err(e) = attach {
                self.lifecycle.deregister(&id).await;
                return Err(e);
            }
        }

        if let Some(policy) = doc.as_ref().and_then(|d| d.security_policy.clone())
            && let Err(e) = self.security.attach(&id, policy).await
        {
            self.resources.detach(&id).await;
            self.lifecycle.deregister(&id).await;
            return Err(e);
        }

        let mut records = self.records.write().await;
        if records.contains_key(&id) {
            drop(records);
            self.security.detach(&id).await;
            self.resources.detach(&id).await;
            self.lifecycle.deregister(&id).await;
            return Err(HostError::InvalidInput(format!(
                "plugin id '{id}' is already loaded"
            )));
        }
        records.insert(
            id,
            ManagedPlugin {
                handle: handle.clone(),
                dependencies,
                services: Vec::new(),
                corrupted: false,
            },
        );
        Ok(())
    }

    async fn record(&self, id: &str) -> Result<ManagedPlugin, HostError> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HostError::NotFound { id: id.to_string() })
    }

    fn ensure_intact(&self, record: &ManagedPlugin) -> Result<(), HostError> {
        if record.corrupted {
            return Err(HostError::Corrupted {
                id: record.handle.id.clone(),
            });
        }
        Ok(())
    }

    /// Initialize a plugin with the settings from its config document
    pub async fn initialize(&self, id: &str) -> Result<(), HostError> {
        let record = self.record(id).await?;
        self.ensure_intact(&record)?;
        record.handle.touch();

        let settings = self
            .config_store
            .load(id)?
            .map(|doc| doc.settings_json())
            .unwrap_or_default();
        self.lifecycle.initialize(id, settings).await
    }

    /// Start a plugin and publish its declared capabilities as services
    pub async fn start(&self, id: &str) -> Result<(), HostError> {
        let record = self.record(id).await?;
        self.ensure_intact(&record)?;
        record.handle.touch();

        self.lifecycle.start(id).await?;

        let capabilities = {
            let instance = record.handle.instance.clone();
            tokio::task::spawn_blocking(move || {
                instance.lock().expect("plugin instance poisoned").capabilities()
            })
            .await
            .unwrap_or_default()
        };

        let mut registered = Vec::new();
        for capability in capabilities {
            let service = record.handle.instance.clone()
                as Arc<dyn std::any::Any + Send + Sync>;
            match self.services.register(capability.clone(), service) {
                Ok(()) => registered.push(capability),
                Err(e) => {
                    tracing::warn!(plugin = %id, capability = %capability, error = %e,
                        "service name taken, not registering");
                }
            }
        }
        if let Some(record) = self.records.write().await.get_mut(id) {
            record.services = registered;
        }

        self.events.publish("plugin.started", json!({ "id": id }));
        Ok(())
    }

    /// Stop a plugin and withdraw its services
    pub async fn stop(&self, id: &str) -> Result<(), HostError> {
        let record = self.record(id).await?;
        self.ensure_intact(&record)?;
        record.handle.touch();

        self.lifecycle.stop(id).await?;
        self.withdraw_services(id).await;
        self.events.publish("plugin.stopped", json!({ "id": id }));
        Ok(())
    }

    /// Stop then start, keeping service registration consistent
    pub async fn restart(&self, id: &str) -> Result<(), HostError> {
        self.stop(id).await?;
        self.start(id).await
    }

    async fn withdraw_services(&self, id: &str) {
        let names = match self.records.write().await.get_mut(id) {
            Some(record) => std::mem::take(&mut record.services),
            None => return,
        };
        for name in names {
            self.services.unregister(&name);
        }
    }

    /// Dependents of `id`, transitively, deepest first
    async fn transitive_dependents(&self, id: &str) -> Vec<String> {
        fn visit(
            records: &HashMap<String, ManagedPlugin>,
            id: &str,
            visited: &mut HashSet<String>,
            order: &mut Vec<String>,
        ) {
            for (other, record) in records {
                if record.dependencies.iter().any(|d| d == id) && visited.insert(other.clone()) {
                    visit(records, other, visited, order);
                    order.push(other.clone());
                }
            }
        }

        let records = self.records.read().await;
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        visit(&records, id, &mut visited, &mut order);
        order
    }

    /// Unload a plugin.
    ///
    /// A plugin that others depend on is refused unless `cascade` (which
    /// unloads the dependents first) or `force`. A Running plugin is refused
    /// unless `graceful` or `force`, which stop it first.
    pub async fn unload(&self, id: &str, options: UnloadOptions) -> Result<(), HostError> {
        let record = self.record(id).await?;
        if record.corrupted && !options.force {
            return Err(HostError::Corrupted { id: id.to_string() });
        }

        let dependents = self.transitive_dependents(id).await;
        if !dependents.is_empty() {
            if options.cascade {
                for dependent in &dependents {
                    self.unload_one(dependent, &options).await?;
                }
            } else if options.force {
                tracing::warn!(plugin = %id, ?dependents, "forcing unload past dependents");
            } else {
                return Err(HostError::InvalidInput(format!(
                    "plugin '{id}' is depended on by {dependents:?}"
                )));
            }
        }

        self.unload_one(id, &options).await
    }

    async fn unload_one(&self, id: &str, options: &UnloadOptions) -> Result<(), HostError> {
        let record = self.record(id).await?;

        if let Some(pre) = &options.pre {
            pre(id);
        }

        // A quarantined record has no lifecycle entry anymore; treat that
        // as not running so a forced retry can still clear it.
        let running = match self.lifecycle.state(id).await {
            Ok(state) => state == PluginState::Running,
            Err(HostError::NotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        if running {
            if options.graceful {
                let stop = tokio::time::timeout(options.graceful_timeout, self.stop(id)).await;
                match stop {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if options.force => {
                        tracing::warn!(plugin = %id, error = %e, "graceful stop failed, forcing");
                    }
                    Ok(Err(e)) => return self.quarantine(id, options, e).await,
                    Err(_) => {
                        let e = HostError::Timeout {
                            operation: "graceful stop".to_string(),
                            timeout: options.graceful_timeout,
                        };
                        if !options.force {
                            return self.quarantine(id, options, e).await;
                        }
                        tracing::warn!(plugin = %id, "graceful stop timed out, forcing");
                    }
                }
            } else if options.force {
                if let Err(e) = self.stop(id).await {
                    tracing::warn!(plugin = %id, error = %e, "forced stop failed, continuing");
                }
            } else {
                return Err(HostError::StateConflict {
                    id: id.to_string(),
                    operation: "unload".to_string(),
                    state: PluginState::Running.to_string(),
                });
            }
        }

        let loader = self.loader_for(record.handle.kind).await?;
        let attempts = options.max_retries.max(1);
        let mut last_error: Option<HostError> = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(options.retry_delay).await;
                tracing::warn!(plugin = %id, attempt, "retrying unload");
            }

            let result = async {
                if !options.skip_cleanup {
                    match self.lifecycle.cleanup(id).await {
                        Ok(()) => {
                            if let Some(on_cleanup) = &options.on_cleanup {
                                on_cleanup(id);
                            }
                        }
                        Err(HostError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                loader.unload(id).await.map_err(HostError::from)
            }
            .await;

            match result {
                Ok(()) => {
                    self.discard(id).await;
                    if let Some(post) = &options.post {
                        post(id);
                    }
                    self.events.publish("plugin.unloaded", json!({ "id": id }));
                    tracing::info!(plugin = %id, "plugin unloaded");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(plugin = %id, attempt, error = %e, "unload attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| HostError::Corrupted { id: id.to_string() });
        self.quarantine(id, options, error).await
    }

    /// Remove every trace of a plugin in one critical section
    async fn discard(&self, id: &str) {
        self.withdraw_services(id).await;
        let mut records = self.records.write().await;
        records.remove(id);
        self.resources.detach(id).await;
        self.security.detach(id).await;
        self.lifecycle.deregister(id).await;
    }

    /// Unload recovery: force-stop, release monitors and enforcers, keep the
    /// record around marked corrupted so the failure stays visible.
    async fn quarantine(
        &self,
        id: &str,
        options: &UnloadOptions,
        error: HostError,
    ) -> Result<(), HostError> {
        tracing::error!(plugin = %id, error = %error, "unload failed, quarantining");

        if let Err(e) = self.lifecycle.stop(id).await {
            tracing::debug!(plugin = %id, error = %e, "stop during quarantine failed");
        }
        self.withdraw_services(id).await;
        self.resources.detach(id).await;
        self.security.detach(id).await;
        self.lifecycle.deregister(id).await;

        if let Some(record) = self.records.write().await.get_mut(id) {
            record.corrupted = true;
        }

        if let Some(on_error) = &options.on_error {
            on_error(id, &error);
        }
        self.events.publish(
            "plugin.unload_failed",
            json!({ "id": id, "error": error.to_string() }),
        );
        Err(error)
    }

    /// Current state of a plugin
    pub async fn state(&self, id: &str) -> Result<PluginState, HostError> {
        let record = self.record(id).await?;
        self.ensure_intact(&record)?;
        self.lifecycle.state(id).await
    }

    /// A managed plugin's record
    pub async fn get(&self, id: &str) -> Option<ManagedPlugin> {
        self.records.read().await.get(id).cloned()
    }

    /// Summaries of every managed plugin, sorted by id
    pub async fn list(&self) -> Vec<PluginSummary> {
        let records = self.records.read().await;
        let mut summaries = Vec::with_capacity(records.len());
        for (id, record) in records.iter() {
            let state = if record.corrupted {
                PluginState::Error
            } else {
                self.lifecycle.state(id).await.unwrap_or(PluginState::Unknown)
            };
            summaries.push(PluginSummary {
                id: id.clone(),
                kind: record.handle.kind,
                path: record.handle.path.clone(),
                state,
                dependencies: record.dependencies.clone(),
                corrupted: record.corrupted,
            });
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Ids of plugins currently in a state
    pub async fn plugins_by_state(&self, state: PluginState) -> Vec<String> {
        self.list()
            .await
            .into_iter()
            .filter(|s| s.state == state)
            .map(|s| s.id)
            .collect()
    }

    /// Unload everything best-effort, then shut the subsystems down
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.unload(&id, UnloadOptions::forced()).await {
                tracing::warn!(plugin = %id, error = %e, "unload during shutdown failed");
            }
        }

        let loaders: Vec<Arc<dyn PluginLoader>> =
            self.loaders.read().await.values().cloned().collect();
        for loader in loaders {
            loader.shutdown().await;
        }
        self.resources.shutdown().await;
        self.security.shutdown().await;
        self.lifecycle.shutdown_token().cancel();
        tracing::info!("plugin manager shut down");
    }
}
