//! Hot-reload backend
//!
//! Wraps another instantiation path (by default the wasm sandbox) and adds
//! versioned reloads: every accepted artifact revision is retained in a
//! bounded history with its checksum, reloads with unchanged content are
//! skipped, and any retained version can be rolled back to. A notify-based
//! watcher with debouncing drives automatic reloads for opted-in plugins.

use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher, recommended_watcher};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use tessera_plugin_api::{BackendKind, EventSink, Plugin, PluginContext};

use super::wasm::{SandboxConfig, SandboxedPlugin};
use super::{LoadedPlugin, LoaderError, PluginLoader};
use crate::events::NullEventSink;

/// Builds a plugin instance from artifact content.
///
/// The seam that lets the reload machinery work over any instantiation
/// path; the default implementation targets sandboxed wasm artifacts.
pub trait InstanceFactory: Send + Sync {
    /// Construct an instance from the artifact path and its content bytes
    fn build(&self, path: &Path, content: &[u8]) -> Result<Box<dyn Plugin>, LoaderError>;
}

/// Factory that instantiates `.wasm` artifacts in the sandbox
pub struct WasmInstanceFactory {
    config: SandboxConfig,
}

impl WasmInstanceFactory {
    /// Create a factory with the given sandbox configuration
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

impl InstanceFactory for WasmInstanceFactory {
    fn build(&self, path: &Path, content: &[u8]) -> Result<Box<dyn Plugin>, LoaderError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("wasm") => {
                wasmparser::validate(content).map_err(|e| LoaderError::InvalidFormat {
                    reason: e.to_string(),
                })?;
                let instance =
                    SandboxedPlugin::from_bytes(content.to_vec(), path, &self.config)?;
                Ok(Box::new(instance))
            }
            other => Err(LoaderError::InvalidFormat {
                reason: format!(
                    "unsupported hot-reload artifact extension: {}",
                    other.unwrap_or("<none>")
                ),
            }),
        }
    }
}

/// Configuration for the hot-reload loader
#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    /// Retained versions per plugin
    pub max_versions: usize,
    /// Quiet period before a file change triggers a reload
    pub debounce: std::time::Duration,
    /// Whether freshly loaded plugins auto-reload on file changes
    pub auto_reload_default: bool,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            max_versions: 5,
            debounce: std::time::Duration::from_millis(300),
            auto_reload_default: false,
        }
    }
}

/// One retained artifact revision
#[derive(Debug, Clone)]
pub struct PluginVersion {
    /// Monotonic version number, starting at 1
    pub version: u64,
    /// Hex sha256 of the content
    pub checksum: String,
    /// The artifact bytes for this revision
    pub content: Vec<u8>,
    /// When this revision was accepted
    pub timestamp: DateTime<Utc>,
}

fn checksum(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

struct ReloadRecord {
    plugin: LoadedPlugin,
    versions: Vec<PluginVersion>,
    next_version: u64,
    current_version: u64,
    auto_reload: bool,
}

impl ReloadRecord {
    fn current_checksum(&self) -> Option<&str> {
        self.versions
            .iter()
            .find(|v| v.version == self.current_version)
            .map(|v| v.checksum.as_str())
    }

    /// Append a revision, evicting the oldest first when at capacity so the
    /// history length never exceeds the cap.
    fn push_version(&mut self, content: Vec<u8>, checksum: String, max_versions: usize) -> u64 {
        while self.versions.len() >= max_versions.max(1) {
            let evicted = self.versions.remove(0);
            tracing::debug!(
                plugin = %self.plugin.id,
                version = evicted.version,
                "evicted oldest retained version"
            );
        }
        let version = self.next_version;
        self.next_version += 1;
        self.versions.push(PluginVersion {
            version,
            checksum,
            content,
            timestamp: Utc::now(),
        });
        self.current_version = version;
        version
    }
}

/// Loader that serves hot-reloadable plugins
pub struct HotReloadLoader {
    config: HotReloadConfig,
    factory: Arc<dyn InstanceFactory>,
    events: Arc<dyn EventSink>,
    records: RwLock<HashMap<String, ReloadRecord>>,
    /// Canonical artifact path to plugin id, for the watcher
    watched: RwLock<HashMap<PathBuf, String>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl HotReloadLoader {
    /// Create a loader with the default wasm factory and no event sink
    pub fn new(config: HotReloadConfig) -> Self {
        Self::with_factory(
            config,
            Arc::new(WasmInstanceFactory::new(SandboxConfig::default())),
            Arc::new(NullEventSink),
        )
    }

    /// Create a loader with an explicit factory and event sink
    pub fn with_factory(
        config: HotReloadConfig,
        factory: Arc<dyn InstanceFactory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            factory,
            events,
            records: RwLock::new(HashMap::new()),
            watched: RwLock::new(HashMap::new()),
            watcher: Mutex::new(None),
        }
    }

    /// Retained versions for a plugin: (version, checksum, timestamp)
    pub async fn versions(&self, id: &str) -> Result<Vec<(u64, String, DateTime<Utc>)>, LoaderError> {
        let records = self.records.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?;
        Ok(record
            .versions
            .iter()
            .map(|v| (v.version, v.checksum.clone(), v.timestamp))
            .collect())
    }

    /// The version a plugin currently runs
    pub async fn current_version(&self, id: &str) -> Result<u64, LoaderError> {
        let records = self.records.read().await;
        records
            .get(id)
            .map(|r| r.current_version)
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })
    }

    /// Toggle automatic reloads for one plugin
    pub async fn set_auto_reload(&self, id: &str, enabled: bool) -> Result<(), LoaderError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?;
        record.auto_reload = enabled;
        Ok(())
    }

    /// Swap the running instance for one built from `content`.
    ///
    /// Order: export state, stop old, build new, initialize, import state
    /// (best effort), start. If the swap fails midway the old instance is
    /// restarted best effort.
    fn swap_instance(
        &self,
        plugin: &LoadedPlugin,
        content: &[u8],
    ) -> Result<(), LoaderError> {
        let mut guard = plugin.instance.lock().expect("instance poisoned");

        let exported = guard.export_state();
        let config = guard.get_config();
        if let Err(e) = guard.stop() {
            tracing::warn!(plugin = %plugin.id, error = %e, "old instance stop failed");
        }

        let restore = |guard: &mut Box<dyn Plugin>| {
            if let Err(e) = guard.start() {
                tracing::error!(plugin = %plugin.id, error = %e, "could not restart old instance");
            }
        };

        let mut fresh = match self.factory.build(&plugin.path, content) {
            Ok(fresh) => fresh,
            Err(e) => {
                restore(&mut guard);
                return Err(e);
            }
        };

        let ctx = PluginContext::new(plugin.id.clone(), plugin.path.parent().unwrap_or(Path::new(".")).to_path_buf())
            .with_config(config);
        if let Err(e) = fresh.initialize(&ctx) {
            restore(&mut guard);
            return Err(LoaderError::Backend(format!("initialize failed: {e}")));
        }
        if let Some(state) = exported
            && let Err(e) = fresh.import_state(state)
        {
            tracing::warn!(plugin = %plugin.id, error = %e, "state import failed, continuing");
        }
        if let Err(e) = fresh.start() {
            restore(&mut guard);
            return Err(LoaderError::Backend(format!("start failed: {e}")));
        }

        *guard = fresh;
        Ok(())
    }

    /// Roll a plugin back to a retained version
    pub async fn rollback(&self, id: &str, version: u64) -> Result<(), LoaderError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?;

        let target = record
            .versions
            .iter()
            .find(|v| v.version == version)
            .cloned()
            .ok_or_else(|| LoaderError::InvalidFormat {
                reason: format!("version {version} is not retained for '{id}'"),
            })?;

        self.swap_instance(&record.plugin, &target.content)?;
        record.current_version = version;
        tracing::info!(plugin = %id, version, "rolled back");
        self.events.publish(
            "plugin.rolled_back",
            serde_json::json!({"id": id, "version": version}),
        );
        Ok(())
    }

    /// Start watching loaded artifacts and reloading opted-in plugins.
    ///
    /// Spawns the debounce loop; safe to call once per loader.
    pub fn start_auto_reload(self: &Arc<Self>) -> Result<(), LoaderError> {
        let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>(100);

        let watcher = recommended_watcher(move |event| {
            // Runs on the notify thread
            let _ = tx.blocking_send(event);
        })
        .map_err(|e| LoaderError::Backend(e.to_string()))?;

        *self.watcher.lock().expect("watcher poisoned") = Some(watcher);

        let loader = Arc::clone(self);
        tokio::spawn(async move {
            loader.debounce_loop(rx).await;
        });
        Ok(())
    }

    async fn debounce_loop(&self, mut rx: mpsc::Receiver<notify::Result<notify::Event>>) {
        loop {
            let Some(first) = rx.recv().await else {
                break;
            };
            let mut changed = Self::event_paths(first);

            // Drain until a quiet period elapses
            loop {
                match tokio::time::timeout(self.config.debounce, rx.recv()).await {
                    Ok(Some(event)) => changed.extend(Self::event_paths(event)),
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            self.handle_changed_paths(changed).await;
        }
    }

    fn event_paths(event: notify::Result<notify::Event>) -> Vec<PathBuf> {
        match event {
            // Only content-bearing events trigger reloads
            Ok(event)
                if matches!(
                    event.kind,
                    notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                ) =>
            {
                event.paths
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "watch error");
                Vec::new()
            }
        }
    }

    async fn handle_changed_paths(&self, paths: Vec<PathBuf>) {
        let mut ids = Vec::new();
        {
            let watched = self.watched.read().await;
            let records = self.records.read().await;
            for path in paths {
                let canonical = path.canonicalize().unwrap_or(path);
                if let Some(id) = watched.get(&canonical)
                    && records.get(id).is_some_and(|r| r.auto_reload)
                    && !ids.contains(id)
                {
                    ids.push(id.clone());
                }
            }
        }

        for id in ids {
            tracing::info!(plugin = %id, "artifact changed, reloading");
            if let Err(e) = self.reload(&id).await {
                tracing::error!(plugin = %id, error = %e, "auto reload failed");
                self.events.publish(
                    "plugin.auto_reload_failed",
                    serde_json::json!({"id": id, "error": e.to_string()}),
                );
            }
        }
    }
}

#[async_trait]
impl PluginLoader for HotReloadLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::HotReload
    }

    fn validate(&self, path: &Path) -> Result<(), LoaderError> {
        if !path.exists() {
            return Err(LoaderError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read(path)?;
        self.factory.build(path, &content).map(|_| ())
    }

    async fn load(&self, path: &Path) -> Result<LoadedPlugin, LoaderError> {
        let canonical = path.canonicalize().map_err(|_| LoaderError::NotFound {
            path: path.to_path_buf(),
        })?;
        let content = std::fs::read(&canonical)?;
        let sum = checksum(&content);

        let instance = self.factory.build(&canonical, &content)?;
        let info = instance.info();
        if info.id.is_empty() {
            return Err(LoaderError::InvalidFormat {
                reason: "plugin reported an empty id".to_string(),
            });
        }

        let mut records = self.records.write().await;
        if records.contains_key(&info.id) {
            return Err(LoaderError::AlreadyLoaded { id: info.id });
        }

        let plugin = LoadedPlugin::new(
            info.id.clone(),
            canonical.clone(),
            BackendKind::HotReload,
            Arc::new(Mutex::new(instance)),
        );

        let mut record = ReloadRecord {
            plugin: plugin.clone(),
            versions: Vec::new(),
            next_version: 1,
            current_version: 0,
            auto_reload: self.config.auto_reload_default,
        };
        record.push_version(content, sum, self.config.max_versions);

        // Watch the artifact's directory; single files miss editor
        // rename-into-place saves.
        if let Some(parent) = canonical.parent()
            && let Some(watcher) = self.watcher.lock().expect("watcher poisoned").as_mut()
            && let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive)
        {
            tracing::warn!(plugin = %info.id, error = %e, "could not watch artifact directory");
        }

        records.insert(info.id.clone(), record);
        self.watched
            .write()
            .await
            .insert(canonical, info.id.clone());

        tracing::info!(plugin = %info.id, "loaded hot-reloadable plugin");
        Ok(plugin)
    }

    async fn unload(&self, id: &str) -> Result<(), LoaderError> {
        let record = self
            .records
            .write()
            .await
            .remove(id)
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?;
        self.watched.write().await.remove(&record.plugin.path);
        tracing::info!(plugin = %id, "unloaded hot-reloadable plugin");
        Ok(())
    }

    async fn reload(&self, id: &str) -> Result<(), LoaderError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?;

        let content = std::fs::read(&record.plugin.path)?;
        let sum = checksum(&content);
        if record.current_checksum() == Some(sum.as_str()) {
            tracing::debug!(plugin = %id, "content unchanged, skipping reload");
            return Ok(());
        }

        self.swap_instance(&record.plugin, &content)?;
        let version = record.push_version(content, sum, self.config.max_versions);

        tracing::info!(plugin = %id, version, "hot reloaded");
        self.events.publish(
            "plugin.hot_reloaded",
            serde_json::json!({"id": id, "version": version}),
        );
        Ok(())
    }

    async fn loaded(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }

    async fn shutdown(&self) {
        *self.watcher.lock().expect("watcher poisoned") = None;
        self.records.write().await.clear();
        self.watched.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessera_plugin_api::{PluginError, PluginInfo};

    /// Plugin that remembers lifecycle calls and carries a counter as state
    struct CountingPlugin {
        id: String,
        counter: u64,
        started: bool,
    }

    impl Plugin for CountingPlugin {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                id: self.id.clone(),
                ..Default::default()
            }
        }
        fn initialize(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Ok(())
        }
        fn start(&mut self) -> Result<(), PluginError> {
            self.started = true;
            Ok(())
        }
        fn stop(&mut self) -> Result<(), PluginError> {
            self.started = false;
            Ok(())
        }
        fn export_state(&self) -> Option<serde_json::Value> {
            Some(serde_json::json!({"counter": self.counter}))
        }
        fn import_state(&mut self, state: serde_json::Value) -> Result<(), PluginError> {
            self.counter = state["counter"].as_u64().unwrap_or(0);
            Ok(())
        }
    }

    /// Factory that builds a CountingPlugin regardless of content
    struct MockFactory {
        builds: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl MockFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                builds: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    impl InstanceFactory for MockFactory {
        fn build(&self, path: &Path, _content: &[u8]) -> Result<Box<dyn Plugin>, LoaderError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LoaderError::InvalidFormat {
                    reason: "factory told to fail".to_string(),
                });
            }
            self.builds.fetch_add(1, Ordering::SeqCst);
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("plugin")
                .to_string();
            Ok(Box::new(CountingPlugin {
                id,
                counter: 0,
                started: false,
            }))
        }
    }

    fn loader_with(factory: Arc<MockFactory>, max_versions: usize) -> HotReloadLoader {
        HotReloadLoader::with_factory(
            HotReloadConfig {
                max_versions,
                ..Default::default()
            },
            factory,
            Arc::new(NullEventSink),
        )
    }

    fn write_artifact(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join("counter.wasm");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = checksum(b"hello");
        let b = checksum(b"hello");
        let c = checksum(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_load_records_first_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let loader = loader_with(MockFactory::new(), 5);

        let plugin = loader.load(&path).await.unwrap();
        assert_eq!(plugin.id, "counter");
        assert_eq!(loader.current_version("counter").await.unwrap(), 1);
        assert_eq!(loader.versions("counter").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_skips_unchanged_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let factory = MockFactory::new();
        let loader = loader_with(factory.clone(), 5);

        loader.load(&path).await.unwrap();
        loader.reload("counter").await.unwrap();

        // Same content: one build, one version
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
        assert_eq!(loader.versions("counter").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_swaps_and_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let loader = loader_with(MockFactory::new(), 5);

        let plugin = loader.load(&path).await.unwrap();
        {
            // Simulate accumulated state in the running instance
            let mut guard = plugin.instance.lock().unwrap();
            guard
                .import_state(serde_json::json!({"counter": 41}))
                .unwrap();
        }

        write_artifact(dir.path(), b"v2");
        loader.reload("counter").await.unwrap();

        let guard = plugin.instance.lock().unwrap();
        assert_eq!(
            guard.export_state().unwrap()["counter"].as_u64(),
            Some(41),
            "state survives the swap"
        );
        drop(guard);
        assert_eq!(loader.current_version("counter").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_version_history_cap_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let loader = loader_with(MockFactory::new(), 3);

        loader.load(&path).await.unwrap();
        for n in 2..=6u64 {
            write_artifact(dir.path(), format!("v{n}").as_bytes());
            loader.reload("counter").await.unwrap();
        }

        let versions = loader.versions("counter").await.unwrap();
        assert_eq!(versions.len(), 3, "history never exceeds the cap");
        let numbers: Vec<u64> = versions.iter().map(|(v, _, _)| *v).collect();
        assert_eq!(numbers, vec![4, 5, 6], "oldest versions were evicted");
    }

    #[tokio::test]
    async fn test_rollback_to_retained_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let loader = loader_with(MockFactory::new(), 5);

        loader.load(&path).await.unwrap();
        write_artifact(dir.path(), b"v2");
        loader.reload("counter").await.unwrap();

        loader.rollback("counter", 1).await.unwrap();
        assert_eq!(loader.current_version("counter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_to_evicted_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let loader = loader_with(MockFactory::new(), 2);

        loader.load(&path).await.unwrap();
        for n in 2..=4u64 {
            write_artifact(dir.path(), format!("v{n}").as_bytes());
            loader.reload("counter").await.unwrap();
        }

        let err = loader.rollback("counter", 1).await.unwrap_err();
        assert!(matches!(err, LoaderError::InvalidFormat { .. }));
    }

    #[tokio::test]
    async fn test_failed_swap_restarts_old_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let factory = MockFactory::new();
        let loader = loader_with(factory.clone(), 5);

        let plugin = loader.load(&path).await.unwrap();
        plugin.instance.lock().unwrap().start().unwrap();

        factory.fail.store(true, Ordering::SeqCst);
        write_artifact(dir.path(), b"v2");
        assert!(loader.reload("counter").await.is_err());

        // Version history unchanged and the old instance was restarted
        assert_eq!(loader.current_version("counter").await.unwrap(), 1);
        let guard = plugin.instance.lock().unwrap();
        let state = guard.export_state().unwrap();
        assert_eq!(state["counter"].as_u64(), Some(0));
    }

    #[tokio::test]
    async fn test_changed_paths_reload_only_opted_in_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let factory = MockFactory::new();
        let loader = loader_with(factory.clone(), 5);

        loader.load(&path).await.unwrap();
        write_artifact(dir.path(), b"v2");

        // Auto reload off: nothing happens
        loader.handle_changed_paths(vec![path.clone()]).await;
        assert_eq!(loader.current_version("counter").await.unwrap(), 1);

        // Opted in: the change is picked up
        loader.set_auto_reload("counter", true).await.unwrap();
        loader.handle_changed_paths(vec![path.clone()]).await;
        assert_eq!(loader.current_version("counter").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unload_removes_record_and_watch_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let loader = loader_with(MockFactory::new(), 5);

        loader.load(&path).await.unwrap();
        loader.unload("counter").await.unwrap();
        assert!(!loader.is_loaded("counter").await);

        let err = loader.reload("counter").await.unwrap_err();
        assert!(matches!(err, LoaderError::NotLoaded { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_load_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), b"v1");
        let loader = loader_with(MockFactory::new(), 5);

        loader.load(&path).await.unwrap();
        let err = loader.load(&path).await.unwrap_err();
        assert!(matches!(err, LoaderError::AlreadyLoaded { .. }));
    }
}
