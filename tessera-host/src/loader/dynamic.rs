//! Dynamic library backend
//!
//! Loads native cdylib plugins with `libloading`. Each distinct artifact path
//! is opened once and reference counted: repeated loads of the same path
//! return the existing instance, and the library is only released when the
//! count reaches zero.

use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use tessera_plugin_api::{API_VERSION, BackendKind, Plugin};

use super::{LoadedPlugin, LoaderError, PluginLoader};

const CREATE_SYMBOL: &[u8] = b"_tessera_plugin_create";
const API_VERSION_SYMBOL: &[u8] = b"_tessera_plugin_api_version";

struct LibraryEntry {
    plugin: LoadedPlugin,
    ref_count: usize,
    // Declared last so the instance above drops before the library that
    // defines its vtable.
    library: Option<Library>,
}

/// Loader for native dynamic library plugins
pub struct DynamicLoader {
    entries: RwLock<HashMap<PathBuf, LibraryEntry>>,
    /// Symbols beyond the standard entry points that must be present
    required_symbols: Vec<String>,
}

impl DynamicLoader {
    /// Create a loader with no extra symbol requirements
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            required_symbols: Vec::new(),
        }
    }

    /// Builder: require extra exported symbols at load time
    pub fn with_required_symbols(mut self, symbols: Vec<String>) -> Self {
        self.required_symbols = symbols;
        self
    }

    /// Reference count for a loaded artifact path, if any
    pub async fn ref_count(&self, path: &Path) -> Option<usize> {
        let canonical = path.canonicalize().ok()?;
        self.entries
            .read()
            .await
            .get(&canonical)
            .map(|e| e.ref_count)
    }

    /// Open the library, verify symbols and construct the instance.
    ///
    /// On any failure the partially opened library drops before return.
    fn acquire(&self, path: &Path) -> Result<(Library, Box<dyn Plugin>), LoaderError> {
        // SAFETY: the caller asked for this artifact to run in-process. The
        // plugin is expected to follow the Plugin trait contract.
        let library = unsafe { Library::new(path)? };

        // SAFETY: calling a C function exported by the plugin.
        let api_version_fn: libloading::Symbol<extern "C" fn() -> u32> =
            unsafe { library.get(API_VERSION_SYMBOL)? };
        let found = api_version_fn();
        if found != API_VERSION {
            return Err(LoaderError::ApiVersionMismatch {
                expected: API_VERSION,
                found,
            });
        }

        for symbol in &self.required_symbols {
            // SAFETY: only checking presence; the symbol is never called.
            let present = unsafe { library.get::<*const ()>(symbol.as_bytes()).is_ok() };
            if !present {
                return Err(LoaderError::SymbolMissing {
                    symbol: symbol.clone(),
                });
            }
        }

        // SAFETY: the create function returns a raw pointer produced by
        // Box::into_raw in the plugin's export macro.
        let create_fn: libloading::Symbol<extern "C" fn() -> *mut dyn Plugin> =
            unsafe { library.get(CREATE_SYMBOL)? };
        let instance = unsafe { Box::from_raw(create_fn()) };

        Ok((library, instance))
    }

    fn entry_by_id<'a>(
        entries: &'a HashMap<PathBuf, LibraryEntry>,
        id: &str,
    ) -> Option<(&'a PathBuf, &'a LibraryEntry)> {
        entries.iter().find(|(_, e)| e.plugin.id == id)
    }

    #[cfg(test)]
    async fn insert_stub(&self, path: PathBuf, plugin: LoadedPlugin, ref_count: usize) {
        self.entries.write().await.insert(
            path,
            LibraryEntry {
                plugin,
                ref_count,
                library: None,
            },
        );
    }
}

impl Default for DynamicLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginLoader for DynamicLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::Dynamic
    }

    fn validate(&self, path: &Path) -> Result<(), LoaderError> {
        if !path.exists() {
            return Err(LoaderError::NotFound {
                path: path.to_path_buf(),
            });
        }
        // Opening is the only reliable check; drop releases it immediately.
        let (_library, instance) = self.acquire(path)?;
        drop(instance);
        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<LoadedPlugin, LoaderError> {
        let canonical = path.canonicalize().map_err(|_| LoaderError::NotFound {
            path: path.to_path_buf(),
        })?;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&canonical) {
            entry.ref_count += 1;
            tracing::debug!(
                path = %canonical.display(),
                ref_count = entry.ref_count,
                "reusing loaded library"
            );
            return Ok(entry.plugin.clone());
        }

        let (library, instance) = self.acquire(&canonical)?;
        let info = instance.info();
        if info.id.is_empty() {
            return Err(LoaderError::InvalidFormat {
                reason: "plugin reported an empty id".to_string(),
            });
        }

        let plugin = LoadedPlugin::new(
            info.id.clone(),
            canonical.clone(),
            BackendKind::Dynamic,
            Arc::new(Mutex::new(instance)),
        );
        tracing::info!(plugin = %info.id, path = %canonical.display(), "loaded dynamic plugin");

        entries.insert(
            canonical,
            LibraryEntry {
                plugin: plugin.clone(),
                ref_count: 1,
                library: Some(library),
            },
        );
        Ok(plugin)
    }

    async fn unload(&self, id: &str) -> Result<(), LoaderError> {
        let mut entries = self.entries.write().await;
        let path = Self::entry_by_id(&entries, id)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?;

        let entry = entries.get_mut(&path).expect("entry exists");
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            tracing::debug!(plugin = %id, ref_count = entry.ref_count, "library still referenced");
            return Ok(());
        }

        let entry = entries.remove(&path).expect("entry exists");
        if Arc::strong_count(&entry.plugin.instance) > 1 {
            tracing::warn!(
                plugin = %id,
                "unloading library while instance handles are still held"
            );
        }
        tracing::info!(plugin = %id, path = %path.display(), "released dynamic library");
        drop(entry);
        Ok(())
    }

    async fn reload(&self, id: &str) -> Result<(), LoaderError> {
        let mut entries = self.entries.write().await;
        let path = Self::entry_by_id(&entries, id)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?;

        let (library, instance) = self.acquire(&path)?;

        let entry = entries.get_mut(&path).expect("entry exists");
        // Swap the instance in place so existing handles see the new one,
        // then let the old library drop.
        let old_library = entry.library.replace(library);
        *entry.plugin.instance.lock().expect("instance poisoned") = instance;
        drop(old_library);

        tracing::info!(plugin = %id, path = %path.display(), "reloaded dynamic plugin");
        Ok(())
    }

    async fn loaded(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.plugin.id.clone())
            .collect()
    }

    async fn shutdown(&self) {
        let mut entries = self.entries.write().await;
        for (path, entry) in entries.drain() {
            tracing::debug!(plugin = %entry.plugin.id, path = %path.display(), "releasing library");
        }
    }
}
