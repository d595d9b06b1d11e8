//! Lifecycle manager - drives plugins through their state machine
//!
//! Every registered plugin owns a state, a bounded transition history and an
//! optional set of listeners. Lifecycle operations for one id are serialized
//! through a per-id mutex; the underlying plugin calls run on blocking
//! threads under a timeout and are retried a bounded number of times.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;

use tessera_plugin_api::{EventSink, Plugin, PluginContext, PluginError, ServiceLocator};

use crate::error::HostError;
use crate::loader::SharedPlugin;

/// States a plugin moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Unknown,
    Loaded,
    Initialized,
    Running,
    Stopping,
    Stopped,
    Unloading,
    Unloaded,
    Error,
}

impl PluginState {
    /// Stable lowercase name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` appears in the legal transition table.
///
/// Any state may move to Error; Running must pass through Stopping before
/// it can unload.
pub fn is_valid_transition(from: PluginState, to: PluginState) -> bool {
    use PluginState::*;
    if to == Error {
        return true;
    }
    matches!(
        (from, to),
        (Unknown, Loaded)
            | (Loaded, Initialized)
            | (Loaded, Running)
            | (Loaded, Unloading)
            | (Initialized, Running)
            | (Initialized, Unloading)
            | (Running, Stopping)
            | (Stopping, Stopped)
            | (Stopped, Running)
            | (Stopped, Unloading)
            | (Error, Unloading)
            | (Unloading, Unloaded)
            | (Unloaded, Loaded)
    )
}

/// Whether unload may begin from this state without stopping first
pub fn can_unload_from(state: PluginState) -> bool {
    matches!(
        state,
        PluginState::Loaded
            | PluginState::Initialized
            | PluginState::Stopped
            | PluginState::Error
    )
}

/// One recorded lifecycle transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PluginState,
    pub to: PluginState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub error: Option<String>,
}

/// Observer of one plugin's transitions.
///
/// Each notification runs in its own spawned task, so a panicking listener
/// cannot corrupt the transition path.
pub trait StateListener: Send + Sync {
    fn on_transition(&self, id: &str, transition: &StateTransition);
}

/// Tuning for lifecycle operations
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub init_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub cleanup_timeout: Duration,
    /// Attempts per operation beyond the first
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Transitions retained per plugin
    pub max_history: usize,
    /// Poll interval for `wait_for_state`
    pub poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(15),
            cleanup_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_history: 100,
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct PluginEntry {
    plugin: SharedPlugin,
    state: PluginState,
    history: Vec<StateTransition>,
    op_lock: Arc<AsyncMutex<()>>,
}

/// Drives registered plugins through the state machine
pub struct LifecycleManager {
    config: LifecycleConfig,
    data_root: PathBuf,
    entries: RwLock<HashMap<String, PluginEntry>>,
    listeners: RwLock<HashMap<String, Vec<Arc<dyn StateListener>>>>,
    events: Option<Arc<dyn EventSink>>,
    services: Option<Arc<dyn ServiceLocator>>,
    shutdown: CancellationToken,
}

impl LifecycleManager {
    /// Create a manager storing plugin data under `data_root`
    pub fn new(config: LifecycleConfig, data_root: PathBuf) -> Self {
        Self {
            config,
            data_root,
            entries: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            events: None,
            services: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Builder: hand plugins an event sink through their context
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builder: hand plugins a service locator through their context
    pub fn with_services(mut self, services: Arc<dyn ServiceLocator>) -> Self {
        self.services = Some(services);
        self
    }

    /// Token cancelled when the host shuts down; cancels in-flight waits
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a freshly loaded plugin. State becomes Loaded.
    pub async fn register(&self, id: &str, plugin: SharedPlugin) -> Result<(), HostError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(id) {
            return Err(HostError::InvalidInput(format!(
                "plugin '{id}' is already registered"
            )));
        }
        let mut entry = PluginEntry {
            plugin,
            state: PluginState::Unknown,
            history: Vec::new(),
            op_lock: Arc::new(AsyncMutex::new(())),
        };
        Self::record(
            &self.config,
            id,
            &mut entry,
            PluginState::Loaded,
            "registered",
            None,
        );
        entries.insert(id.to_string(), entry);
        drop(entries);
        self.notify(id, PluginState::Unknown, PluginState::Loaded, "registered", None)
            .await;
        Ok(())
    }

    /// Remove a plugin's entry entirely. Used after a completed unload.
    pub async fn deregister(&self, id: &str) {
        self.entries.write().await.remove(id);
        self.listeners.write().await.remove(id);
    }

    /// Current state of a plugin
    pub async fn state(&self, id: &str) -> Result<PluginState, HostError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.state)
            .ok_or_else(|| HostError::NotFound { id: id.to_string() })
    }

    /// Recorded transitions, oldest first
    pub async fn history(&self, id: &str) -> Result<Vec<StateTransition>, HostError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.history.clone())
            .ok_or_else(|| HostError::NotFound { id: id.to_string() })
    }

    /// Attach a listener for one plugin's transitions
    pub async fn add_listener(&self, id: &str, listener: Arc<dyn StateListener>) {
        self.listeners
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .push(listener);
    }

    /// Record a transition into an entry, evicting history down to the cap
    /// before the append so the length never exceeds it.
    fn record(
        config: &LifecycleConfig,
        id: &str,
        entry: &mut PluginEntry,
        to: PluginState,
        reason: &str,
        error: Option<String>,
    ) {
        let from = entry.state;
        while entry.history.len() >= config.max_history.max(1) {
            entry.history.remove(0);
        }
        entry.history.push(StateTransition {
            from,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
            error: error.clone(),
        });
        entry.state = to;
        tracing::debug!(plugin = %id, from = %from, to = %to, reason = %reason, "state transition");
    }

    async fn notify(
        &self,
        id: &str,
        from: PluginState,
        to: PluginState,
        reason: &str,
        error: Option<String>,
    ) {
        let listeners = self.listeners.read().await.get(id).cloned().unwrap_or_default();
        if listeners.is_empty() {
            return;
        }
        let transition = StateTransition {
            from,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
            error,
        };
        for listener in listeners {
            let id = id.to_string();
            let transition = transition.clone();
            // One task per listener; a panic is contained to its task
            tokio::spawn(async move {
                listener.on_transition(&id, &transition);
            });
        }
    }

    /// Validate and apply a transition. Rejects pairs outside the table.
    pub async fn transition(
        &self,
        id: &str,
        to: PluginState,
        reason: &str,
        error: Option<String>,
    ) -> Result<(), HostError> {
        let from = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| HostError::NotFound { id: id.to_string() })?;
            let from = entry.state;
            if !is_valid_transition(from, to) {
                return Err(HostError::StateConflict {
                    id: id.to_string(),
                    operation: format!("transition to {to}"),
                    state: from.to_string(),
                });
            }
            Self::record(&self.config, id, entry, to, reason, error.clone());
            from
        };
        self.notify(id, from, to, reason, error).await;
        Ok(())
    }

    async fn entry_handles(
        &self,
        id: &str,
    ) -> Result<(SharedPlugin, Arc<AsyncMutex<()>>, PluginState), HostError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(id)
            .ok_or_else(|| HostError::NotFound { id: id.to_string() })?;
        Ok((entry.plugin.clone(), entry.op_lock.clone(), entry.state))
    }

    /// Run one plugin call on a blocking thread under a timeout, retrying
    /// transient failures at a fixed delay. State is touched only after the
    /// call definitively completes or fails.
    async fn call_with_retry(
        &self,
        id: &str,
        operation: &str,
        timeout: Duration,
        plugin: SharedPlugin,
        f: impl Fn(&mut Box<dyn Plugin>) -> Result<(), PluginError> + Send + Sync + Clone + 'static,
    ) -> Result<(), HostError> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error: Option<HostError> = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_delay).await;
                tracing::warn!(plugin = %id, operation, attempt, "retrying");
            }

            let plugin = plugin.clone();
            let f = f.clone();
            let call = tokio::task::spawn_blocking(move || {
                let mut guard = plugin.lock().expect("plugin instance poisoned");
                f(&mut guard)
            });

            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(HostError::Timeout {
                        operation: format!("{operation} (cancelled)"),
                        timeout,
                    });
                }
                outcome = tokio::time::timeout(timeout, call) => outcome,
            };

            match outcome {
                Ok(Ok(Ok(()))) => return Ok(()),
                Ok(Ok(Err(e))) => {
                    // InvalidInput is never retried
                    if matches!(e, PluginError::InvalidInput(_)) {
                        return Err(HostError::Plugin(e));
                    }
                    tracing::warn!(plugin = %id, operation, error = %e, "call failed");
                    last_error = Some(HostError::Plugin(e));
                }
                Ok(Err(join_err)) => {
                    tracing::error!(plugin = %id, operation, error = %join_err, "call panicked");
                    last_error = Some(HostError::InvalidInput(format!(
                        "{operation} panicked: {join_err}"
                    )));
                }
                Err(_) => {
                    // The abandoned call may still finish; it is never
                    // observed as partial state.
                    tracing::warn!(plugin = %id, operation, ?timeout, "call timed out");
                    last_error = Some(HostError::Timeout {
                        operation: operation.to_string(),
                        timeout,
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| HostError::Timeout {
            operation: operation.to_string(),
            timeout,
        }))
    }

    /// Initialize a plugin with configuration values. Requires Loaded.
    pub async fn initialize(
        &self,
        id: &str,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), HostError> {
        let (plugin, op_lock, _) = self.entry_handles(id).await?;
        let _op = op_lock.lock().await;

        let state = self.state(id).await?;
        if state != PluginState::Loaded {
            return Err(HostError::StateConflict {
                id: id.to_string(),
                operation: "initialize".to_string(),
                state: state.to_string(),
            });
        }

        let mut ctx = PluginContext::new(id, self.data_root.join(id)).with_config(config);
        if let Some(events) = &self.events {
            ctx = ctx.with_events(events.clone());
        }
        if let Some(services) = &self.services {
            ctx = ctx.with_services(services.clone());
        }
        let ctx = Arc::new(ctx);

        let result = self
            .call_with_retry(id, "initialize", self.config.init_timeout, plugin, {
                let ctx = ctx.clone();
                move |p| p.initialize(&ctx)
            })
            .await;

        match result {
            Ok(()) => {
                self.transition(id, PluginState::Initialized, "initialized", None)
                    .await
            }
            Err(e) => {
                self.transition(id, PluginState::Error, "initialize failed", Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Start a plugin. Requires Loaded or Initialized (or Stopped for restart).
    pub async fn start(&self, id: &str) -> Result<(), HostError> {
        let (plugin, op_lock, _) = self.entry_handles(id).await?;
        let _op = op_lock.lock().await;

        let state = self.state(id).await?;
        if !matches!(
            state,
            PluginState::Loaded | PluginState::Initialized | PluginState::Stopped
        ) {
            return Err(HostError::StateConflict {
                id: id.to_string(),
                operation: "start".to_string(),
                state: state.to_string(),
            });
        }

        let result = self
            .call_with_retry(id, "start", self.config.start_timeout, plugin, |p| p.start())
            .await;

        match result {
            Ok(()) => self.transition(id, PluginState::Running, "started", None).await,
            Err(e) => {
                self.transition(id, PluginState::Error, "start failed", Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Stop a plugin. A no-op returning success unless Running.
    pub async fn stop(&self, id: &str) -> Result<(), HostError> {
        let (plugin, op_lock, _) = self.entry_handles(id).await?;
        let _op = op_lock.lock().await;
        self.stop_locked(id, plugin).await
    }

    async fn stop_locked(&self, id: &str, plugin: SharedPlugin) -> Result<(), HostError> {
        let state = self.state(id).await?;
        if state != PluginState::Running {
            tracing::debug!(plugin = %id, state = %state, "stop is a no-op");
            return Ok(());
        }

        self.transition(id, PluginState::Stopping, "stop requested", None)
            .await?;

        let result = self
            .call_with_retry(id, "stop", self.config.stop_timeout, plugin, |p| p.stop())
            .await;

        match result {
            Ok(()) => self.transition(id, PluginState::Stopped, "stopped", None).await,
            Err(e) => {
                self.transition(id, PluginState::Error, "stop failed", Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Stop, wait one retry delay, start
    pub async fn restart(&self, id: &str) -> Result<(), HostError> {
        self.stop(id).await?;
        tokio::time::sleep(self.config.retry_delay).await;
        self.start(id).await
    }

    /// Release a plugin's resources.
    ///
    /// Stops first when Running (failures logged, cleanup continues), then
    /// invokes the plugin's cleanup and purges history and listeners.
    pub async fn cleanup(&self, id: &str) -> Result<(), HostError> {
        let (plugin, op_lock, _) = self.entry_handles(id).await?;
        let _op = op_lock.lock().await;

        if self.state(id).await? == PluginState::Running
            && let Err(e) = self.stop_locked(id, plugin.clone()).await
        {
            tracing::warn!(plugin = %id, error = %e, "stop during cleanup failed, continuing");
        }

        let result = self
            .call_with_retry(id, "cleanup", self.config.cleanup_timeout, plugin, |p| {
                p.cleanup()
            })
            .await;
        if let Err(e) = &result {
            tracing::warn!(plugin = %id, error = %e, "cleanup reported an error, continuing");
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.history.clear();
            if entry.state != PluginState::Error {
                entry.state = PluginState::Stopped;
            }
        }
        drop(entries);
        self.listeners.write().await.remove(id);
        Ok(())
    }

    /// Poll until the plugin reaches `target`.
    ///
    /// Observing Error (when Error is not the target) fails immediately.
    pub async fn wait_for_state(
        &self,
        id: &str,
        target: PluginState,
        timeout: Duration,
    ) -> Result<(), HostError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.state(id).await?;
            if state == target {
                return Ok(());
            }
            if state == PluginState::Error && target != PluginState::Error {
                return Err(HostError::StateConflict {
                    id: id.to_string(),
                    operation: format!("wait for {target}"),
                    state: state.to_string(),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HostError::Timeout {
                    operation: format!("wait for {target}"),
                    timeout,
                });
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(HostError::Timeout {
                        operation: format!("wait for {target} (cancelled)"),
                        timeout,
                    });
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}
