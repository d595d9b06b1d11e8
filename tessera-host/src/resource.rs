//! Resource subsystem - per-plugin usage sampling and limit enforcement
//!
//! A [`ResourceMonitor`] samples one plugin at a fixed interval: memory and
//! CPU come from the OS via `sysinfo` when the plugin has its own process,
//! task/file/connection counts come from counters the host feeds. Each tick
//! appends one bounded-history sample and raises at most one violation per
//! breached limit, enforced according to the configured mode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::HostError;

/// What happens when a limit is breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforceMode {
    /// Log the breach and move on
    Log,
    /// Log a warning and record a violation
    Warn,
    /// Record a violation and invoke the kill hook
    Kill,
}

/// Per-plugin resource ceilings. A zero ceiling disables that check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_bytes: u64,
    /// Percent of one core, 0-100
    pub max_cpu_percent: f64,
    pub max_tasks: u64,
    pub max_file_handles: u64,
    pub max_network_conns: u64,
    pub enforce_mode: EnforceMode,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 256 * 1024 * 1024,
            max_cpu_percent: 80.0,
            max_tasks: 100,
            max_file_handles: 256,
            max_network_conns: 64,
            enforce_mode: EnforceMode::Warn,
        }
    }
}

impl ResourceLimits {
    /// Reject nonsense ceilings
    pub fn validate(&self) -> Result<(), HostError> {
        if !(0.0..=100.0).contains(&self.max_cpu_percent) {
            return Err(HostError::InvalidInput(format!(
                "max_cpu_percent must be within 0-100, got {}",
                self.max_cpu_percent
            )));
        }
        Ok(())
    }
}

/// Point-in-time usage measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    pub tasks: u64,
    pub file_handles: u64,
    pub network_conns: u64,
    pub timestamp: DateTime<Utc>,
}

/// Which ceiling a violation breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Memory,
    Cpu,
    Tasks,
    FileHandles,
    NetworkConns,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Tasks => "tasks",
            Self::FileHandles => "file_handles",
            Self::NetworkConns => "network_conns",
        }
    }
}

/// One recorded limit breach
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceViolation {
    pub plugin_id: String,
    pub kind: LimitKind,
    pub limit: f64,
    pub observed: f64,
    pub mode: EnforceMode,
    pub timestamp: DateTime<Utc>,
}

/// Tuning for the sampling loop and histories
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sample_interval: Duration,
    pub max_samples: usize,
    pub max_violations: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            max_samples: 120,
            max_violations: 100,
        }
    }
}

/// Callback invoked for a Kill-mode violation
pub type KillHook = Arc<dyn Fn(&str, &ResourceViolation) + Send + Sync>;

/// Watches one plugin's resource usage
pub struct ResourceMonitor {
    plugin_id: String,
    limits: ResourceLimits,
    config: MonitorConfig,
    /// OS process to sample, for plugins that run out of process
    pid: Option<Pid>,
    system: Mutex<System>,
    tasks: AtomicU64,
    file_handles: AtomicU64,
    network_conns: AtomicU64,
    samples: StdRwLock<Vec<ResourceUsage>>,
    violations: StdRwLock<Vec<ResourceViolation>>,
    kill_hook: StdRwLock<Option<KillHook>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("plugin_id", &self.plugin_id)
            .field("limits", &self.limits)
            .field("config", &self.config)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl ResourceMonitor {
    /// Create a monitor. `pid` enables OS-level memory/CPU sampling.
    pub fn new(
        plugin_id: impl Into<String>,
        limits: ResourceLimits,
        config: MonitorConfig,
        pid: Option<u32>,
    ) -> Result<Self, HostError> {
        limits.validate()?;
        Ok(Self {
            plugin_id: plugin_id.into(),
            limits,
            config,
            pid: pid.map(Pid::from_u32),
            system: Mutex::new(System::new()),
            tasks: AtomicU64::new(0),
            file_handles: AtomicU64::new(0),
            network_conns: AtomicU64::new(0),
            samples: StdRwLock::new(Vec::new()),
            violations: StdRwLock::new(Vec::new()),
            kill_hook: StdRwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Install the hook invoked on Kill-mode violations
    pub fn set_kill_hook(&self, hook: KillHook) {
        *self.kill_hook.write().expect("kill hook poisoned") = Some(hook);
    }

    /// The ceilings this monitor enforces
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn record_task_started(&self) {
        self.tasks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_task_finished(&self) {
        let _ = self
            .tasks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn record_file_opened(&self) {
        self.file_handles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_file_closed(&self) {
        let _ = self
            .file_handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn record_conn_opened(&self) {
        self.network_conns.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_conn_closed(&self) {
        let _ = self
            .network_conns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    /// Take one usage measurement
    pub fn sample_once(&self) -> ResourceUsage {
        let (memory_bytes, cpu_percent) = match self.pid {
            Some(pid) => {
                let mut system = self.system.lock().expect("system poisoned");
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_memory().with_cpu(),
                );
                system
                    .process(pid)
                    .map(|p| (p.memory(), f64::from(p.cpu_usage())))
                    .unwrap_or((0, 0.0))
            }
            None => (0, 0.0),
        };

        ResourceUsage {
            memory_bytes,
            cpu_percent,
            tasks: self.tasks.load(Ordering::SeqCst),
            file_handles: self.file_handles.load(Ordering::SeqCst),
            network_conns: self.network_conns.load(Ordering::SeqCst),
            timestamp: Utc::now(),
        }
    }

    /// Ceilings breached by a measurement, one violation per breached limit
    pub fn check_limits(&self, usage: &ResourceUsage) -> Vec<ResourceViolation> {
        let mut violations = Vec::new();
        let mut push = |kind: LimitKind, limit: f64, observed: f64| {
            if limit > 0.0 && observed > limit {
                violations.push(ResourceViolation {
                    plugin_id: self.plugin_id.clone(),
                    kind,
                    limit,
                    observed,
                    mode: self.limits.enforce_mode,
                    timestamp: usage.timestamp,
                });
            }
        };
        push(
            LimitKind::Memory,
            self.limits.max_memory_bytes as f64,
            usage.memory_bytes as f64,
        );
        push(LimitKind::Cpu, self.limits.max_cpu_percent, usage.cpu_percent);
        push(LimitKind::Tasks, self.limits.max_tasks as f64, usage.tasks as f64);
        push(
            LimitKind::FileHandles,
            self.limits.max_file_handles as f64,
            usage.file_handles as f64,
        );
        push(
            LimitKind::NetworkConns,
            self.limits.max_network_conns as f64,
            usage.network_conns as f64,
        );
        violations
    }

    fn enforce(&self, violation: ResourceViolation) {
        match violation.mode {
            EnforceMode::Log => {
                tracing::info!(
                    plugin = %self.plugin_id,
                    kind = violation.kind.as_str(),
                    limit = violation.limit,
                    observed = violation.observed,
                    "resource limit breached"
                );
            }
            EnforceMode::Warn => {
                tracing::warn!(
                    plugin = %self.plugin_id,
                    kind = violation.kind.as_str(),
                    limit = violation.limit,
                    observed = violation.observed,
                    "resource limit breached"
                );
                self.record_violation(violation);
            }
            EnforceMode::Kill => {
                tracing::error!(
                    plugin = %self.plugin_id,
                    kind = violation.kind.as_str(),
                    limit = violation.limit,
                    observed = violation.observed,
                    "resource limit breached, terminating"
                );
                let hook = self.kill_hook.read().expect("kill hook poisoned").clone();
                self.record_violation(violation.clone());
                if let Some(hook) = hook {
                    hook(&self.plugin_id, &violation);
                }
            }
        }
    }

    fn record_violation(&self, violation: ResourceViolation) {
        let mut violations = self.violations.write().expect("violations poisoned");
        while violations.len() >= self.config.max_violations.max(1) {
            violations.remove(0);
        }
        violations.push(violation);
    }

    /// Sample, record, and enforce one tick
    pub fn tick(&self) {
        let usage = self.sample_once();
        {
            let mut samples = self.samples.write().expect("samples poisoned");
            while samples.len() >= self.config.max_samples.max(1) {
                samples.remove(0);
            }
            samples.push(usage.clone());
        }
        for violation in self.check_limits(&usage) {
            self.enforce(violation);
        }
    }

    /// Run the sampling loop until cancelled
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => {
                        tracing::debug!(plugin = %monitor.plugin_id, "resource monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => monitor.tick(),
                }
            }
        });
    }

    /// Most recent measurement, if any
    pub fn latest_usage(&self) -> Option<ResourceUsage> {
        self.samples.read().expect("samples poisoned").last().cloned()
    }

    /// Recorded measurements, oldest first
    pub fn usage_history(&self) -> Vec<ResourceUsage> {
        self.samples.read().expect("samples poisoned").clone()
    }

    /// Recorded violations, oldest first
    pub fn violations(&self) -> Vec<ResourceViolation> {
        self.violations.read().expect("violations poisoned").clone()
    }

    /// One-shot check against the current measurement
    pub fn check_now(&self) -> Vec<ResourceViolation> {
        let usage = self.sample_once();
        self.check_limits(&usage)
    }

    /// Stop the loop and drop all recorded state. Idempotent.
    pub fn force_cleanup(&self) {
        self.cancel.cancel();
        self.samples.write().expect("samples poisoned").clear();
        self.violations.write().expect("violations poisoned").clear();
        self.tasks.store(0, Ordering::SeqCst);
        self.file_handles.store(0, Ordering::SeqCst);
        self.network_conns.store(0, Ordering::SeqCst);
    }
}

/// Id-keyed collection of monitors
#[derive(Default)]
pub struct ResourceManager {
    monitors: RwLock<HashMap<String, Arc<ResourceMonitor>>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, start and track a monitor for a plugin
    pub async fn attach(
        &self,
        id: &str,
        limits: ResourceLimits,
        config: MonitorConfig,
        pid: Option<u32>,
    ) -> Result<Arc<ResourceMonitor>, HostError> {
        let mut monitors = self.monitors.write().await;
        if monitors.contains_key(id) {
            return Err(HostError::InvalidInput(format!(
                "plugin '{id}' already has a resource monitor"
            )));
        }
        let monitor = Arc::new(ResourceMonitor::new(id, limits, config, pid)?);
        monitor.start();
        monitors.insert(id.to_string(), monitor.clone());
        Ok(monitor)
    }

    /// Stop and remove a plugin's monitor. Missing ids are not a fault.
    pub async fn detach(&self, id: &str) {
        if let Some(monitor) = self.monitors.write().await.remove(id) {
            monitor.force_cleanup();
        }
    }

    /// The monitor for a plugin, if attached
    pub async fn get(&self, id: &str) -> Option<Arc<ResourceMonitor>> {
        self.monitors.read().await.get(id).cloned()
    }

    /// Latest measurement per monitored plugin
    pub async fn usage_snapshot(&self) -> HashMap<String, ResourceUsage> {
        let monitors = self.monitors.read().await;
        monitors
            .iter()
            .filter_map(|(id, m)| m.latest_usage().map(|u| (id.clone(), u)))
            .collect()
    }

    /// Stop every monitor
    pub async fn shutdown(&self) {
        let mut monitors = self.monitors.write().await;
        for (_, monitor) in monitors.drain() {
            monitor.force_cleanup();
        }
    }
}
