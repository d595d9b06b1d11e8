//! Security subsystem - per-plugin access policy and rate limits
//!
//! A [`SecurityEnforcer`] evaluates one plugin's policy. Path and network
//! checks follow a fixed order: sandbox hard block, then the first explicit
//! deny rule, then the first explicit allow rule, then the policy default.
//! Violations flow through a bounded channel to a drain task that logs them
//! and appends JSON lines to the audit file; a saturated channel drops the
//! violation rather than blocking the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::HostError;

/// A named capability a plugin may hold, like `file:read`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(pub String);

impl Permission {
    pub const FILE_READ: &'static str = "file:read";
    pub const FILE_WRITE: &'static str = "file:write";
    pub const FILE_EXECUTE: &'static str = "file:execute";
    pub const NET_CONNECT: &'static str = "net:connect";
    pub const NET_LISTEN: &'static str = "net:listen";
    pub const SYS_EXEC: &'static str = "sys:exec";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// Glob match with `*` and `?`.
///
/// `*` matches any run of characters except the path separator, `?` matches
/// one non-separator character. Anything else matches literally.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('*') => {
                if inner(&p[1..], t) {
                    return true;
                }
                let mut i = 0;
                while i < t.len() && t[i] != '/' {
                    i += 1;
                    if inner(&p[1..], &t[i..]) {
                        return true;
                    }
                }
                false
            }
            Some('?') => !t.is_empty() && t[0] != '/' && inner(&p[1..], &t[1..]),
            Some(c) => !t.is_empty() && t[0] == *c && inner(&p[1..], &t[1..]),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}

/// Path access rule. Empty `permissions` means the rule covers all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRule {
    pub pattern: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub deny: bool,
}

impl PathRule {
    fn covers(&self, path: &str, permission: &str) -> bool {
        glob_match(&self.pattern, path)
            && (self.permissions.is_empty()
                || self.permissions.iter().any(|p| p == permission))
    }
}

/// Network access rule. Port 0 means any port; host supports globs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRule {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub deny: bool,
}

impl NetworkRule {
    fn covers(&self, host: &str, port: u16, protocol: &str) -> bool {
        glob_match(&self.host, host)
            && (self.port == 0 || self.port == port)
            && self
                .protocol
                .as_deref()
                .is_none_or(|p| p.eq_ignore_ascii_case(protocol))
    }
}

/// Hard sandbox boundary applied before any rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxLimits {
    #[serde(default)]
    pub enabled: bool,
    /// When non-empty, only these paths are reachable at all
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    #[serde(default)]
    pub max_file_size: u64,
    #[serde(default)]
    pub max_open_files: u64,
}

/// A named rate-limit bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    /// Admitted calls per window
    pub capacity: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl RateLimit {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Audit trail settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Everything a plugin is allowed to do
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Granted permissions
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub path_rules: Vec<PathRule>,
    #[serde(default)]
    pub network_rules: Vec<NetworkRule>,
    #[serde(default)]
    pub sandbox: SandboxLimits,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimit>,
    #[serde(default)]
    pub audit: AuditConfig,
    /// Verdict when no rule matches
    #[serde(default)]
    pub default_allow: bool,
}

impl SecurityPolicy {
    /// Reject unusable policies
    pub fn validate(&self) -> Result<(), HostError> {
        for rule in &self.path_rules {
            if rule.pattern.is_empty() {
                return Err(HostError::InvalidInput(
                    "path rule with an empty pattern".to_string(),
                ));
            }
        }
        for rule in &self.network_rules {
            if rule.host.is_empty() {
                return Err(HostError::InvalidInput(
                    "network rule with an empty host".to_string(),
                ));
            }
        }
        for (name, limit) in &self.rate_limits {
            if limit.capacity == 0 || limit.window_ms == 0 {
                return Err(HostError::InvalidInput(format!(
                    "rate limit '{name}' must have positive capacity and window"
                )));
            }
        }
        Ok(())
    }
}

/// What kind of policy breach occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Permission,
    PathAccess,
    NetworkAccess,
    RateLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One recorded policy breach
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub plugin_id: String,
    pub kind: ViolationKind,
    /// What was touched: a path, `host:port`, a permission, a bucket name
    pub resource: String,
    pub severity: Severity,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

/// Buffered violations before the drain task; overflow is dropped
const VIOLATION_BUFFER: usize = 100;

/// Evaluates one plugin's policy
pub struct SecurityEnforcer {
    plugin_id: String,
    policy: SecurityPolicy,
    buckets: StdMutex<HashMap<String, Vec<Instant>>>,
    violations_tx: mpsc::Sender<SecurityViolation>,
    violations_rx: StdMutex<Option<mpsc::Receiver<SecurityViolation>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SecurityEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEnforcer")
            .field("plugin_id", &self.plugin_id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SecurityEnforcer {
    /// Create an enforcer for a validated policy
    pub fn new(plugin_id: impl Into<String>, policy: SecurityPolicy) -> Result<Self, HostError> {
        Self::with_buffer(plugin_id, policy, VIOLATION_BUFFER)
    }

    fn with_buffer(
        plugin_id: impl Into<String>,
        policy: SecurityPolicy,
        buffer: usize,
    ) -> Result<Self, HostError> {
        policy.validate()?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Ok(Self {
            plugin_id: plugin_id.into(),
            policy,
            buckets: StdMutex::new(HashMap::new()),
            violations_tx: tx,
            violations_rx: StdMutex::new(Some(rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// The policy being enforced
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Spawn the task that logs violations and appends them to the audit
    /// file when auditing is enabled. Call once.
    pub fn spawn_drain(&self) {
        let Some(mut rx) = self.violations_rx.lock().expect("drain rx poisoned").take() else {
            return;
        };
        let cancel = self.cancel.clone();
        let audit = self.policy.audit.clone();
        let plugin_id = self.plugin_id.clone();

        tokio::spawn(async move {
            loop {
                let violation = tokio::select! {
                    _ = cancel.cancelled() => break,
                    v = rx.recv() => match v {
                        Some(v) => v,
                        None => break,
                    },
                };

                tracing::warn!(
                    plugin = %plugin_id,
                    kind = ?violation.kind,
                    resource = %violation.resource,
                    "security violation"
                );

                if audit.enabled
                    && let Some(path) = &audit.path
                    && let Ok(line) = serde_json::to_string(&violation)
                {
                    let result = async {
                        let mut file = tokio::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(path)
                            .await?;
                        file.write_all(line.as_bytes()).await?;
                        file.write_all(b"\n").await
                    }
                    .await;
                    if let Err(e) = result {
                        tracing::error!(plugin = %plugin_id, error = %e, "audit write failed");
                    }
                }
            }
        });
    }

    /// Stop the drain task. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn record_violation(&self, kind: ViolationKind, resource: &str, severity: Severity) {
        let violation = SecurityViolation {
            plugin_id: self.plugin_id.clone(),
            kind,
            resource: resource.to_string(),
            severity,
            action: "denied".to_string(),
            timestamp: Utc::now(),
        };
        // Never block the checking path; overflow is dropped with a log line
        if self.violations_tx.try_send(violation).is_err() {
            tracing::warn!(
                plugin = %self.plugin_id,
                resource = %resource,
                "violation channel full, dropping"
            );
        }
    }

    fn rejected(&self, rule: &str) -> HostError {
        HostError::PolicyRejected {
            id: self.plugin_id.clone(),
            rule: rule.to_string(),
        }
    }

    /// Whether the plugin holds a permission
    pub fn check_permission(&self, permission: &str) -> Result<(), HostError> {
        if self.policy.permissions.iter().any(|p| p.0 == permission) {
            return Ok(());
        }
        self.record_violation(ViolationKind::Permission, permission, Severity::Medium);
        Err(self.rejected(&format!("permission '{permission}' not granted")))
    }

    /// Whether the plugin may access a path with a given permission.
    ///
    /// Order: sandbox hard block, first deny match, first allow match,
    /// policy default.
    pub fn check_path_access(&self, path: &str, permission: &str) -> Result<(), HostError> {
        if self.policy.sandbox.enabled {
            if self
                .policy
                .sandbox
                .blocked_paths
                .iter()
                .any(|p| glob_match(p, path))
            {
                self.record_violation(ViolationKind::PathAccess, path, Severity::High);
                return Err(self.rejected(&format!("sandbox blocks path '{path}'")));
            }
            if !self.policy.sandbox.allowed_paths.is_empty()
                && !self
                    .policy
                    .sandbox
                    .allowed_paths
                    .iter()
                    .any(|p| glob_match(p, path))
            {
                self.record_violation(ViolationKind::PathAccess, path, Severity::High);
                return Err(self.rejected(&format!("sandbox does not allow path '{path}'")));
            }
        }

        if let Some(rule) = self
            .policy
            .path_rules
            .iter()
            .find(|r| r.deny && r.covers(path, permission))
        {
            self.record_violation(ViolationKind::PathAccess, path, Severity::Medium);
            return Err(self.rejected(&format!("path rule '{}' denies access", rule.pattern)));
        }
        if self
            .policy
            .path_rules
            .iter()
            .any(|r| !r.deny && r.covers(path, permission))
        {
            return Ok(());
        }

        if self.policy.default_allow {
            Ok(())
        } else {
            self.record_violation(ViolationKind::PathAccess, path, Severity::Low);
            Err(self.rejected(&format!("no rule allows path '{path}'")))
        }
    }

    /// Whether the plugin may reach a host/port/protocol
    pub fn check_network_access(
        &self,
        host: &str,
        port: u16,
        protocol: &str,
    ) -> Result<(), HostError> {
        let resource = format!("{host}:{port}");

        if let Some(rule) = self
            .policy
            .network_rules
            .iter()
            .find(|r| r.deny && r.covers(host, port, protocol))
        {
            self.record_violation(ViolationKind::NetworkAccess, &resource, Severity::Medium);
            return Err(self.rejected(&format!("network rule '{}' denies access", rule.host)));
        }
        if self
            .policy
            .network_rules
            .iter()
            .any(|r| !r.deny && r.covers(host, port, protocol))
        {
            return Ok(());
        }

        if self.policy.default_allow {
            Ok(())
        } else {
            self.record_violation(ViolationKind::NetworkAccess, &resource, Severity::Low);
            Err(self.rejected(&format!("no rule allows '{resource}'")))
        }
    }

    /// Admit or reject a call against a named bucket.
    ///
    /// Timestamps outside the window are pruned first; a call is admitted
    /// only while fewer than `capacity` admitted calls remain in the window,
    /// and only admitted calls are recorded. Unknown buckets are unlimited.
    pub fn check_rate_limit(&self, bucket: &str) -> Result<(), HostError> {
        let Some(limit) = self.policy.rate_limits.get(bucket) else {
            return Ok(());
        };

        let now = Instant::now();
        let window = limit.window();
        let mut buckets = self.buckets.lock().expect("rate buckets poisoned");
        let timestamps = buckets.entry(bucket.to_string()).or_default();

        timestamps.retain(|t| now.duration_since(*t) < window);
        if timestamps.len() < limit.capacity as usize {
            timestamps.push(now);
            return Ok(());
        }

        drop(buckets);
        self.record_violation(ViolationKind::RateLimit, bucket, Severity::Low);
        Err(self.rejected(&format!("rate limit '{bucket}' exceeded")))
    }
}

/// Id-keyed collection of enforcers
#[derive(Default)]
pub struct SecurityManager {
    enforcers: RwLock<HashMap<String, Arc<SecurityEnforcer>>>,
}

impl SecurityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, start and track an enforcer for a plugin
    pub async fn attach(
        &self,
        id: &str,
        policy: SecurityPolicy,
    ) -> Result<Arc<SecurityEnforcer>, HostError> {
        let mut enforcers = self.enforcers.write().await;
        if enforcers.contains_key(id) {
            return Err(HostError::InvalidInput(format!(
                "plugin '{id}' already has a security enforcer"
            )));
        }
        let enforcer = Arc::new(SecurityEnforcer::new(id, policy)?);
        enforcer.spawn_drain();
        enforcers.insert(id.to_string(), enforcer.clone());
        Ok(enforcer)
    }

    /// Stop and remove a plugin's enforcer. Missing ids are not a fault.
    pub async fn detach(&self, id: &str) {
        if let Some(enforcer) = self.enforcers.write().await.remove(id) {
            enforcer.stop();
        }
    }

    /// The enforcer for a plugin, if attached
    pub async fn get(&self, id: &str) -> Option<Arc<SecurityEnforcer>> {
        self.enforcers.read().await.get(id).cloned()
    }

    /// Stop every enforcer
    pub async fn shutdown(&self) {
        let mut enforcers = self.enforcers.write().await;
        for (_, enforcer) in enforcers.drain() {
            enforcer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer(policy: SecurityPolicy) -> SecurityEnforcer {
        SecurityEnforcer::new("p1", policy).unwrap()
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.txt", "notes.txt"));
        assert!(!glob_match("*.txt", "notes.rs"));
        assert!(glob_match("/data/*/cache", "/data/p1/cache"));
        assert!(!glob_match("/data/*", "/data/p1/cache"), "* stops at separators");
        assert!(glob_match("file-?.log", "file-1.log"));
        assert!(!glob_match("file-?.log", "file-10.log"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = SecurityPolicy::default();
        assert!(policy.validate().is_ok());

        policy.path_rules.push(PathRule {
            pattern: String::new(),
            permissions: vec![],
            deny: false,
        });
        assert!(policy.validate().is_err());

        let mut policy = SecurityPolicy::default();
        policy.rate_limits.insert(
            "api".to_string(),
            RateLimit {
                capacity: 0,
                window_ms: 1000,
            },
        );
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_permission_check() {
        let policy = SecurityPolicy {
            permissions: vec![Permission::new(Permission::FILE_READ)],
            ..Default::default()
        };
        let enforcer = enforcer(policy);

        assert!(enforcer.check_permission(Permission::FILE_READ).is_ok());
        let err = enforcer
            .check_permission(Permission::NET_CONNECT)
            .unwrap_err();
        assert!(matches!(err, HostError::PolicyRejected { .. }));
    }

    #[test]
    fn test_path_deny_beats_allow() {
        let policy = SecurityPolicy {
            path_rules: vec![
                PathRule {
                    pattern: "/data/*".to_string(),
                    permissions: vec![],
                    deny: false,
                },
                PathRule {
                    pattern: "/data/secrets".to_string(),
                    permissions: vec![],
                    deny: true,
                },
            ],
            ..Default::default()
        };
        let enforcer = enforcer(policy);

        assert!(enforcer
            .check_path_access("/data/public", Permission::FILE_READ)
            .is_ok());
        assert!(enforcer
            .check_path_access("/data/secrets", Permission::FILE_READ)
            .is_err());
    }

    #[test]
    fn test_sandbox_block_beats_explicit_allow() {
        let policy = SecurityPolicy {
            sandbox: SandboxLimits {
                enabled: true,
                blocked_paths: vec!["/etc/*".to_string()],
                ..Default::default()
            },
            path_rules: vec![PathRule {
                pattern: "/etc/*".to_string(),
                permissions: vec![],
                deny: false,
            }],
            ..Default::default()
        };
        let enforcer = enforcer(policy);

        let err = enforcer
            .check_path_access("/etc/passwd", Permission::FILE_READ)
            .unwrap_err();
        assert!(err.to_string().contains("sandbox"));
    }

    #[test]
    fn test_sandbox_allowlist_confines_access() {
        let policy = SecurityPolicy {
            sandbox: SandboxLimits {
                enabled: true,
                allowed_paths: vec!["/data/*".to_string()],
                ..Default::default()
            },
            default_allow: true,
            ..Default::default()
        };
        let enforcer = enforcer(policy);

        assert!(enforcer
            .check_path_access("/data/file", Permission::FILE_READ)
            .is_ok());
        assert!(enforcer
            .check_path_access("/home/file", Permission::FILE_READ)
            .is_err());
    }

    #[test]
    fn test_path_rule_permission_scoping() {
        let policy = SecurityPolicy {
            path_rules: vec![PathRule {
                pattern: "/data/*".to_string(),
                permissions: vec![Permission::FILE_READ.to_string()],
                deny: false,
            }],
            ..Default::default()
        };
        let enforcer = enforcer(policy);

        assert!(enforcer
            .check_path_access("/data/file", Permission::FILE_READ)
            .is_ok());
        // Rule only grants read; write falls through to the default deny
        assert!(enforcer
            .check_path_access("/data/file", Permission::FILE_WRITE)
            .is_err());
    }

    #[test]
    fn test_default_verdict_applies_without_rules() {
        let deny = enforcer(SecurityPolicy::default());
        assert!(deny.check_path_access("/anything", Permission::FILE_READ).is_err());
        assert!(deny.check_network_access("example.com", 443, "tcp").is_err());

        let allow = enforcer(SecurityPolicy {
            default_allow: true,
            ..Default::default()
        });
        assert!(allow.check_path_access("/anything", Permission::FILE_READ).is_ok());
        assert!(allow.check_network_access("example.com", 443, "tcp").is_ok());
    }

    #[test]
    fn test_network_rules() {
        let policy = SecurityPolicy {
            network_rules: vec![
                NetworkRule {
                    host: "*.example.com".to_string(),
                    port: 0,
                    protocol: None,
                    deny: false,
                },
                NetworkRule {
                    host: "evil.example.com".to_string(),
                    port: 0,
                    protocol: None,
                    deny: true,
                },
            ],
            ..Default::default()
        };
        let enforcer = enforcer(policy);

        assert!(enforcer.check_network_access("api.example.com", 443, "tcp").is_ok());
        assert!(enforcer.check_network_access("evil.example.com", 443, "tcp").is_err());
        // Unlisted host, default deny
        assert!(enforcer.check_network_access("other.org", 80, "tcp").is_err());
    }

    #[test]
    fn test_network_rule_port_and_protocol() {
        let policy = SecurityPolicy {
            network_rules: vec![NetworkRule {
                host: "db.internal".to_string(),
                port: 5432,
                protocol: Some("tcp".to_string()),
                deny: false,
            }],
            ..Default::default()
        };
        let enforcer = enforcer(policy);

        assert!(enforcer.check_network_access("db.internal", 5432, "tcp").is_ok());
        assert!(enforcer.check_network_access("db.internal", 5433, "tcp").is_err());
        assert!(enforcer.check_network_access("db.internal", 5432, "udp").is_err());
    }

    #[test]
    fn test_rate_limit_capacity_per_window() {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            "api".to_string(),
            RateLimit {
                capacity: 3,
                window_ms: 10_000,
            },
        );
        let enforcer = enforcer(SecurityPolicy {
            rate_limits,
            ..Default::default()
        });

        // K calls within the window succeed
        for _ in 0..3 {
            assert!(enforcer.check_rate_limit("api").is_ok());
        }
        // The (K+1)th is rejected
        let err = enforcer.check_rate_limit("api").unwrap_err();
        assert!(matches!(err, HostError::PolicyRejected { .. }));
    }

    #[test]
    fn test_rate_limit_recovers_after_window() {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            "api".to_string(),
            RateLimit {
                capacity: 2,
                window_ms: 30,
            },
        );
        let enforcer = enforcer(SecurityPolicy {
            rate_limits,
            ..Default::default()
        });

        assert!(enforcer.check_rate_limit("api").is_ok());
        assert!(enforcer.check_rate_limit("api").is_ok());
        assert!(enforcer.check_rate_limit("api").is_err());

        std::thread::sleep(Duration::from_millis(40));
        assert!(enforcer.check_rate_limit("api").is_ok());
    }

    #[test]
    fn test_rejected_calls_are_not_recorded_against_the_window() {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            "api".to_string(),
            RateLimit {
                capacity: 1,
                window_ms: 50,
            },
        );
        let enforcer = enforcer(SecurityPolicy {
            rate_limits,
            ..Default::default()
        });

        assert!(enforcer.check_rate_limit("api").is_ok());
        // Rejections while saturated must not extend the window
        for _ in 0..10 {
            assert!(enforcer.check_rate_limit("api").is_err());
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(enforcer.check_rate_limit("api").is_ok());
    }

    #[test]
    fn test_unknown_bucket_is_unlimited() {
        let enforcer = enforcer(SecurityPolicy::default());
        for _ in 0..100 {
            assert!(enforcer.check_rate_limit("anything").is_ok());
        }
    }

    #[test]
    fn test_violation_channel_saturation_drops_without_blocking() {
        // Tiny buffer, no drain task running
        let enforcer =
            SecurityEnforcer::with_buffer("p1", SecurityPolicy::default(), 2).unwrap();

        // Far more violations than the buffer holds; must return promptly
        for _ in 0..50 {
            let _ = enforcer.check_permission("never:granted");
        }

        let mut rx = enforcer
            .violations_rx
            .lock()
            .unwrap()
            .take()
            .expect("receiver still present");
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, 2, "only the buffered violations were kept");
    }

    #[tokio::test]
    async fn test_audit_file_receives_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let policy = SecurityPolicy {
            audit: AuditConfig {
                enabled: true,
                path: Some(audit_path.clone()),
            },
            ..Default::default()
        };

        let enforcer = SecurityEnforcer::new("p1", policy).unwrap();
        enforcer.spawn_drain();
        let _ = enforcer.check_permission("never:granted");

        // Give the drain task a moment to flush
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if audit_path.exists() {
                break;
            }
        }
        let content = std::fs::read_to_string(&audit_path).unwrap();
        let line: SecurityViolation = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line.plugin_id, "p1");
        assert_eq!(line.kind, ViolationKind::Permission);
        enforcer.stop();
    }

    #[tokio::test]
    async fn test_manager_attach_detach() {
        let manager = SecurityManager::new();
        manager
            .attach("p1", SecurityPolicy::default())
            .await
            .unwrap();
        assert!(manager.get("p1").await.is_some());

        let err = manager
            .attach("p1", SecurityPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidInput(_)));

        manager.detach("p1").await;
        assert!(manager.get("p1").await.is_none());
        manager.detach("ghost").await;
    }
}
