//! Plugin types and metadata structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Which backend a plugin is served by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Native dynamic library loaded in-process
    Dynamic,
    /// External process spoken to over a local RPC channel
    Rpc,
    /// Bytecode module executed inside a sandbox
    Wasm,
    /// File-watched plugin that can be swapped at runtime
    HotReload,
}

impl BackendKind {
    /// Stable string form used in config files and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dynamic => "dynamic",
            Self::Rpc => "rpc",
            Self::Wasm => "wasm",
            Self::HotReload => "hot_reload",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dynamic" => Ok(Self::Dynamic),
            "rpc" => Ok(Self::Rpc),
            "wasm" => Ok(Self::Wasm),
            "hot_reload" => Ok(Self::HotReload),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// Plugin metadata returned by `Plugin::info`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginInfo {
    /// Unique plugin identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Plugin version (semver)
    pub version: String,
    /// Human-readable description
    pub description: String,
    /// Plugin author
    pub author: String,
    /// Backend this plugin runs on
    pub kind: BackendKind,
    /// Path the plugin was loaded from
    pub path: PathBuf,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            version: "0.0.1".to_string(),
            description: String::new(),
            author: String::new(),
            kind: BackendKind::Dynamic,
            path: PathBuf::new(),
        }
    }
}

/// Plugin health as reported by `Plugin::health_check`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally
    Healthy,
    /// Operating with reduced capability
    Degraded {
        /// What is degraded
        reason: String,
    },
    /// Not operating
    Unhealthy {
        /// Why the plugin is unhealthy
        reason: String,
    },
}

impl HealthStatus {
    /// Whether this status counts as alive for liveness probes
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded { .. })
    }
}

/// Point-in-time metrics snapshot reported by a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetrics {
    /// Seconds since the plugin started
    pub uptime_secs: u64,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// CPU usage percentage (0-100)
    pub cpu_percent: f64,
    /// Requests handled since start
    pub request_count: u64,
    /// Errors observed since start
    pub error_count: u64,
    /// Plugin-specific metrics
    pub custom: serde_json::Map<String, serde_json::Value>,
    /// When this snapshot was taken
    pub collected_at: DateTime<Utc>,
}

impl Default for PluginMetrics {
    fn default() -> Self {
        Self {
            uptime_secs: 0,
            memory_bytes: 0,
            cpu_percent: 0.0,
            request_count: 0,
            error_count: 0,
            custom: serde_json::Map::new(),
            collected_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_roundtrip() {
        for kind in [
            BackendKind::Dynamic,
            BackendKind::Rpc,
            BackendKind::Wasm,
            BackendKind::HotReload,
        ] {
            let parsed: BackendKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_backend_kind_rejects_unknown() {
        assert!("native".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_info_default_version() {
        let info = PluginInfo::default();
        assert_eq!(info.version, "0.0.1");
        assert_eq!(info.kind, BackendKind::Dynamic);
    }

    #[test]
    fn test_health_status_liveness() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(
            HealthStatus::Degraded {
                reason: "cache cold".to_string()
            }
            .is_healthy()
        );
        assert!(
            !HealthStatus::Unhealthy {
                reason: "backend gone".to_string()
            }
            .is_healthy()
        );
    }

    #[test]
    fn test_health_status_json_roundtrip() {
        let status = HealthStatus::Unhealthy {
            reason: "connection refused".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        let parsed: HealthStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn test_metrics_default_is_zeroed() {
        let metrics = PluginMetrics::default();
        assert_eq!(metrics.uptime_secs, 0);
        assert_eq!(metrics.cpu_percent, 0.0);
        assert!(metrics.custom.is_empty());
    }
}
