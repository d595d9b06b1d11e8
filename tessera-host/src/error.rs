//! Host error types

use crate::loader::LoaderError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the plugin host
#[derive(Error, Debug)]
pub enum HostError {
    /// Plugin not found
    #[error("Plugin '{id}' not found")]
    NotFound { id: String },

    /// Caller supplied something unusable
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An operation exceeded its deadline
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// A security rule rejected the operation
    #[error("Plugin '{id}' rejected by policy: {rule}")]
    PolicyRejected { id: String, rule: String },

    /// The backend loader failed
    #[error("Loader error: {0}")]
    Backend(#[from] LoaderError),

    /// The plugin returned an error
    #[error("Plugin error: {0}")]
    Plugin(#[from] tessera_plugin_api::PluginError),

    /// Operation is not legal in the plugin's current state
    #[error("Plugin '{id}': cannot {operation} while {state}")]
    StateConflict {
        id: String,
        operation: String,
        state: String,
    },

    /// Unload recovery failed and the record was quarantined
    #[error("Plugin '{id}' is corrupted and requires manual intervention")]
    Corrupted { id: String },

    /// A configured limit would be exceeded
    #[error("Limit exceeded: {what} (limit {limit}, requested {requested})")]
    LimitExceeded {
        what: String,
        limit: u64,
        requested: u64,
    },

    /// Config document could not be parsed or written
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
