//! Error types for plugin authors

use thiserror::Error;

/// Errors that plugins can return from lifecycle and service operations
#[derive(Error, Debug)]
pub enum PluginError {
    /// Initialization failed
    #[error("Initialization failed: {0}")]
    Init(String),

    /// Start failed
    #[error("Start failed: {0}")]
    Start(String),

    /// Stop failed
    #[error("Stop failed: {0}")]
    Stop(String),

    /// Cleanup failed
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Health check could not be performed
    #[error("Health check failed: {0}")]
    Health(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Sandboxed execution ran out of fuel
    #[error("Fuel limit exhausted")]
    FuelExhausted,

    /// Sandboxed execution exceeded its memory ceiling
    #[error("Memory limit exceeded")]
    MemoryExceeded,

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Anything else
    #[error("{0}")]
    Internal(String),
}

impl PluginError {
    /// Create an initialization error
    pub fn init(message: impl Into<String>) -> Self {
        Self::Init(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an internal error with a message
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
