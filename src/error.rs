/// Unified error handling for the portico router
///
/// Configuration errors propagate to the caller; runtime relay errors stay
/// `std::io::Error` and are confined to the connection pair that hit them.
use std::io;
use thiserror::Error;

/// Main error type for router operations
#[derive(Debug, Error)]
pub enum PorticoError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Network-related errors
    #[error("Network error: {0}")]
    Io(#[from] io::Error),

    /// A listener could not be bound or started
    #[error("Failed setting up route '{route}': {reason}")]
    FatalSetup { route: String, reason: String },

    /// Route names must be unique within a router
    #[error("Route '{0}' is already registered")]
    DuplicateRoute(String),

    /// A route was asked to start without a destination set
    #[error("Route '{route}' has no destinations configured")]
    NoDestinations { route: String },

    /// Routes cannot be reconfigured or restarted once started
    #[error("Route '{route}' is already started")]
    AlreadyStarted { route: String },
}

/// Configuration error types
///
/// `Invalid` carries the bare message so that callers see exactly the
/// diagnostic produced at the point of failure (destination URI and CSV
/// validation rely on this).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        ConfigError::Invalid(message.into())
    }
}

/// Result type alias for router operations
pub type Result<T> = std::result::Result<T, PorticoError>;
