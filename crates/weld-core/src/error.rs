//! Error types for weld-core
//!
//! Centralized error handling using `thiserror` for ergonomic error definitions.

use thiserror::Error;

/// Main error type for weld-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// A fitting name could not be parsed
    #[error("Unknown fitting: {0}")]
    UnknownFitting(String),

    /// A connector or casing refers to a node that does not exist
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// A policy refers to a parent that does not exist
    #[error("Unknown policy: {0}")]
    UnknownPolicy(u64),

    /// The policy tree contains a cycle through this policy
    #[error("Policy {0} is its own ancestor")]
    PolicyCycle(u64),

    /// A session with this id is already live
    #[error("Session {0} is already live")]
    DuplicateSession(u64),

    /// No live session with this id
    #[error("Unknown session: {0}")]
    UnknownSession(u64),

    /// A session event handler reported a failure
    #[error("Handler '{handler}' failed: {message}")]
    Handler {
        /// Name of the failing handler
        handler: String,
        /// Error message
        message: String,
    },

    /// A session event handler panicked
    #[error("Handler panicked on {event} for session {session_id}")]
    HandlerPanic {
        /// Session being handled
        session_id: u64,
        /// Event being handled
        event: &'static str,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a handler error
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Short, stable name of the error kind for log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::ConfigNotFound { .. } | Self::ConfigValue { .. } => "config",
            Self::UnknownFitting(_) => "unknown-fitting",
            Self::UnknownNode(_) => "unknown-node",
            Self::UnknownPolicy(_) => "unknown-policy",
            Self::PolicyCycle(_) => "policy-cycle",
            Self::DuplicateSession(_) => "duplicate-session",
            Self::UnknownSession(_) => "unknown-session",
            Self::Handler { .. } => "handler",
            Self::HandlerPanic { .. } => "handler-panic",
            Self::Io(_) => "io",
            Self::TomlParse(_) => "toml",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::handler("web-filter", "blocked page render failed");
        assert!(err.to_string().contains("web-filter"));
        assert!(err.to_string().contains("blocked page render failed"));

        let err = Error::DuplicateSession(42);
        assert_eq!(err.to_string(), "Session 42 is already live");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::config_value("foundry", "bad").kind(), "config");
        assert_eq!(Error::UnknownSession(1).kind(), "unknown-session");
        assert_eq!(
            Error::HandlerPanic { session_id: 1, event: "chunk" }.kind(),
            "handler-panic"
        );
    }
}
