//! Unified error type for Rill library operations
//!
//! Stream failures travel through [`Cause`](crate::Cause) on a sink's failure
//! channel. `RillError` covers everything that fails *outside* a running
//! stream: loading and validating configuration, and constructing operators
//! with arguments they cannot honour.

use serde::{Deserialize, Serialize};

/// Unified error type for all Rill library operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RillError {
    /// Invalid input or operator argument
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration problem
        message: String,
    },
}

impl RillError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Standard Result type for Rill operations
pub type Result<T> = std::result::Result<T, RillError>;

impl From<std::io::Error> for RillError {
    fn from(err: std::io::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::de::Error> for RillError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("Invalid TOML: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        assert_eq!(
            RillError::invalid("replay capacity must be positive").to_string(),
            "Invalid: replay capacity must be positive"
        );
        let err: RillError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "rill.toml").into();
        assert!(matches!(err, RillError::Config { .. }));
    }
}
