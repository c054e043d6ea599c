//! Runtime configuration for the stream core
//!
//! `RillConfig` travels through the ambient [`Context`](crate::Context).
//! Operators read it at run time with `cx.config()`, so different
//! subscriptions can run under different settings.
//!
//! Sources, later ones winning:
//! 1. `RillConfig::default()`
//! 2. a TOML file (`load_from_file`) or string (`from_toml_str`)
//! 3. environment variables prefixed with `RILL_` (`merge_with_env`)

mod validation;

pub use validation::{ConfigValidator, ValidationError, ValidationResult};

use crate::{Result, RillError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RILL_";

/// Upper bound accepted for the keyed debounce window.
pub const MAX_KEYED_DEBOUNCE_MS: u64 = 60_000;

/// Stream core configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RillConfig {
    /// Debounce window used by `keyed` when the caller does not pass one
    pub keyed_debounce_ms: u64,
    /// Subscriber count past which a subject logs a warning on attach
    pub subject_warn_subscribers: usize,
}

impl Default for RillConfig {
    fn default() -> Self {
        Self {
            keyed_debounce_ms: 0,
            subject_warn_subscribers: 1024,
        }
    }
}

impl RillConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RillConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RillError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `RILL_*` environment overrides.
    pub fn merge_with_env(&mut self) -> Result<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply overrides from an explicit list of `(name, value)` pairs.
    ///
    /// Unknown `RILL_*` names are ignored so that unrelated tooling can share
    /// the prefix.
    pub fn merge_with_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "keyed_debounce_ms" => self.keyed_debounce_ms = parse_number(&name, &value)?,
                "subject_warn_subscribers" => {
                    self.subject_warn_subscribers = parse_number(&name, &value)?;
                }
                _ => {}
            }
        }
        self.validate()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        ConfigValidator::new()
            .range(
                "keyed_debounce_ms",
                self.keyed_debounce_ms,
                None,
                Some(MAX_KEYED_DEBOUNCE_MS),
            )
            .check(
                "subject_warn_subscribers",
                self.subject_warn_subscribers > 0,
                "must be greater than zero",
            )
            .finish()
            .map_err(RillError::from)
    }

    /// Default keyed debounce window.
    pub fn keyed_debounce(&self) -> Duration {
        Duration::from_millis(self.keyed_debounce_ms)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        RillError::config(format!(
            "{name} must be a non-negative integer, got {value:?}"
        ))
    })
}
