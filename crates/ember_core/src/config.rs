//! # World Configuration
//!
//! Loaded once at startup. Every field has a default so a config file only
//! needs to name what it changes:
//!
//! ```toml
//! name = "arena"
//! max_repost_depth = 8
//! simulate = false
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default cap on message re-post chains.
pub const DEFAULT_MAX_REPOST_DEPTH: u32 = 16;

/// Default number of components per async update task.
pub const DEFAULT_ASYNC_GRANULARITY: usize = 256;

/// Default capacity of the diagnostics channel.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 1024;

/// Per-world settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Human-readable world name, used in logs.
    pub name: String,
    /// Game object slots reserved up front.
    pub object_capacity: usize,
    /// Posts deeper than this (message posted by a handler of a message
    /// posted by a handler ...) are dropped.
    pub max_repost_depth: u32,
    /// Seed for persistent-id generation. `0` picks a fixed default seed.
    pub seed: u64,
    /// Whether the simulation clock advances and "only when simulating"
    /// update functions run.
    pub simulate: bool,
    /// Simulation clock speed factor.
    pub clock_speed: f64,
    /// Default number of components handed to one async task.
    pub async_granularity: usize,
    /// Diagnostic events buffered before new ones are dropped.
    pub diagnostics_capacity: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            name: "world".to_string(),
            object_capacity: 1024,
            max_repost_depth: DEFAULT_MAX_REPOST_DEPTH,
            seed: 0,
            simulate: true,
            clock_speed: 1.0,
            async_granularity: DEFAULT_ASYNC_GRANULARITY,
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }
}

impl WorldConfig {
    /// Creates the default config with a custom name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the config back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks every field for usable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_repost_depth == 0 {
            return Err(ConfigError::Invalid("max_repost_depth must be at least 1".into()));
        }
        if self.async_granularity == 0 {
            return Err(ConfigError::Invalid("async_granularity must be at least 1".into()));
        }
        if self.diagnostics_capacity == 0 {
            return Err(ConfigError::Invalid("diagnostics_capacity must be at least 1".into()));
        }
        if !self.clock_speed.is_finite() || self.clock_speed < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "clock_speed must be finite and non-negative, got {}",
                self.clock_speed
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorldConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_repost_depth, 16);
        assert!(config.simulate);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WorldConfig::from_toml_str("name = \"arena\"\nsimulate = false\n").unwrap();
        assert_eq!(config.name, "arena");
        assert!(!config.simulate);
        assert_eq!(config.async_granularity, DEFAULT_ASYNC_GRANULARITY);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            WorldConfig::from_toml_str("max_repost_depth = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            WorldConfig::from_toml_str("clock_speed = -2.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            WorldConfig::from_toml_str("name = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = WorldConfig::named("roundtrip");
        let text = config.to_toml_string().unwrap();
        assert_eq!(WorldConfig::from_toml_str(&text).unwrap(), config);
    }
}
