//! Driver Configuration
//!
//! Configuration for an [`AioDriver`](crate::AioDriver) instance. Values can
//! be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `EVAIO_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `EVAIO_BATCH_CAPACITY` | Maximum operations per OS batch call | 64 |
//! | `EVAIO_COMPLETION_SIGNAL` | Signal number used by the signal-driven backend | SIGIO |
//!
//! # Example
//!
//! ```rust,ignore
//! use evaio::AioConfig;
//!
//! // Load from environment with defaults
//! let config = AioConfig::from_env()?;
//!
//! // Or set explicitly
//! let config = AioConfig {
//!     batch_capacity: 32,
//!     ..AioConfig::default()
//! };
//! config.validate()?;
//! ```

use std::env;

use thiserror::Error;

/// Upper bound on the per-batch capacity a driver will accept.
pub const MAX_BATCH_CAPACITY: usize = 4096;

/// Configuration for one driver instance.
#[derive(Debug, Clone)]
pub struct AioConfig {
    /// Maximum operations handed to the OS per submission call.
    ///
    /// The POSIX backends additionally clamp this to the platform's
    /// list-submission limit (at most 64). Default: 64.
    pub batch_capacity: usize,

    /// Signal number the signal-driven backend asks the OS to deliver on
    /// completion. Default: `SIGIO`.
    pub completion_signal: i32,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            batch_capacity: 64,
            completion_signal: default_completion_signal(),
        }
    }
}

#[cfg(unix)]
fn default_completion_signal() -> i32 {
    libc::SIGIO
}

#[cfg(not(unix))]
fn default_completion_signal() -> i32 {
    0
}

impl AioConfig {
    /// Load configuration from `EVAIO_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = env::var("EVAIO_BATCH_CAPACITY") {
            config.batch_capacity =
                val.trim()
                    .parse::<usize>()
                    .map_err(|e| ConfigError::EnvParse {
                        var: "EVAIO_BATCH_CAPACITY",
                        message: e.to_string(),
                    })?;
        }

        if let Ok(val) = env::var("EVAIO_COMPLETION_SIGNAL") {
            config.completion_signal =
                val.trim()
                    .parse::<i32>()
                    .map_err(|e| ConfigError::EnvParse {
                        var: "EVAIO_COMPLETION_SIGNAL",
                        message: e.to_string(),
                    })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that all values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_capacity",
                message: "must be at least 1".into(),
            });
        }
        if self.batch_capacity > MAX_BATCH_CAPACITY {
            return Err(ConfigError::InvalidValue {
                field: "batch_capacity",
                message: format!("must be at most {MAX_BATCH_CAPACITY}"),
            });
        }
        if self.completion_signal <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "completion_signal",
                message: "must be a positive signal number".into(),
            });
        }
        Ok(())
    }

    /// Batch capacity clamped to the POSIX list-submission limit.
    pub(crate) fn listio_capacity(&self) -> usize {
        self.batch_capacity.min(64)
    }
}

/// Configuration validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// An environment variable could not be parsed.
    #[error("failed to parse {var}: {message}")]
    EnvParse {
        /// Name of the offending variable.
        var: &'static str,
        /// Parser error text.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = AioConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_capacity, 64);
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = AioConfig {
            batch_capacity: 0,
            ..AioConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "batch_capacity",
                ..
            })
        ));
    }

    #[test]
    fn oversized_capacity_rejected() {
        let config = AioConfig {
            batch_capacity: MAX_BATCH_CAPACITY + 1,
            ..AioConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn nonpositive_signal_rejected() {
        let config = AioConfig {
            completion_signal: 0,
            ..AioConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_env_reads_overrides() {
        env::set_var("EVAIO_BATCH_CAPACITY", "16");
        let config = AioConfig::from_env().unwrap();
        assert_eq!(config.batch_capacity, 16);

        env::set_var("EVAIO_BATCH_CAPACITY", "not-a-number");
        assert!(matches!(
            AioConfig::from_env(),
            Err(ConfigError::EnvParse { var, .. }) if var == "EVAIO_BATCH_CAPACITY"
        ));
        env::remove_var("EVAIO_BATCH_CAPACITY");
    }

    #[test]
    fn listio_capacity_clamps() {
        let config = AioConfig {
            batch_capacity: 256,
            ..AioConfig::default()
        };
        assert_eq!(config.listio_capacity(), 64);

        let config = AioConfig {
            batch_capacity: 8,
            ..AioConfig::default()
        };
        assert_eq!(config.listio_capacity(), 8);
    }
}
