//! Runtime Configuration
//!
//! Process-wide settings for the emulated accelerators, the background
//! runner and block scheduling. The configuration is read once, either from
//! an explicit [`RuntimeConfig::install`] or lazily from the environment.
//!
//! # Environment
//! - `HETERO_NUM_ACCELERATORS` - number of accelerator devices
//! - `HETERO_ACCELERATOR_MEMORY` - per-device memory budget in bytes
//! - `HETERO_BACKGROUND_THREADS` - cap on live background worker threads
//! - `HETERO_PARALLEL_BLOCK_THRESHOLD` - minimum grid size run in parallel
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::num_cpus;
use crate::error::{Error, Result};

static GLOBAL_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Process-wide runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of accelerator devices exposed by the context factory.
    pub num_accelerators: usize,
    /// Memory budget of each accelerator, in bytes.
    pub accelerator_memory_limit: usize,
    /// Maximum number of live background worker threads.
    pub max_background_threads: usize,
    /// Grids with fewer blocks than this run their blocks sequentially.
    pub parallel_block_threshold: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_accelerators: 1,
            accelerator_memory_limit: 1 << 30,
            max_background_threads: num_cpus(),
            parallel_block_threshold: 16,
        }
    }
}

impl RuntimeConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of accelerator devices.
    pub fn with_num_accelerators(mut self, count: usize) -> Self {
        self.num_accelerators = count;
        self
    }

    /// Sets the per-device memory budget.
    pub fn with_accelerator_memory_limit(mut self, bytes: usize) -> Self {
        self.accelerator_memory_limit = bytes;
        self
    }

    /// Sets the background thread cap.
    pub fn with_max_background_threads(mut self, threads: usize) -> Self {
        self.max_background_threads = threads;
        self
    }

    /// Sets the minimum grid size for parallel block execution.
    pub fn with_parallel_block_threshold(mut self, blocks: usize) -> Self {
        self.parallel_block_threshold = blocks;
        self
    }

    /// Checks that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if i32::try_from(self.num_accelerators).is_err() {
            return Err(Error::invalid_config(format!(
                "num_accelerators {} does not fit a device id",
                self.num_accelerators
            )));
        }
        if self.max_background_threads == 0 {
            return Err(Error::invalid_config("max_background_threads must be at least 1"));
        }
        if self.parallel_block_threshold == 0 {
            return Err(Error::invalid_config("parallel_block_threshold must be at least 1"));
        }
        Ok(())
    }

    /// Builds a configuration from the default overlaid with `HETERO_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from the default overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<usize>> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<usize>()
                    .map(Some)
                    .map_err(|e| Error::invalid_config(format!("{key}={raw:?}: {e}"))),
                None => Ok(None),
            }
        };

        let mut config = Self::default();
        if let Some(count) = parse("HETERO_NUM_ACCELERATORS")? {
            config.num_accelerators = count;
        }
        if let Some(bytes) = parse("HETERO_ACCELERATOR_MEMORY")? {
            config.accelerator_memory_limit = bytes;
        }
        if let Some(threads) = parse("HETERO_BACKGROUND_THREADS")? {
            config.max_background_threads = threads;
        }
        if let Some(blocks) = parse("HETERO_PARALLEL_BLOCK_THRESHOLD")? {
            config.parallel_block_threshold = blocks;
        }
        config.validate()?;
        Ok(config)
    }

    /// Installs this configuration as the process-wide one.
    ///
    /// Fails if a configuration was already installed or read.
    pub fn install(self) -> Result<()> {
        self.validate()?;
        GLOBAL_CONFIG
            .set(self)
            .map_err(|_| Error::invalid_config("runtime configuration is already initialized"))
    }

    /// Returns the process-wide configuration.
    pub fn global() -> &'static Self {
        GLOBAL_CONFIG.get_or_init(|| {
            Self::from_env().unwrap_or_else(|err| {
                warn!(%err, "ignoring runtime configuration from environment");
                Self::default()
            })
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_accelerators, 1);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .with_num_accelerators(4)
            .with_accelerator_memory_limit(4096)
            .with_max_background_threads(2)
            .with_parallel_block_threshold(8);
        assert_eq!(config.num_accelerators, 4);
        assert_eq!(config.accelerator_memory_limit, 4096);
        assert_eq!(config.max_background_threads, 2);
        assert_eq!(config.parallel_block_threshold, 8);
    }

    #[test]
    fn test_from_lookup_overlays_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("HETERO_NUM_ACCELERATORS", "2"),
            ("HETERO_ACCELERATOR_MEMORY", " 65536 "),
        ]))
        .unwrap();
        assert_eq!(config.num_accelerators, 2);
        assert_eq!(config.accelerator_memory_limit, 65536);
        assert_eq!(config.parallel_block_threshold, 16);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = RuntimeConfig::from_lookup(lookup(&[("HETERO_BACKGROUND_THREADS", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));

        let err = RuntimeConfig::from_lookup(lookup(&[("HETERO_BACKGROUND_THREADS", "0")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_install_after_global_is_rejected() {
        let current = RuntimeConfig::global();
        assert!(current.validate().is_ok());

        let err = RuntimeConfig::new()
            .with_num_accelerators(current.num_accelerators + 1)
            .install()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
        assert_eq!(RuntimeConfig::global(), current);

        let err = RuntimeConfig::new()
            .with_max_background_threads(0)
            .install()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"num_accelerators": 3}"#).unwrap();
        assert_eq!(config.num_accelerators, 3);
        assert_eq!(config.parallel_block_threshold, 16);
    }
}
