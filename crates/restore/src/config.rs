//! Restore engine configuration (C14), loaded from `restore.toml`.
//!
//! Same shape as `engine::database::config::StrataConfig`: a
//! `#[serde(default = ...)]` struct, a commented default-TOML template,
//! and `from_file` / `write_default_if_missing` / `write_to_file` helpers
//! so an integrator can drop this next to the node's other config files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Config file name an integrator would typically place this under.
pub const CONFIG_FILE_NAME: &str = "restore.toml";

/// Tunables for the restore engine. Everything here has a sensible
/// default; a node can run with no config file at all.
///
/// # Example
///
/// ```toml
/// # Worker count for the striped executor that replays incremental WAL
/// # entries. Defaults to the number of available CPUs.
/// striped_executor_workers = 8
///
/// # How many groups are staged concurrently during Preload.
/// staging_concurrency = 4
///
/// # Whether to hole-punch trailing zero pages out of staged partition
/// # files for compressed groups.
/// hole_punch_enabled = true
///
/// # Fixed seed for peer-shuffle order when picking a remote source among
/// # several candidates. Leave unset in production so load isn't always
/// # pinned to the same peer ordering.
/// # peer_shuffle_seed = 42
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreConfig {
    /// Worker count for the incremental-apply striped executor.
    #[serde(default = "default_striped_executor_workers")]
    pub striped_executor_workers: usize,
    /// How many groups are staged concurrently during Preload.
    #[serde(default = "default_staging_concurrency")]
    pub staging_concurrency: usize,
    /// Whether staged partition files for compressed groups get their
    /// trailing zero pages hole-punched.
    #[serde(default = "default_hole_punch_enabled")]
    pub hole_punch_enabled: bool,
    /// Fixed seed for the staging planner's peer-shuffle order. `None`
    /// means "seed from the attempt's request id", which varies per
    /// attempt; set this only for deterministic tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_shuffle_seed: Option<u64>,
}

fn default_striped_executor_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn default_staging_concurrency() -> usize {
    4
}

fn default_hole_punch_enabled() -> bool {
    true
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            striped_executor_workers: default_striped_executor_workers(),
            staging_concurrency: default_staging_concurrency(),
            hole_punch_enabled: default_hole_punch_enabled(),
            peer_shuffle_seed: None,
        }
    }
}

/// Errors loading or persisting a `RestoreConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Couldn't read the config file.
    #[error("failed to read restore config file '{path}': {source}")]
    Read {
        /// Path that was read.
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The file's contents weren't valid TOML for this shape.
    #[error("failed to parse restore config file '{path}': {source}")]
    Parse {
        /// Path that was parsed.
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// Couldn't serialize this config back to TOML.
    #[error("failed to serialize restore config: {0}")]
    Serialize(#[from] toml::ser::Error),
    /// Couldn't write the config file.
    #[error("failed to write restore config file '{path}': {source}")]
    Write {
        /// Path that was written.
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl RestoreConfig {
    /// The default config file content, with explanatory comments.
    pub fn default_toml() -> &'static str {
        r#"# Restore engine configuration
#
# Worker count for the striped executor that replays incremental WAL
# entries. Defaults to the number of available CPUs.
# striped_executor_workers = 8

# How many groups are staged concurrently during Preload (default: 4).
staging_concurrency = 4

# Hole-punch trailing zero pages out of staged partition files for
# compressed groups (default: true).
hole_punch_enabled = true

# Fixed seed for peer-shuffle order when picking a remote source among
# several candidates holding the same partition. Leave unset in
# production so load isn't always pinned to the same peer ordering.
# peer_shuffle_seed = 42
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: RestoreConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|source| ConfigError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}
