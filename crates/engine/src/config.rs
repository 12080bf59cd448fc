//! Engine configuration via `mvstm.toml`
//!
//! A directory opened with [`Stm::open`](crate::Stm::open) gets a default
//! `mvstm.toml` on first use. To change settings, edit the file and reopen.

use mvstm_concurrency::TrunkConfig;
use mvstm_core::{Granularity, StmError, StmResult};
use mvstm_durability::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "mvstm.toml";

/// Engine configuration loaded from `mvstm.toml`.
///
/// # Example
///
/// ```toml
/// granularity = "all"
/// dispatcher = "pooled"
/// worker_threads = 4
/// durability = "standard"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StmConfig {
    /// Notification cadence of new trunks: `"all"` or `"coalesce"`.
    #[serde(default = "default_granularity_str")]
    pub granularity: String,
    /// Where listener callbacks and async commits run: `"inline"` or `"pooled"`.
    #[serde(default = "default_dispatcher_str")]
    pub dispatcher: String,
    /// Worker threads of the pooled dispatcher.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Queued tasks the pooled dispatcher accepts before refusing more.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Snapshot length above which acknowledged maps are folded.
    #[serde(default = "default_trim_threshold")]
    pub trim_threshold: usize,
    /// Publish attempts per commit before giving up.
    #[serde(default = "default_max_publish_retries")]
    pub max_publish_retries: u32,
    /// `"cache"`, `"standard"` or `"always"`.
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Deliver notifications in separate batches per writer.
    #[serde(default)]
    pub merge_by_source: bool,
}

fn default_granularity_str() -> String {
    "all".to_string()
}

fn default_dispatcher_str() -> String {
    "pooled".to_string()
}

fn default_worker_threads() -> usize {
    4
}

fn default_max_queue_depth() -> usize {
    4096
}

fn default_trim_threshold() -> usize {
    mvstm_concurrency::DEFAULT_TRIM_THRESHOLD
}

fn default_max_publish_retries() -> u32 {
    mvstm_concurrency::DEFAULT_MAX_PUBLISH_RETRIES
}

fn default_durability_str() -> String {
    "standard".to_string()
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            granularity: default_granularity_str(),
            dispatcher: default_dispatcher_str(),
            worker_threads: default_worker_threads(),
            max_queue_depth: default_max_queue_depth(),
            trim_threshold: default_trim_threshold(),
            max_publish_retries: default_max_publish_retries(),
            durability: default_durability_str(),
            merge_by_source: false,
        }
    }
}

/// Dispatcher choice parsed from the config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherKind {
    /// Run on the calling thread
    Inline,
    /// Run on a worker pool
    Pooled,
}

impl StmConfig {
    /// Configuration for tests and embedded use: inline callbacks, no store.
    pub fn in_memory() -> Self {
        Self {
            dispatcher: "inline".to_string(),
            durability: "cache".to_string(),
            ..Self::default()
        }
    }

    /// Parse the granularity string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"all"` or `"coalesce"`.
    pub fn granularity_mode(&self) -> StmResult<Granularity> {
        self.granularity.parse().map_err(|e: String| {
            StmError::invalid_input(format!("{} in {}", e, CONFIG_FILE_NAME))
        })
    }

    /// Parse the durability string into a `DurabilityMode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"cache"`, `"standard"` or `"always"`.
    pub fn durability_mode(&self) -> StmResult<DurabilityMode> {
        match self.durability.as_str() {
            "cache" => Ok(DurabilityMode::Cache),
            "standard" => Ok(DurabilityMode::standard_default()),
            "always" => Ok(DurabilityMode::Always),
            other => Err(StmError::invalid_input(format!(
                "Invalid durability mode '{}' in {}. Expected \"cache\", \"standard\" or \"always\".",
                other, CONFIG_FILE_NAME
            ))),
        }
    }

    /// Parse the dispatcher string.
    pub fn dispatcher_kind(&self) -> StmResult<DispatcherKind> {
        match self.dispatcher.as_str() {
            "inline" => Ok(DispatcherKind::Inline),
            "pooled" => Ok(DispatcherKind::Pooled),
            other => Err(StmError::invalid_input(format!(
                "Invalid dispatcher '{}' in {}. Expected \"inline\" or \"pooled\".",
                other, CONFIG_FILE_NAME
            ))),
        }
    }

    /// Check every field.
    pub fn validate(&self) -> StmResult<()> {
        self.granularity_mode()?;
        self.durability_mode()?;
        self.dispatcher_kind()?;
        if self.worker_threads == 0 {
            return Err(StmError::invalid_input("worker_threads must be at least 1"));
        }
        if self.trim_threshold < 2 {
            return Err(StmError::invalid_input("trim_threshold must be at least 2"));
        }
        if self.max_publish_retries == 0 {
            return Err(StmError::invalid_input(
                "max_publish_retries must be at least 1",
            ));
        }
        Ok(())
    }

    /// Settings for a trunk created under this config.
    pub fn trunk_config(&self) -> StmResult<TrunkConfig> {
        Ok(TrunkConfig {
            granularity: self.granularity_mode()?,
            max_publish_retries: self.max_publish_retries,
            trim_threshold: self.trim_threshold,
        })
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# mvstm configuration
#
# Notification cadence of new trunks: "all" (default) or "coalesce"
#   "all"      = one callback per committed change, with that commit's value
#   "coalesce" = at most one callback per slot per walk, latest acknowledged value
granularity = "all"

# Where listener callbacks and async commits run: "pooled" (default) or "inline"
dispatcher = "pooled"
worker_threads = 4
max_queue_depth = 4096

# Snapshot length above which acknowledged maps are folded into the base
trim_threshold = 32

# Publish attempts per commit before it fails with PublishContention
max_publish_retries = 64

# Durability mode: "standard" (default), "always" or "cache"
#   "standard" = periodic fsync (~100ms), may lose last interval on crash
#   "always"   = fsync every acknowledged commit
#   "cache"    = nothing written to disk
durability = "standard"

# Deliver notifications in separate batches per writer
merge_by_source = false
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or holds an
    /// invalid value.
    pub fn from_file(path: &Path) -> StmResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StmError::internal(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: StmConfig = toml::from_str(&content).map_err(|e| {
            StmError::invalid_input(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> StmResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                StmError::internal(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> StmResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StmError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            StmError::internal(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
