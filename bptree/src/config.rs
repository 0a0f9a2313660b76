//! Tree and engine configuration.
//!
//! Tuning parameters can be supplied in code or loaded from environment
//! variables. Every variable is optional; unset variables fall back to the
//! defaults below.
//!
//! # Environment Variables
//!
//! - `BPTREE_MAX_ENTRIES_PER_NODE`: entries per node/leaf (default: `255`, range 3-255)
//! - `BPTREE_FILL_FACTOR`: percentage to fill leaves on build (default: `95`, range 1-100)
//! - `BPTREE_FREE_SPACE_PERCENT`: trailing free space reserved on build (default: `10`)
//! - `BPTREE_LOCK_TIMEOUT_MS`: lock acquisition timeout (default: `60000`)
//! - `BPTREE_AUTO_GROW`: allow mutations to extend the tree (default: `true`)
//! - `BPTREE_REBUILD_THRESHOLD`: reclaimable fraction that suggests a rebuild (default: `0.5`)
//!
//! # Invariants
//!
//! - `max_entries_per_node` is at least 3, so a full node can always split
//!   into two non-empty halves around a separator.
//! - `fill_factor` is a percentage in 1-100.
//! - `rebuild_threshold` is in (0, 1].

#![allow(clippy::cast_possible_truncation)]

use std::time::Duration;

/// Default maximum entries per node or leaf.
pub const DEFAULT_MAX_ENTRIES_PER_NODE: u8 = 255;
/// Default leaf fill percentage used by builds and end-of-tree splits.
pub const DEFAULT_FILL_FACTOR: u8 = 95;
/// Default trailing free space, as a percentage of the built tree.
pub const DEFAULT_FREE_SPACE_PERCENT: u8 = 10;
/// Default lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
/// Default reclaimable fraction above which a rebuild is suggested.
pub const DEFAULT_REBUILD_THRESHOLD: f64 = 0.5;
/// Default read chunk size of the traversal cache.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Smallest accepted `max_entries_per_node`.
pub const MIN_ENTRIES_PER_NODE: u8 = 3;

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.into(),
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| invalid(name, format!("'{value}' could not be parsed"))),
        None => Ok(default),
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Shape of a tree: key uniqueness, metadata and node sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeOptions {
    /// Each key holds exactly one value.
    pub unique: bool,
    /// Maximum entries per node and per leaf.
    pub max_entries_per_node: u8,
    /// Percentage of `max_entries_per_node` to fill leaves with on build.
    pub fill_factor: u8,
    /// Trailing free space reserved on build, as a percentage of the tree.
    pub free_space_percent: u8,
    /// Names of the metadata keys every value carries, in storage order.
    pub metadata_keys: Vec<String>,
}

impl TreeOptions {
    /// Options with default sizing.
    #[must_use]
    pub const fn new(unique: bool) -> Self {
        Self {
            unique,
            max_entries_per_node: DEFAULT_MAX_ENTRIES_PER_NODE,
            fill_factor: DEFAULT_FILL_FACTOR,
            free_space_percent: DEFAULT_FREE_SPACE_PERCENT,
            metadata_keys: Vec::new(),
        }
    }

    /// Options with sizing loaded from the environment.
    pub fn from_env(unique: bool) -> Result<Self, ConfigError> {
        Self::from_lookup(unique, env_lookup)
    }

    fn from_lookup(
        unique: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let options = Self {
            max_entries_per_node: parse_var(
                &lookup,
                "BPTREE_MAX_ENTRIES_PER_NODE",
                DEFAULT_MAX_ENTRIES_PER_NODE,
            )?,
            fill_factor: parse_var(&lookup, "BPTREE_FILL_FACTOR", DEFAULT_FILL_FACTOR)?,
            free_space_percent: parse_var(
                &lookup,
                "BPTREE_FREE_SPACE_PERCENT",
                DEFAULT_FREE_SPACE_PERCENT,
            )?,
            ..Self::new(unique)
        };
        options.validate()?;
        Ok(options)
    }

    #[must_use]
    pub const fn with_max_entries_per_node(mut self, max: u8) -> Self {
        self.max_entries_per_node = max;
        self
    }

    #[must_use]
    pub const fn with_fill_factor(mut self, fill_factor: u8) -> Self {
        self.fill_factor = fill_factor;
        self
    }

    #[must_use]
    pub const fn with_free_space_percent(mut self, percent: u8) -> Self {
        self.free_space_percent = percent;
        self
    }

    #[must_use]
    pub fn with_metadata_keys(mut self, names: &[&str]) -> Self {
        self.metadata_keys = names.iter().map(ToString::to_string).collect();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries_per_node < MIN_ENTRIES_PER_NODE {
            return Err(invalid(
                "max_entries_per_node",
                format!(
                    "{} is below the minimum of {MIN_ENTRIES_PER_NODE}",
                    self.max_entries_per_node
                ),
            ));
        }
        if !(1..=100).contains(&self.fill_factor) {
            return Err(invalid(
                "fill_factor",
                format!("{} is not a percentage in 1-100", self.fill_factor),
            ));
        }
        if self.free_space_percent > 100 {
            return Err(invalid(
                "free_space_percent",
                format!("{} is not a percentage in 0-100", self.free_space_percent),
            ));
        }
        if self.metadata_keys.len() > usize::from(u8::MAX) {
            return Err(invalid("metadata_keys", "at most 255 metadata keys"));
        }
        if let Some(name) = self
            .metadata_keys
            .iter()
            .find(|n| n.is_empty() || n.len() > usize::from(u8::MAX))
        {
            return Err(invalid(
                "metadata_keys",
                format!("name {name:?} must be 1-255 bytes"),
            ));
        }
        Ok(())
    }

    /// Entries a builder places in each leaf.
    #[must_use]
    pub fn entries_per_leaf(&self) -> usize {
        (usize::from(self.max_entries_per_node) * usize::from(self.fill_factor) / 100).max(1)
    }
}

/// Runtime behaviour of a [`crate::tree::BinaryTree`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How long to wait for the tree lock before failing.
    pub lock_timeout: Duration,
    /// Extend the tree's byte range when free space runs out.
    pub auto_grow: bool,
    /// Reclaimable fraction of the tree above which a rebuild is suggested.
    pub rebuild_threshold: f64,
    /// Read granularity of the per-operation read cache.
    pub read_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            auto_grow: true,
            rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout_ms = parse_var(
            &lookup,
            "BPTREE_LOCK_TIMEOUT_MS",
            defaults.lock_timeout.as_millis() as u64,
        )?;
        let config = Self {
            lock_timeout: Duration::from_millis(timeout_ms),
            auto_grow: parse_var(&lookup, "BPTREE_AUTO_GROW", defaults.auto_grow)?,
            rebuild_threshold: parse_var(
                &lookup,
                "BPTREE_REBUILD_THRESHOLD",
                defaults.rebuild_threshold,
            )?,
            read_chunk_size: defaults.read_chunk_size,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rebuild_threshold > 0.0 && self.rebuild_threshold <= 1.0) {
            return Err(invalid(
                "rebuild_threshold",
                format!("{} is not in (0, 1]", self.rebuild_threshold),
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(invalid("read_chunk_size", "must be positive"));
        }
        Ok(())
    }
}
