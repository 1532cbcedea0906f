//! Stage configuration surface
//!
//! One flat set of recognised options shared by the concurrency-bearing
//! stages. Each stage reads the options that concern it and ignores the rest.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options recognised by the prefetch, parallel map and cache stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageConfig {
    /// Worker pool size for parallel map; `None` means available parallelism
    pub workers: Option<usize>,

    /// Whether parallel map releases results in input order
    pub ordered: bool,

    /// Lookahead depth of the prefetch queue
    pub prefetch_depth: usize,

    /// Root directory of the persistent cache
    pub cache_path: Option<PathBuf>,

    /// Purge the cache root when the store is opened
    pub cache_clear: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            workers: None,
            ordered: true,
            prefetch_depth: 1,
            cache_path: None,
            cache_clear: false,
        }
    }
}

impl StageConfig {
    /// Parse a configuration from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check option ranges
    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(Error::InvalidArgument("workers must be at least 1".into()));
        }
        if self.prefetch_depth == 0 {
            return Err(Error::InvalidArgument("prefetch_depth must be at least 1".into()));
        }
        Ok(())
    }

    /// Set the worker pool size
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set the ordering mode
    #[must_use]
    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Set the prefetch depth
    #[must_use]
    pub fn with_prefetch_depth(mut self, depth: usize) -> Self {
        self.prefetch_depth = depth;
        self
    }

    /// Set the cache root
    #[must_use]
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Clear the cache when it is opened
    #[must_use]
    pub fn with_cache_clear(mut self, clear: bool) -> Self {
        self.cache_clear = clear;
        self
    }
}
