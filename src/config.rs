//! Engine configuration.
//!
//! Loaded from TOML or built programmatically with the `with_*` setters.
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::{Error, Result};
use crate::storage::table::DefragPolicy;
use crate::storage::StorageKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Block store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Bytes per block
    pub block_size: usize,

    /// Starting capacity in blocks, also the expansion granularity
    pub initial_block_count: usize,

    /// Backing buffer strategy: "heap", "off_heap" or "mapped_file"
    pub storage_kind: StorageKind,

    /// Directory for the mapped temp file (OS temp dir when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,

    /// Check fragmentation on every n-th deletion; 0 disables the check
    pub defrag_every_deletions: u64,

    /// Deletion-triggered full defrag runs above this fragmentation ratio
    pub full_defrag_threshold: f64,

    /// Simple defrag escalates to a full pass above this ratio
    pub simple_defrag_threshold: f64,

    /// Slots in the diagnostic ring
    pub diagnostics_capacity: usize,
}

pub const DEFAULT_BLOCK_SIZE: usize = 256;
pub const DEFAULT_INITIAL_BLOCK_COUNT: usize = 1024;
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

impl Default for EngineConfig {
    fn default() -> Self {
        let defrag = DefragPolicy::default();
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            initial_block_count: DEFAULT_INITIAL_BLOCK_COUNT,
            storage_kind: StorageKind::default(),
            temp_dir: None,
            defrag_every_deletions: defrag.every_deletions,
            full_defrag_threshold: defrag.full_threshold,
            simple_defrag_threshold: defrag.simple_threshold,
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be greater than 0".to_string()));
        }

        if self.initial_block_count == 0 {
            return Err(Error::Config(
                "initial_block_count must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("full_defrag_threshold", self.full_defrag_threshold),
            ("simple_defrag_threshold", self.simple_defrag_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} ({}) must be between 0 and 1",
                    name, value
                )));
            }
        }

        if self.diagnostics_capacity == 0 || !self.diagnostics_capacity.is_power_of_two() {
            return Err(Error::Config(format!(
                "diagnostics_capacity ({}) must be a positive power of two",
                self.diagnostics_capacity
            )));
        }

        if let Some(ref dir) = self.temp_dir {
            if self.storage_kind == StorageKind::MappedFile && !dir.is_dir() {
                return Err(Error::Config(format!(
                    "temp_dir {} is not a directory",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    pub fn defrag_policy(&self) -> DefragPolicy {
        DefragPolicy {
            every_deletions: self.defrag_every_deletions,
            full_threshold: self.full_defrag_threshold,
            simple_threshold: self.simple_defrag_threshold,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_initial_block_count(mut self, count: usize) -> Self {
        self.initial_block_count = count;
        self
    }

    pub fn with_storage_kind(mut self, kind: StorageKind) -> Self {
        self.storage_kind = kind;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn with_defrag_every_deletions(mut self, every: u64) -> Self {
        self.defrag_every_deletions = every;
        self
    }

    pub fn with_defrag_thresholds(mut self, full: f64, simple: f64) -> Self {
        self.full_defrag_threshold = full;
        self.simple_defrag_threshold = simple;
        self
    }

    pub fn with_diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity;
        self
    }
}
