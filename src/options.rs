//! Database configuration.
//!
//! `Options` can be built in code with the builder setters or loaded from a
//! JSON file; any field missing from the file keeps its default.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Block codec applied to table data blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl CompressionType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    /// Abort recovery on any WAL corruption instead of stopping replay at
    /// the damaged record.
    pub paranoid_checks: bool,
    /// Memtable size at which it is frozen and queued for flush.
    pub max_memtable_bytes: usize,
    /// Size ratio between adjacent levels.
    pub level_fanout: u64,
    /// Target uncompressed size of a table data block.
    pub block_size: usize,
    /// L0 is compacted once it holds more tables than this.
    pub l0_compaction_trigger: usize,
    /// Level n (n >= 1) may hold `base_level_bytes * level_fanout^n` bytes.
    pub base_level_bytes: u64,
    pub max_levels: usize,
    /// Compaction output tables are cut at about this size.
    pub target_file_size: u64,
    pub compression: CompressionType,
    pub bloom_false_positive_rate: f64,
    /// fsync the WAL on every write.
    pub sync_writes: bool,
    /// Run flush and compaction on a background thread. When false they run
    /// inline on the writing thread.
    pub background_work: bool,
    /// Manifest edits appended before the manifest is rewritten as a single
    /// snapshot record.
    pub manifest_snapshot_interval: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            max_memtable_bytes: 4 * 1024 * 1024,
            level_fanout: 10,
            block_size: 4 * 1024,
            l0_compaction_trigger: 4,
            base_level_bytes: 1024 * 1024,
            max_levels: 7,
            target_file_size: 2 * 1024 * 1024,
            compression: CompressionType::Snappy,
            bloom_false_positive_rate: 0.01,
            sync_writes: false,
            background_work: true,
            manifest_snapshot_interval: 64,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let options: Options = serde_json::from_str(&raw)?;
        options.validate()?;
        Ok(options)
    }

    pub fn create_if_missing(mut self, enabled: bool) -> Self {
        self.create_if_missing = enabled;
        self
    }

    pub fn error_if_exists(mut self, enabled: bool) -> Self {
        self.error_if_exists = enabled;
        self
    }

    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.paranoid_checks = enabled;
        self
    }

    pub fn max_memtable_bytes(mut self, bytes: usize) -> Self {
        self.max_memtable_bytes = bytes;
        self
    }

    pub fn level_fanout(mut self, fanout: u64) -> Self {
        self.level_fanout = fanout;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn l0_compaction_trigger(mut self, tables: usize) -> Self {
        self.l0_compaction_trigger = tables;
        self
    }

    pub fn base_level_bytes(mut self, bytes: u64) -> Self {
        self.base_level_bytes = bytes;
        self
    }

    pub fn max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    pub fn target_file_size(mut self, bytes: u64) -> Self {
        self.target_file_size = bytes;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    pub fn background_work(mut self, enabled: bool) -> Self {
        self.background_work = enabled;
        self
    }

    pub fn manifest_snapshot_interval(mut self, edits: usize) -> Self {
        self.manifest_snapshot_interval = edits;
        self
    }

    /// Byte budget of `level` (n >= 1): `base_level_bytes * level_fanout^n`.
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut budget = self.base_level_bytes;
        for _ in 0..level {
            budget = budget.saturating_mul(self.level_fanout);
        }
        budget
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StorageError::InvalidArgument(msg.to_string()));

        if self.max_memtable_bytes == 0 {
            return invalid("max_memtable_bytes must be positive");
        }
        if self.level_fanout < 2 {
            return invalid("level_fanout must be at least 2");
        }
        if self.block_size < 64 {
            return invalid("block_size must be at least 64 bytes");
        }
        if self.l0_compaction_trigger == 0 {
            return invalid("l0_compaction_trigger must be positive");
        }
        if self.max_levels < 2 {
            return invalid("max_levels must be at least 2");
        }
        if self.base_level_bytes == 0 || self.target_file_size == 0 {
            return invalid("level and file sizes must be positive");
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return invalid("bloom_false_positive_rate must be in (0, 1)");
        }
        if self.manifest_snapshot_interval == 0 {
            return invalid("manifest_snapshot_interval must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_level_budget_grows_by_fanout() {
        let options = Options::default().base_level_bytes(1000).level_fanout(10);
        assert_eq!(options.max_bytes_for_level(1), 10_000);
        assert_eq!(options.max_bytes_for_level(2), 100_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Options::default().validate().is_ok());
        assert!(Options::default().level_fanout(1).validate().is_err());
        assert!(Options::default().max_memtable_bytes(0).validate().is_err());
        assert!(Options::default().max_levels(1).validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{ "block_size": 8192, "compression": "None" }"#)?;

        let options = Options::from_json_file(&path)?;
        assert_eq!(options.block_size, 8192);
        assert_eq!(options.compression, CompressionType::None);
        assert_eq!(options.level_fanout, 10);
        assert!(options.create_if_missing);
        Ok(())
    }
}
