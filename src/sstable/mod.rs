//! SSTable (Sorted String Table) implementation
//!
//! Immutable files of entries sorted by internal key, with a sparse block
//! index and a bloom filter over user keys. Tables are written once by a
//! flush or a compaction and deleted when no version references them.

pub mod block;
pub mod bloom;
pub mod format;
pub mod reader;
pub mod writer;

pub use format::{TableMeta, DEFAULT_BLOCK_SIZE};
pub use reader::{SsTableReader, TableIterator};
pub use writer::SsTableWriter;

use crate::options::{CompressionType, Options};
use std::path::{Path, PathBuf};

/// Settings a writer needs, taken from the database options.
#[derive(Debug, Clone, Copy)]
pub struct TableConfig {
    pub block_size: usize,
    pub compression: CompressionType,
    pub bloom_false_positive_rate: f64,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            compression: CompressionType::Snappy,
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl From<&Options> for TableConfig {
    fn from(options: &Options) -> Self {
        TableConfig {
            block_size: options.block_size,
            compression: options.compression,
            bloom_false_positive_rate: options.bloom_false_positive_rate,
        }
    }
}

pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", id))
}

/// Parse a table id out of a `NNNNNN.sst` file name.
pub fn parse_table_id(path: &Path) -> Option<u64> {
    if path.extension().and_then(|s| s.to_str()) != Some("sst") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Entry, KeyRange, Result, StorageError, MAX_SEQUENCE};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn small_blocks() -> TableConfig {
        TableConfig {
            block_size: 128,
            ..TableConfig::default()
        }
    }

    fn write_table(dir: &Path, entries: &[Entry], config: TableConfig) -> Result<TableMeta> {
        let mut writer = SsTableWriter::new(table_path(dir, 1), 1, config)?;
        for entry in entries {
            writer.add(entry)?;
        }
        writer.finish()
    }

    #[test]
    fn test_write_then_point_lookups() -> Result<()> {
        let dir = tempdir()?;
        let entries: Vec<Entry> = (0..500)
            .map(|i| Entry::put(format!("key_{:04}", i).into_bytes(), vec![b'v'; 20], i + 1))
            .collect();
        let meta = write_table(dir.path(), &entries, small_blocks())?;
        assert_eq!(meta.entry_count, 500);
        assert_eq!(meta.smallest_key, b"key_0000");
        assert_eq!(meta.largest_key, b"key_0499");
        assert_eq!((meta.min_sequence, meta.max_sequence), (1, 500));

        let reader = SsTableReader::open(table_path(dir.path(), 1))?;
        assert!(reader.block_count() > 1);
        assert_eq!(reader.info().file_size, meta.file_size);

        for i in [0u64, 1, 250, 499] {
            let key = format!("key_{:04}", i).into_bytes();
            let found = reader.get(&key, MAX_SEQUENCE)?.expect("key present");
            assert_eq!(found.sequence, i + 1);
        }
        assert!(reader.get(b"key_9999", MAX_SEQUENCE)?.is_none());
        assert!(reader.get(b"aaa", MAX_SEQUENCE)?.is_none());
        Ok(())
    }

    #[test]
    fn test_versions_across_blocks_respect_snapshot() -> Result<()> {
        let dir = tempdir()?;
        // Many versions of one key so they span several blocks.
        let mut entries: Vec<Entry> = (1..=50u64)
            .rev()
            .map(|seq| Entry::put(b"hot".to_vec(), format!("v{}", seq).into_bytes(), seq))
            .collect();
        entries.push(Entry::tombstone(b"zzz".to_vec(), 60));
        write_table(dir.path(), &entries, small_blocks())?;

        let reader = SsTableReader::open(table_path(dir.path(), 1))?;
        assert_eq!(reader.get(b"hot", MAX_SEQUENCE)?.unwrap().sequence, 50);
        assert_eq!(reader.get(b"hot", 7)?.unwrap().value, Some(b"v7".to_vec()));
        assert!(reader.get(b"hot", 0)?.is_none());
        assert!(reader.get(b"zzz", MAX_SEQUENCE)?.unwrap().is_tombstone());
        Ok(())
    }

    #[test]
    fn test_range_iteration() -> Result<()> {
        let dir = tempdir()?;
        let entries: Vec<Entry> = (0..100)
            .map(|i| Entry::put(format!("k{:03}", i).into_bytes(), b"x".to_vec(), 1))
            .collect();
        write_table(dir.path(), &entries, small_blocks())?;
        let reader = Arc::new(SsTableReader::open(table_path(dir.path(), 1))?);

        let keys: Vec<_> = reader
            .iter(KeyRange::new(b"k010", b"k020"))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys.len(), 10);
        assert_eq!(keys[0], b"k010");
        assert_eq!(keys[9], b"k019");

        assert_eq!(reader.iter(KeyRange::all()).count(), 100);
        Ok(())
    }

    #[test]
    fn test_out_of_order_add_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let mut writer = SsTableWriter::new(table_path(dir.path(), 1), 1, TableConfig::default())?;
        writer.add(&Entry::put(b"b".to_vec(), b"1".to_vec(), 1))?;

        let err = writer.add(&Entry::put(b"a".to_vec(), b"1".to_vec(), 2)).unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
        // Same key, same sequence is not strictly increasing either.
        assert!(writer.add(&Entry::put(b"b".to_vec(), b"2".to_vec(), 1)).is_err());
        writer.abandon()?;
        assert!(!table_path(dir.path(), 1).exists());
        Ok(())
    }

    #[test]
    fn test_empty_table_is_refused() -> Result<()> {
        let dir = tempdir()?;
        let writer = SsTableWriter::new(table_path(dir.path(), 1), 1, TableConfig::default())?;
        assert!(writer.finish().is_err());
        assert!(!table_path(dir.path(), 1).exists());
        Ok(())
    }

    #[test]
    fn test_corrupted_block_is_detected() -> Result<()> {
        let dir = tempdir()?;
        let config = TableConfig {
            compression: CompressionType::None,
            ..TableConfig::default()
        };
        let entries = vec![Entry::put(b"key".to_vec(), b"value".to_vec(), 1)];
        write_table(dir.path(), &entries, config)?;

        let path = table_path(dir.path(), 1);
        let mut data = std::fs::read(&path)?;
        data[2] ^= 0xFF;
        std::fs::write(&path, &data)?;

        let reader = SsTableReader::open(&path)?;
        let err = reader.get(b"key", MAX_SEQUENCE).unwrap_err();
        assert!(err.is_corruption());
        Ok(())
    }

    #[test]
    fn test_truncated_file_fails_to_open() -> Result<()> {
        let dir = tempdir()?;
        let path = table_path(dir.path(), 1);
        std::fs::write(&path, b"short")?;
        assert!(SsTableReader::open(&path).unwrap_err().is_corruption());
        assert_eq!(parse_table_id(&path), Some(1));
        Ok(())
    }

    #[test]
    fn test_overflowing_footer_handle_is_corruption() -> Result<()> {
        use super::format::{BlockHandle, Footer};

        let dir = tempdir()?;
        let path = table_path(dir.path(), 1);
        let footer = Footer {
            filter: BlockHandle {
                offset: u64::MAX,
                size: 16,
            },
            properties: BlockHandle { offset: 0, size: 0 },
            index: BlockHandle { offset: 0, size: 0 },
        };
        std::fs::write(&path, footer.encode())?;

        assert!(SsTableReader::open(&path).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn test_footer_handle_past_data_is_corruption() -> Result<()> {
        use super::format::{BlockHandle, Footer};

        let dir = tempdir()?;
        let path = table_path(dir.path(), 1);
        let mut data = vec![0u8; 32];
        let footer = Footer {
            filter: BlockHandle { offset: 0, size: 16 },
            properties: BlockHandle { offset: 16, size: 16 },
            index: BlockHandle { offset: 24, size: 1 << 40 },
        };
        data.extend_from_slice(&footer.encode());
        std::fs::write(&path, &data)?;

        assert!(SsTableReader::open(&path).unwrap_err().is_corruption());
        Ok(())
    }
}
