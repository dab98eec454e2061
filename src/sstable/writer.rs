//! Streams sorted entries into a new table file.

use super::block::BlockBuilder;
use super::bloom::KeyFilter;
use super::format::{seal_block, BlockHandle, Footer, IndexEntry, TableMeta};
use super::TableConfig;
use crate::options::CompressionType;
use crate::{Entry, InternalKey, Key, Result, SequenceNumber, StorageError};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct SsTableWriter {
    path: PathBuf,
    id: u64,
    writer: BufWriter<File>,
    config: TableConfig,
    block: BlockBuilder,
    index: Vec<IndexEntry>,
    /// Distinct user keys, hashed into the filter at finish time.
    filter_keys: Vec<Key>,
    offset: u64,
    entry_count: u64,
    tombstone_count: u64,
    last_key: Option<InternalKey>,
    smallest_key: Option<Key>,
    min_sequence: SequenceNumber,
    max_sequence: SequenceNumber,
}

impl SsTableWriter {
    pub fn new(path: impl AsRef<Path>, id: u64, config: TableConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(SsTableWriter {
            path,
            id,
            writer: BufWriter::new(file),
            block: BlockBuilder::new(config.block_size),
            config,
            index: Vec::new(),
            filter_keys: Vec::new(),
            offset: 0,
            entry_count: 0,
            tombstone_count: 0,
            last_key: None,
            smallest_key: None,
            min_sequence: SequenceNumber::MAX,
            max_sequence: 0,
        })
    }

    /// Append an entry. Entries must arrive in strictly increasing
    /// internal-key order.
    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        let internal = entry.internal_key();
        if let Some(last) = &self.last_key {
            if internal <= *last {
                return Err(StorageError::InvariantViolation(format!(
                    "table {} received key {:?}@{} after {:?}@{}",
                    self.id,
                    String::from_utf8_lossy(&internal.user_key),
                    internal.sequence,
                    String::from_utf8_lossy(&last.user_key),
                    last.sequence
                )));
            }
        }

        let new_user_key = self
            .last_key
            .as_ref()
            .map_or(true, |last| last.user_key != entry.key);
        if new_user_key {
            self.filter_keys.push(entry.key.clone());
        }
        if self.smallest_key.is_none() {
            self.smallest_key = Some(entry.key.clone());
        }

        self.block.add(entry);
        self.entry_count += 1;
        if entry.is_tombstone() {
            self.tombstone_count += 1;
        }
        self.min_sequence = self.min_sequence.min(entry.sequence);
        self.max_sequence = self.max_sequence.max(entry.sequence);
        self.last_key = Some(internal);

        if self.block.size() >= self.config.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Last internal key added, if any.
    pub fn last_key(&self) -> Option<&InternalKey> {
        self.last_key.as_ref()
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Bytes written so far plus the pending block.
    pub fn estimated_file_size(&self) -> u64 {
        self.offset + self.block.size() as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let (first_key, raw) = self.block.finish();
        let first_key = first_key.ok_or_else(|| {
            StorageError::InvariantViolation("non-empty block without a first key".into())
        })?;
        let handle = self.write_sealed(&raw, self.config.compression)?;
        self.index.push(IndexEntry { first_key, handle });
        Ok(())
    }

    fn write_sealed(&mut self, raw: &[u8], compression: CompressionType) -> Result<BlockHandle> {
        let sealed = seal_block(raw, compression)?;
        self.writer.write_all(&sealed)?;
        let handle = BlockHandle {
            offset: self.offset,
            size: sealed.len() as u64,
        };
        self.offset += sealed.len() as u64;
        Ok(handle)
    }

    /// Write filter, properties, index and footer, then fsync. An empty
    /// table is refused and its file removed.
    pub fn finish(mut self) -> Result<TableMeta> {
        match self.write_tail() {
            Ok(meta) => {
                debug!(
                    table = meta.id,
                    entries = meta.entry_count,
                    bytes = meta.file_size,
                    "finished table"
                );
                Ok(meta)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&self.path);
                Err(e)
            }
        }
    }

    fn write_tail(&mut self) -> Result<TableMeta> {
        let (smallest_key, largest_key) = match (&self.smallest_key, &self.last_key) {
            (Some(smallest), Some(last)) => (smallest.clone(), last.user_key.clone()),
            _ => {
                return Err(StorageError::InvariantViolation(format!(
                    "table {} has no entries",
                    self.id
                )))
            }
        };
        self.flush_block()?;

        let mut filter =
            KeyFilter::new(self.filter_keys.len(), self.config.bloom_false_positive_rate);
        for key in &self.filter_keys {
            filter.insert(key);
        }
        let filter_handle = self.write_sealed(&filter.to_bytes()?, CompressionType::None)?;

        let mut meta = TableMeta {
            id: self.id,
            file_size: 0,
            entry_count: self.entry_count,
            tombstone_count: self.tombstone_count,
            smallest_key,
            largest_key,
            min_sequence: self.min_sequence,
            max_sequence: self.max_sequence,
        };
        let props_handle = self.write_sealed(&bincode::serialize(&meta)?, CompressionType::None)?;
        let index_bytes = bincode::serialize(&self.index)?;
        let index_handle = self.write_sealed(&index_bytes, self.config.compression)?;

        let footer = Footer {
            filter: filter_handle,
            properties: props_handle,
            index: index_handle,
        }
        .encode();
        self.writer.write_all(&footer)?;
        self.offset += footer.len() as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        meta.file_size = self.offset;
        Ok(meta)
    }

    /// Drop a partially written table.
    pub fn abandon(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }
}
