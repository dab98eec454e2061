//! Point lookups and range iteration over a finished table.
//!
//! The index, filter and properties are loaded at open; data blocks are
//! read from disk on demand.

use super::block::decode_block;
use super::bloom::KeyFilter;
use super::format::{open_block, BlockHandle, Footer, IndexEntry, TableMeta, FOOTER_SIZE};
use crate::{Entry, InternalKey, KeyRange, Result, SequenceNumber, StorageError};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
pub struct SsTableReader {
    path: PathBuf,
    file: Mutex<File>,
    meta: TableMeta,
    index: Vec<IndexEntry>,
    filter: KeyFilter,
}

impl SsTableReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < FOOTER_SIZE as u64 {
            return Err(StorageError::Corruption(format!(
                "table {:?} is too small ({} bytes)",
                path, file_size
            )));
        }

        let mut footer_bytes = vec![0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(file_size - FOOTER_SIZE as u64))?;
        file.read_exact(&mut footer_bytes)?;
        let footer = Footer::decode(&footer_bytes)?;

        let data_end = file_size - FOOTER_SIZE as u64;
        for handle in [&footer.filter, &footer.properties, &footer.index] {
            check_handle(handle, data_end, &path)?;
        }

        let filter = KeyFilter::from_bytes(&read_block_at(&mut file, &footer.filter, "filter")?)?;
        let mut meta: TableMeta =
            bincode::deserialize(&read_block_at(&mut file, &footer.properties, "properties")?)?;
        meta.file_size = file_size;
        let index: Vec<IndexEntry> =
            bincode::deserialize(&read_block_at(&mut file, &footer.index, "index")?)?;

        if index.is_empty() {
            return Err(StorageError::Corruption(format!(
                "table {:?} has an empty index",
                path
            )));
        }
        for entry in &index {
            check_handle(&entry.handle, footer.filter.offset, &path)?;
        }

        Ok(SsTableReader {
            path,
            file: Mutex::new(file),
            meta,
            index,
            filter,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &TableMeta {
        &self.meta
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// False means `key` is definitely not in this table.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.meta.covers(key) && self.filter.may_contain(key)
    }

    /// Newest version of `key` with sequence <= `snapshot`, tombstones
    /// included.
    pub fn get(&self, key: &[u8], snapshot: SequenceNumber) -> Result<Option<Entry>> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        self.search(key, snapshot)
    }

    /// Block search without consulting the filter.
    pub(crate) fn search(&self, key: &[u8], snapshot: SequenceNumber) -> Result<Option<Entry>> {
        let target = InternalKey::new(key.to_vec(), snapshot);
        let start = self.first_block_for(&target);

        // Versions of one key may straddle a block boundary.
        for block in start..self.index.len() {
            for entry in self.read_block(block)? {
                match entry.key.as_slice().cmp(key) {
                    Ordering::Less => continue,
                    Ordering::Greater => return Ok(None),
                    Ordering::Equal if entry.sequence <= snapshot => return Ok(Some(entry)),
                    Ordering::Equal => continue,
                }
            }
        }
        Ok(None)
    }

    /// Last block whose first key is <= `target`.
    fn first_block_for(&self, target: &InternalKey) -> usize {
        self.index
            .partition_point(|entry| entry.first_key <= *target)
            .saturating_sub(1)
    }

    pub fn read_block(&self, block: usize) -> Result<Vec<Entry>> {
        let handle = self.index.get(block).map(|e| e.handle).ok_or_else(|| {
            StorageError::InvalidArgument(format!("block {} out of range", block))
        })?;
        let raw = {
            let mut file = self.file.lock();
            read_block_at(&mut file, &handle, "data")?
        };
        decode_block(&raw)
    }

    /// Lazy iterator over every version inside `range`.
    pub fn iter(self: &Arc<Self>, range: KeyRange) -> TableIterator {
        let next_block = match range.seek_key() {
            Some(seek) => self.first_block_for(&seek),
            None => 0,
        };
        TableIterator {
            table: Arc::clone(self),
            range,
            next_block,
            current: Vec::new().into_iter(),
            done: false,
        }
    }
}

/// A handle must lie entirely below `limit`.
fn check_handle(handle: &BlockHandle, limit: u64, path: &Path) -> Result<()> {
    match handle.offset.checked_add(handle.size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(StorageError::Corruption(format!(
            "block handle {}+{} out of bounds in {:?}",
            handle.offset, handle.size, path
        ))),
    }
}

fn read_block_at(file: &mut File, handle: &BlockHandle, what: &str) -> Result<Vec<u8>> {
    let mut sealed = vec![0u8; handle.size as usize];
    file.seek(SeekFrom::Start(handle.offset))?;
    file.read_exact(&mut sealed)?;
    open_block(&sealed, what)
}

/// Entries of one table in internal-key order. A read error is yielded
/// once and ends the iteration.
pub struct TableIterator {
    table: Arc<SsTableReader>,
    range: KeyRange,
    next_block: usize,
    current: std::vec::IntoIter<Entry>,
    done: bool,
}

impl Iterator for TableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        while !self.done {
            if let Some(entry) = self.current.next() {
                if self.range.is_past_end(&entry.key) {
                    self.done = true;
                    return None;
                }
                if self.range.is_before_start(&entry.key) {
                    continue;
                }
                return Some(Ok(entry));
            }

            if self.next_block >= self.table.block_count() {
                self.done = true;
                return None;
            }
            match self.table.read_block(self.next_block) {
                Ok(entries) => {
                    self.next_block += 1;
                    self.current = entries.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
