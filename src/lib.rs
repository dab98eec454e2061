//! levelkv - an embedded, ordered, persistent key-value store built on a
//! log-structured merge tree.
//!
//! Writes go to the write-ahead log and an in-memory skip list. Full
//! memtables are frozen and flushed into sorted tables at level 0, and a
//! background worker merges tables down the levels.

pub mod backoff;
pub mod batch;
pub mod compaction;
pub mod db;
pub mod error;
pub mod iterator;
pub mod manifest;
pub mod memtable;
pub mod metrics;
pub mod options;
pub mod sstable;
pub mod version;
pub mod wal;

pub use batch::{BatchOp, WriteBatch};
pub use compaction::CompactionStats;
pub use db::{recover, Database, EngineStats, RecoveredLog, Snapshot};
pub use error::{Result, StorageError};
pub use iterator::DbIterator;
pub use memtable::MemTable;
pub use options::{CompressionType, Options};
pub use sstable::{SsTableReader, SsTableWriter, TableMeta};
pub use version::{LevelManager, LevelSummary, TableHandle, Version};
pub use wal::{Wal, WalRecord};

use std::cmp::Ordering;
use std::ops::Bound;

// Core types that everything uses
pub type Key = Vec<u8>;
pub type Value = Vec<u8>;
pub type SequenceNumber = u64;

/// Sequence number used when a lookup should see every committed write.
pub const MAX_SEQUENCE: SequenceNumber = u64::MAX;

/// One version of a key. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Option<Value>,
    pub sequence: SequenceNumber,
}

impl Entry {
    pub fn put(key: Key, value: Value, sequence: SequenceNumber) -> Self {
        Entry {
            key,
            value: Some(value),
            sequence,
        }
    }

    pub fn tombstone(key: Key, sequence: SequenceNumber) -> Self {
        Entry {
            key,
            value: None,
            sequence,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn op_type(&self) -> OpType {
        if self.value.is_some() {
            OpType::Put
        } else {
            OpType::Delete
        }
    }

    pub fn internal_key(&self) -> InternalKey {
        InternalKey::new(self.key.clone(), self.sequence)
    }

    /// Ordering of two entries by (key ASC, sequence DESC).
    pub fn cmp_internal(&self, other: &Entry) -> Ordering {
        compare_internal(&self.key, self.sequence, &other.key, other.sequence)
    }
}

/// Operation tags shared by the WAL and the table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Put = 1,
    Delete = 2,
    Batch = 3,
}

impl OpType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OpType::Put),
            2 => Some(OpType::Delete),
            3 => Some(OpType::Batch),
            _ => None,
        }
    }
}

/// Key used inside memtables and tables: newest version of a user key
/// sorts first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InternalKey {
    pub user_key: Key,
    pub sequence: SequenceNumber,
}

impl InternalKey {
    pub fn new(user_key: Key, sequence: SequenceNumber) -> Self {
        InternalKey { user_key, sequence }
    }

    /// Smallest internal key for `user_key`, i.e. its newest possible version.
    pub fn seek_to(user_key: &[u8]) -> Self {
        InternalKey::new(user_key.to_vec(), MAX_SEQUENCE)
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_internal(&self.user_key, self.sequence, &other.user_key, other.sequence)
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) fn compare_internal(
    a_key: &[u8],
    a_seq: SequenceNumber,
    b_key: &[u8],
    b_seq: SequenceNumber,
) -> Ordering {
    a_key.cmp(b_key).then(b_seq.cmp(&a_seq))
}

/// A range of user keys. `Database::scan` builds the half-open `[start, end)`
/// form; the bounds are general so full scans and compaction ranges share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Key>,
    pub end: Bound<Key>,
}

impl KeyRange {
    pub fn new(start: &[u8], end: &[u8]) -> Self {
        KeyRange {
            start: Bound::Included(start.to_vec()),
            end: Bound::Excluded(end.to_vec()),
        }
    }

    pub fn all() -> Self {
        KeyRange {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    pub fn inclusive(start: &[u8], end: &[u8]) -> Self {
        KeyRange {
            start: Bound::Included(start.to_vec()),
            end: Bound::Included(end.to_vec()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Excluded(e)) => s >= e,
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Excluded(s), Bound::Excluded(e)) | (Bound::Excluded(s), Bound::Included(e)) => {
                s >= e
            }
            _ => false,
        }
    }

    /// True once `key` is past the end bound.
    pub fn is_past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
        }
    }

    pub fn is_before_start(&self, key: &[u8]) -> bool {
        match &self.start {
            Bound::Unbounded => false,
            Bound::Included(start) => key < start.as_slice(),
            Bound::Excluded(start) => key <= start.as_slice(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        !self.is_before_start(key) && !self.is_past_end(key)
    }

    /// Whether the closed key span `[smallest, largest]` intersects this range.
    pub fn overlaps(&self, smallest: &[u8], largest: &[u8]) -> bool {
        !self.is_past_end(smallest) && !self.is_before_start(largest)
    }

    /// First internal key a seek should land on.
    pub fn seek_key(&self) -> Option<InternalKey> {
        match &self.start {
            Bound::Unbounded => None,
            Bound::Included(start) => Some(InternalKey::seek_to(start)),
            // Version 0 of `start` is the last possible internal key for it.
            Bound::Excluded(start) => Some(InternalKey::new(start.clone(), 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_key_orders_newest_first() {
        let older = InternalKey::new(b"a".to_vec(), 1);
        let newer = InternalKey::new(b"a".to_vec(), 7);
        let other = InternalKey::new(b"b".to_vec(), 100);

        assert!(newer < older);
        assert!(older < other);
        assert!(InternalKey::seek_to(b"a") < newer);
    }

    #[test]
    fn key_range_bounds() {
        let range = KeyRange::new(b"b", b"d");
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"d"));

        assert!(range.overlaps(b"a", b"b"));
        assert!(!range.overlaps(b"d", b"z"));
        assert!(KeyRange::all().overlaps(b"x", b"y"));
        assert!(KeyRange::new(b"c", b"c").is_empty());
    }
}
