//! In-memory write buffer.
//!
//! A concurrent skip list keyed by internal key, so every version of a key
//! is kept in (key ASC, sequence DESC) order. Readers never block the writer.
//! Once frozen the table is read-only and waits to be flushed to level 0.

use crate::{Entry, InternalKey, Key, KeyRange, Result, SequenceNumber, StorageError, Value};
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-entry bookkeeping counted against the size budget on top of the
/// key and value bytes.
const ENTRY_OVERHEAD: usize = 32;

pub struct MemTable {
    data: SkipMap<InternalKey, Option<Value>>,
    size_bytes: AtomicUsize,
    frozen: AtomicBool,
}

impl MemTable {
    pub fn new() -> Self {
        MemTable {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn put(&self, key: Key, value: Value, sequence: SequenceNumber) -> Result<()> {
        self.insert(key, Some(value), sequence)
    }

    /// Record a tombstone for `key`.
    pub fn delete(&self, key: Key, sequence: SequenceNumber) -> Result<()> {
        self.insert(key, None, sequence)
    }

    pub fn apply(&self, entry: Entry) -> Result<()> {
        self.insert(entry.key, entry.value, entry.sequence)
    }

    fn insert(&self, key: Key, value: Option<Value>, sequence: SequenceNumber) -> Result<()> {
        if self.is_frozen() {
            return Err(StorageError::InvariantViolation(
                "write to a frozen memtable".into(),
            ));
        }

        let charge = key.len() + value.as_ref().map_or(0, |v| v.len()) + ENTRY_OVERHEAD;
        let internal = InternalKey::new(key, sequence);
        let replaced = self.data.contains_key(&internal);
        self.data.insert(internal, value);
        if !replaced {
            self.size_bytes.fetch_add(charge, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Newest version of `key` with sequence <= `snapshot`, tombstones
    /// included.
    pub fn get(&self, key: &[u8], snapshot: SequenceNumber) -> Option<Entry> {
        let lookup = InternalKey::new(key.to_vec(), snapshot);
        let found = self.data.lower_bound(Bound::Included(&lookup))?;
        if found.key().user_key.as_slice() != key {
            return None;
        }
        Some(Entry {
            key: found.key().user_key.clone(),
            value: found.value().clone(),
            sequence: found.key().sequence,
        })
    }

    /// Lazy iterator over every version inside `range`, in internal-key
    /// order. Writes landing after the call may or may not be observed.
    pub fn scan(self: &Arc<Self>, range: KeyRange) -> MemTableIterator {
        let next_bound = match range.seek_key() {
            Some(seek) => Bound::Included(seek),
            None => Bound::Unbounded,
        };
        MemTableIterator {
            table: Arc::clone(self),
            next_bound,
            range,
            done: false,
        }
    }

    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        self.scan(KeyRange::all())
    }

    /// Approximate memory held by the table, used for the flush decision.
    pub fn approx_size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Largest sequence number stored, if any.
    pub fn max_sequence(&self) -> Option<SequenceNumber> {
        self.data.iter().map(|e| e.key().sequence).max()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a memtable that re-seeks past the last returned key on each
/// step, so it holds no borrow of the skip list between calls.
pub struct MemTableIterator {
    table: Arc<MemTable>,
    next_bound: Bound<InternalKey>,
    range: KeyRange,
    done: bool,
}

impl Iterator for MemTableIterator {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        while !self.done {
            let found = match self.table.data.lower_bound(self.next_bound.as_ref()) {
                Some(found) => found,
                None => {
                    self.done = true;
                    return None;
                }
            };

            let internal = found.key().clone();
            let value = found.value().clone();
            drop(found);

            if self.range.is_past_end(&internal.user_key) {
                self.done = true;
                return None;
            }
            self.next_bound = Bound::Excluded(internal.clone());
            if self.range.is_before_start(&internal.user_key) {
                continue;
            }

            return Some(Entry {
                key: internal.user_key,
                value,
                sequence: internal.sequence,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_SEQUENCE;

    #[test]
    fn test_put_get_newest_version() {
        let table = MemTable::new();
        table.put(b"a".to_vec(), b"1".to_vec(), 1).unwrap();
        table.put(b"a".to_vec(), b"2".to_vec(), 2).unwrap();

        let entry = table.get(b"a", MAX_SEQUENCE).unwrap();
        assert_eq!(entry.value, Some(b"2".to_vec()));
        assert_eq!(entry.sequence, 2);

        // An older snapshot sees the older version.
        assert_eq!(table.get(b"a", 1).unwrap().value, Some(b"1".to_vec()));
        assert!(table.get(b"a", 0).is_none());
        assert!(table.get(b"b", MAX_SEQUENCE).is_none());
    }

    #[test]
    fn test_tombstone_is_returned() {
        let table = MemTable::new();
        table.put(b"k".to_vec(), b"v".to_vec(), 1).unwrap();
        table.delete(b"k".to_vec(), 2).unwrap();

        let entry = table.get(b"k", MAX_SEQUENCE).unwrap();
        assert!(entry.is_tombstone());
    }

    #[test]
    fn test_scan_is_ordered_and_bounded() {
        let table = Arc::new(MemTable::new());
        for (i, key) in ["d", "a", "c", "b", "e"].iter().enumerate() {
            table
                .put(key.as_bytes().to_vec(), b"v".to_vec(), i as u64 + 1)
                .unwrap();
        }

        let keys: Vec<Key> = table.scan(KeyRange::new(b"b", b"e")).map(|e| e.key).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        // Restartable: a second call starts over.
        assert_eq!(table.scan(KeyRange::new(b"b", b"e")).count(), 3);
        assert_eq!(table.iter().count(), 5);
    }

    #[test]
    fn test_scan_yields_versions_newest_first() {
        let table = Arc::new(MemTable::new());
        table.put(b"k".to_vec(), b"old".to_vec(), 1).unwrap();
        table.put(b"k".to_vec(), b"new".to_vec(), 5).unwrap();

        let sequences: Vec<u64> = table.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![5, 1]);
    }

    #[test]
    fn test_frozen_rejects_writes() {
        let table = MemTable::new();
        table.put(b"a".to_vec(), b"1".to_vec(), 1).unwrap();
        table.freeze();

        let err = table.put(b"b".to_vec(), b"2".to_vec(), 2).unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
        assert!(table.get(b"a", MAX_SEQUENCE).is_some());
    }

    #[test]
    fn test_size_tracking() {
        let table = MemTable::new();
        assert_eq!(table.approx_size(), 0);
        table.put(vec![0u8; 10], vec![0u8; 100], 1).unwrap();
        assert_eq!(table.approx_size(), 110 + ENTRY_OVERHEAD);
        assert_eq!(table.max_sequence(), Some(1));
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let table = Arc::new(MemTable::new());
        let writer = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    table
                        .put(format!("key_{:04}", i).into_bytes(), b"v".to_vec(), i + 1)
                        .unwrap();
                }
            })
        };

        let reader = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for _ in 0..10 {
                    let keys: Vec<Key> = table.iter().map(|e| e.key).collect();
                    assert!(keys.windows(2).all(|w| w[0] < w[1]));
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(table.len(), 1000);
    }
}
