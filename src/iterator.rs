//! Merging iterators.
//!
//! # Algorithm: K-Way Merge
//!
//! Every source (memtable or table) yields entries in internal-key order.
//! A min-heap holds the head of each source; popping it gives the globally
//! next entry. Sources are numbered newest first, which breaks ties between
//! identical internal keys in favour of the newer source.

use crate::version::Version;
use crate::{Entry, Key, Result, SequenceNumber, StorageError, Value};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

pub type EntryIter = Box<dyn Iterator<Item = Result<Entry>> + Send>;

/// Heap slot remembering which source an entry came from.
struct HeapItem {
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we want the smallest first.
        other
            .entry
            .cmp_internal(&self.entry)
            .then(other.source.cmp(&self.source))
    }
}

/// Every version from every source, in internal-key order.
pub struct MergingIterator {
    sources: Vec<EntryIter>,
    heap: BinaryHeap<HeapItem>,
    pending_error: Option<StorageError>,
    primed: bool,
    done: bool,
}

impl MergingIterator {
    /// `sources` must be ordered newest first.
    pub fn new(sources: Vec<EntryIter>) -> Self {
        let heap = BinaryHeap::with_capacity(sources.len());
        MergingIterator {
            sources,
            heap,
            pending_error: None,
            primed: false,
            done: false,
        }
    }

    fn pull(&mut self, source: usize) -> Result<()> {
        match self.sources[source].next() {
            Some(Ok(entry)) => {
                self.heap.push(HeapItem { entry, source });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    fn fail(&mut self, error: StorageError) -> Option<Result<Entry>> {
        self.done = true;
        self.heap.clear();
        Some(Err(error))
    }
}

impl Iterator for MergingIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        if self.done {
            return None;
        }
        if let Some(error) = self.pending_error.take() {
            return self.fail(error);
        }
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                if let Err(e) = self.pull(source) {
                    return self.fail(e);
                }
            }
        }

        let Some(item) = self.heap.pop() else {
            self.done = true;
            return None;
        };
        // Refill from the same source; an error surfaces on the next call so
        // the popped entry is not lost.
        if let Err(e) = self.pull(item.source) {
            self.pending_error = Some(e);
        }
        Some(Ok(item.entry))
    }
}

/// User-facing cursor: the newest visible value of each live key, in
/// ascending key order.
///
/// Holds the `Version` it was built from so the tables it reads are not
/// deleted underneath it.
pub struct DbIterator {
    inner: MergingIterator,
    snapshot: SequenceNumber,
    last_key: Option<Key>,
    _version: Arc<Version>,
}

impl DbIterator {
    pub(crate) fn new(inner: MergingIterator, snapshot: SequenceNumber, version: Arc<Version>) -> Self {
        DbIterator {
            inner,
            snapshot,
            last_key: None,
            _version: version,
        }
    }
}

impl Iterator for DbIterator {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Result<(Key, Value)>> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            if entry.sequence > self.snapshot {
                continue;
            }
            if self.last_key.as_deref() == Some(entry.key.as_slice()) {
                // Older version of a key already decided.
                continue;
            }
            self.last_key = Some(entry.key.clone());
            if let Some(value) = entry.value {
                return Some(Ok((entry.key, value)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(entries: Vec<Entry>) -> EntryIter {
        Box::new(entries.into_iter().map(Ok))
    }

    fn put(key: &str, value: &str, seq: u64) -> Entry {
        Entry::put(key.as_bytes().to_vec(), value.as_bytes().to_vec(), seq)
    }

    #[test]
    fn test_merge_orders_by_internal_key() {
        let newer = source(vec![put("a", "a2", 5), put("c", "c1", 6)]);
        let older = source(vec![put("a", "a1", 1), put("b", "b1", 2)]);

        let merged: Vec<(Vec<u8>, u64)> = MergingIterator::new(vec![newer, older])
            .map(|e| e.map(|e| (e.key, e.sequence)))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            merged,
            vec![
                (b"a".to_vec(), 5),
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 2),
                (b"c".to_vec(), 6)
            ]
        );
    }

    #[test]
    fn test_db_iterator_dedups_and_hides_tombstones() {
        let newer = source(vec![Entry::tombstone(b"b".to_vec(), 9), put("c", "c2", 8)]);
        let older = source(vec![put("a", "a1", 1), put("b", "b1", 2), put("c", "c1", 3)]);
        let merged = MergingIterator::new(vec![newer, older]);

        let visible: Vec<(Key, Value)> = DbIterator::new(merged, u64::MAX, Arc::new(Version::new(2)))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            visible,
            vec![
                (b"a".to_vec(), b"a1".to_vec()),
                (b"c".to_vec(), b"c2".to_vec())
            ]
        );
    }

    #[test]
    fn test_db_iterator_respects_snapshot() {
        let newer = source(vec![Entry::tombstone(b"b".to_vec(), 9), put("c", "c2", 8)]);
        let older = source(vec![put("b", "b1", 2), put("c", "c1", 3)]);
        let merged = MergingIterator::new(vec![newer, older]);

        let visible: Vec<(Key, Value)> = DbIterator::new(merged, 5, Arc::new(Version::new(2)))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            visible,
            vec![
                (b"b".to_vec(), b"b1".to_vec()),
                (b"c".to_vec(), b"c1".to_vec())
            ]
        );
    }

    #[test]
    fn test_source_error_is_reported_once() {
        let failing: EntryIter = Box::new(
            vec![
                Ok(put("a", "1", 1)),
                Err(StorageError::Corruption("bad block".into())),
            ]
            .into_iter(),
        );
        let mut merged = MergingIterator::new(vec![failing]);
        assert!(merged.next().unwrap().is_ok());
        assert!(merged.next().unwrap().unwrap_err().is_corruption());
        assert!(merged.next().is_none());
    }
}
