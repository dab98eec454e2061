//! Table sets and level bookkeeping.
//!
//! ## Architecture
//!
//! ```text
//! LevelManager
//!   current: RwLock<Arc<Version>>   swapped, never mutated in place
//!
//! Version
//!   L0: [t9, t7, t4]   newest first, ranges may overlap
//!   L1: [a..f, g..m]   sorted by smallest key, disjoint
//!   L2: ...
//! ```
//!
//! Tables are shared between versions through `Arc<TableHandle>`. A table
//! dropped by a compaction is marked obsolete and its file is unlinked when
//! the last version (or reader) holding it goes away.

use crate::compaction::CompactionTask;
use crate::iterator::EntryIter;
use crate::metrics::Metrics;
use crate::options::Options;
use crate::sstable::{SsTableReader, TableMeta};
use crate::{Entry, KeyRange, Result, SequenceNumber, StorageError};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// An open table shared by every version that references it.
#[derive(Debug)]
pub struct TableHandle {
    reader: Arc<SsTableReader>,
    obsolete: AtomicBool,
}

impl TableHandle {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_reader(SsTableReader::open(path)?))
    }

    pub fn from_reader(reader: SsTableReader) -> Self {
        TableHandle {
            reader: Arc::new(reader),
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.reader.info().id
    }

    pub fn meta(&self) -> &TableMeta {
        self.reader.info()
    }

    pub fn reader(&self) -> &Arc<SsTableReader> {
        &self.reader
    }

    /// Delete the file once the last reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        let path = self.reader.path();
        match std::fs::remove_file(path) {
            Ok(()) => debug!(table = self.id(), "deleted obsolete table"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(table = self.id(), error = %e, "failed to delete obsolete table"),
        }
    }
}

/// Immutable set of tables per level.
#[derive(Clone, Debug)]
pub struct Version {
    levels: Vec<Vec<Arc<TableHandle>>>,
}

impl Version {
    pub fn new(max_levels: usize) -> Self {
        Version {
            levels: vec![Vec::new(); max_levels],
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn tables(&self, level: usize) -> &[Arc<TableHandle>] {
        self.levels.get(level).map_or(&[], |tables| tables.as_slice())
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(|level| level.len()).sum()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.tables(level).iter().map(|t| t.meta().file_size).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        (0..self.num_levels()).map(|level| self.level_bytes(level)).sum()
    }

    /// Deepest level holding at least one table.
    pub fn deepest_non_empty_level(&self) -> Option<usize> {
        (0..self.num_levels()).rev().find(|&level| !self.levels[level].is_empty())
    }

    /// Newest version of `key` visible at `snapshot`, searching L0 then
    /// each deeper level. Tombstones are returned as entries.
    pub fn get(&self, key: &[u8], snapshot: SequenceNumber, metrics: &Metrics) -> Result<Option<Entry>> {
        // L0 tables may overlap; the highest sequence wins.
        let mut best: Option<Entry> = None;
        for table in self.tables(0) {
            if let Some(entry) = probe(table, key, snapshot, metrics)? {
                if best.as_ref().map_or(true, |b| entry.sequence > b.sequence) {
                    best = Some(entry);
                }
            }
        }
        if best.is_some() {
            return Ok(best);
        }

        for level in 1..self.num_levels() {
            let tables = self.tables(level);
            let idx = tables.partition_point(|t| t.meta().largest_key.as_slice() < key);
            if let Some(table) = tables.get(idx) {
                if let Some(entry) = probe(table, key, snapshot, metrics)? {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    /// Tables in `level` whose range intersects `[smallest, largest]`.
    pub fn overlapping(&self, level: usize, smallest: &[u8], largest: &[u8]) -> Vec<Arc<TableHandle>> {
        self.tables(level)
            .iter()
            .filter(|t| t.meta().overlaps(smallest, largest))
            .cloned()
            .collect()
    }

    /// Whether any level below `level` has a table whose range covers `key`.
    pub fn key_may_exist_below(&self, level: usize, key: &[u8]) -> bool {
        ((level + 1)..self.num_levels())
            .any(|deeper| self.tables(deeper).iter().any(|t| t.meta().covers(key)))
    }

    /// One source per L0 table (newest first) and one per deeper level.
    pub fn iterators(&self, range: &KeyRange) -> Vec<EntryIter> {
        let mut sources: Vec<EntryIter> = Vec::new();

        for table in self.tables(0) {
            let meta = table.meta();
            if range.overlaps(&meta.smallest_key, &meta.largest_key) {
                sources.push(Box::new(table.reader().iter(range.clone())));
            }
        }

        for level in 1..self.num_levels() {
            let readers: Vec<Arc<SsTableReader>> = self
                .tables(level)
                .iter()
                .filter(|t| range.overlaps(&t.meta().smallest_key, &t.meta().largest_key))
                .map(|t| Arc::clone(t.reader()))
                .collect();
            if readers.is_empty() {
                continue;
            }
            let range = range.clone();
            // Disjoint and sorted, so chaining keeps the level in order.
            sources.push(Box::new(
                readers
                    .into_iter()
                    .flat_map(move |reader| reader.iter(range.clone())),
            ));
        }
        sources
    }

    /// New version with `removed` (level, table id) pairs dropped and
    /// `added` tables inserted.
    pub fn apply(&self, removed: &[(usize, u64)], added: Vec<(usize, Arc<TableHandle>)>) -> Result<Version> {
        let mut next = self.clone();

        for &(level, id) in removed {
            let tables = next.levels.get_mut(level).ok_or_else(|| {
                StorageError::InvariantViolation(format!("level {} out of range", level))
            })?;
            let before = tables.len();
            tables.retain(|t| t.id() != id);
            if tables.len() == before {
                return Err(StorageError::InvariantViolation(format!(
                    "table {} is not in level {}",
                    id, level
                )));
            }
        }

        for (level, table) in added {
            let tables = next.levels.get_mut(level).ok_or_else(|| {
                StorageError::InvariantViolation(format!("level {} out of range", level))
            })?;
            tables.push(table);
        }

        next.sort_levels();
        next.check_invariants()?;
        Ok(next)
    }

    fn sort_levels(&mut self) {
        for (level, tables) in self.levels.iter_mut().enumerate() {
            if level == 0 {
                tables.sort_by(|a, b| b.id().cmp(&a.id()));
            } else {
                tables.sort_by(|a, b| a.meta().smallest_key.cmp(&b.meta().smallest_key));
            }
        }
    }

    /// L1+ tables must be sorted and pairwise disjoint.
    pub fn check_invariants(&self) -> Result<()> {
        for level in 1..self.num_levels() {
            for pair in self.tables(level).windows(2) {
                let (left, right) = (pair[0].meta(), pair[1].meta());
                if left.largest_key >= right.smallest_key {
                    return Err(StorageError::InvariantViolation(format!(
                        "level {} tables {} and {} overlap",
                        level, left.id, right.id
                    )));
                }
            }
        }
        Ok(())
    }
}

fn probe(table: &TableHandle, key: &[u8], snapshot: SequenceNumber, metrics: &Metrics) -> Result<Option<Entry>> {
    let meta = table.meta();
    if !meta.covers(key) {
        return Ok(None);
    }
    if !table.reader().may_contain(key) {
        metrics.bloom_filter_misses.inc();
        return Ok(None);
    }
    metrics.bloom_filter_hits.inc();
    let found = table.reader().search(key, snapshot)?;
    if found.is_none() {
        metrics.bloom_filter_false_positives.inc();
    }
    Ok(found)
}

/// Per-level table count and size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSummary {
    pub level: usize,
    pub tables: usize,
    pub bytes: u64,
}

/// Owns the current `Version` and decides what to compact next.
pub struct LevelManager {
    current: RwLock<Arc<Version>>,
    options: Options,
}

impl LevelManager {
    pub fn new(options: Options) -> Self {
        let version = Version::new(options.max_levels);
        LevelManager {
            current: RwLock::new(Arc::new(version)),
            options,
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current.read())
    }

    /// Publish a new version built from the current one.
    pub fn apply(&self, removed: &[(usize, u64)], added: Vec<(usize, Arc<TableHandle>)>) -> Result<Arc<Version>> {
        let mut current = self.current.write();
        let next = Arc::new(current.apply(removed, added)?);
        *current = Arc::clone(&next);
        Ok(next)
    }

    /// Publish a version computed elsewhere. Callers serialize through the
    /// manifest lock so nothing is installed in between.
    pub fn install(&self, version: Arc<Version>) {
        *self.current.write() = version;
    }

    pub fn add_table(&self, level: usize, table: Arc<TableHandle>) -> Result<Arc<Version>> {
        self.apply(&[], vec![(level, table)])
    }

    /// Tables of `level` in search order.
    pub fn current_tables(&self, level: usize) -> Vec<Arc<TableHandle>> {
        self.current().tables(level).to_vec()
    }

    pub fn level_summary(&self) -> Vec<LevelSummary> {
        let version = self.current();
        (0..version.num_levels())
            .map(|level| LevelSummary {
                level,
                tables: version.tables(level).len(),
                bytes: version.level_bytes(level),
            })
            .collect()
    }

    /// How far over its budget `level` is; above 1.0 means compact.
    fn score(&self, version: &Version, level: usize) -> f64 {
        if level == 0 {
            version.tables(0).len() as f64 / self.options.l0_compaction_trigger as f64
        } else {
            version.level_bytes(level) as f64 / self.options.max_bytes_for_level(level) as f64
        }
    }

    /// Highest-scoring level over its trigger, with its input tables.
    pub fn pick_compaction_candidate(&self) -> Option<CompactionTask> {
        let version = self.current();
        let deepest = version.num_levels() - 1;

        let mut best: Option<(usize, f64)> = None;
        for level in 0..deepest {
            let over = if level == 0 {
                version.tables(0).len() > self.options.l0_compaction_trigger
            } else {
                version.level_bytes(level) > self.options.max_bytes_for_level(level)
            };
            if !over {
                continue;
            }
            let score = self.score(&version, level);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((level, score));
            }
        }

        let (level, score) = best?;
        let inputs = if level == 0 {
            version.tables(0).to_vec()
        } else {
            let table = version
                .tables(level)
                .iter()
                .min_by_key(|t| {
                    let overlap: u64 = version
                        .overlapping(level + 1, &t.meta().smallest_key, &t.meta().largest_key)
                        .iter()
                        .map(|o| o.meta().file_size)
                        .sum();
                    (overlap, t.id())
                })
                .cloned()?;
            vec![table]
        };

        debug!(level, score, inputs = inputs.len(), "picked compaction");
        Some(CompactionTask::new(&version, level, inputs))
    }
}
