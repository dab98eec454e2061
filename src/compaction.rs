//! Compaction module for merging tables down the levels
//!
//! Leveled compaction:
//! - L0 tables overlap, so an L0 compaction takes all of them
//! - Ln (n >= 1) compacts one table at a time
//! - Inputs are merged with every overlapping table of the next level and
//!   the result replaces them all at that next level
//!
//! # Algorithm: K-Way Merge
//!
//! 1. Open an ordered source per input table (per level for the next level)
//! 2. Merge in (key ASC, sequence DESC) order
//! 3. Keep the newest version of each key, plus any older version a live
//!    snapshot can still see
//! 4. Drop tombstones nothing below the output level can be hiding
//! 5. Cut outputs at `target_file_size`, never inside one user key
//!
//! The caller commits the outputs through a manifest edit. Until then the
//! new files are invisible, and on error or cancellation they are deleted.

use crate::iterator::{EntryIter, MergingIterator};
use crate::sstable::{table_path, SsTableReader, SsTableWriter, TableConfig, TableMeta};
use crate::version::{TableHandle, Version};
use crate::{Entry, Key, KeyRange, Result, SequenceNumber, StorageError};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Tables chosen for one compaction.
#[derive(Clone)]
pub struct CompactionTask {
    pub level: usize,
    pub inputs: Vec<Arc<TableHandle>>,
    /// Tables of `level + 1` overlapping the inputs.
    pub next_inputs: Vec<Arc<TableHandle>>,
}

impl CompactionTask {
    pub fn new(version: &Version, level: usize, inputs: Vec<Arc<TableHandle>>) -> Self {
        let next_inputs = match key_span(&inputs) {
            Some((smallest, largest)) => version.overlapping(level + 1, &smallest, &largest),
            None => Vec::new(),
        };
        CompactionTask {
            level,
            inputs,
            next_inputs,
        }
    }

    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    /// A single table with nothing to merge against can simply move down.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs.len() == 1 && self.next_inputs.is_empty()
    }

    pub fn input_bytes(&self) -> u64 {
        self.inputs
            .iter()
            .chain(&self.next_inputs)
            .map(|t| t.meta().file_size)
            .sum()
    }

    /// (level, id) of every table this compaction replaces.
    pub fn removed(&self) -> Vec<(usize, u64)> {
        self.inputs
            .iter()
            .map(|t| (self.level, t.id()))
            .chain(self.next_inputs.iter().map(|t| (self.level + 1, t.id())))
            .collect()
    }

    pub fn mark_inputs_obsolete(&self) {
        for table in self.inputs.iter().chain(&self.next_inputs) {
            table.mark_obsolete();
        }
    }

    /// Merge sources, newest first.
    fn sources(&self) -> Vec<EntryIter> {
        let mut sources: Vec<EntryIter> = Vec::new();
        for table in &self.inputs {
            sources.push(Box::new(table.reader().iter(KeyRange::all())));
        }
        let next: Vec<Arc<SsTableReader>> = self
            .next_inputs
            .iter()
            .map(|t| Arc::clone(t.reader()))
            .collect();
        if !next.is_empty() {
            sources.push(Box::new(
                next.into_iter()
                    .flat_map(|reader| reader.iter(KeyRange::all())),
            ));
        }
        sources
    }
}

/// Smallest and largest user key across `tables`.
fn key_span(tables: &[Arc<TableHandle>]) -> Option<(Key, Key)> {
    let smallest = tables.iter().map(|t| &t.meta().smallest_key).min()?;
    let largest = tables.iter().map(|t| &t.meta().largest_key).max()?;
    Some((smallest.clone(), largest.clone()))
}

/// Compaction statistics
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    pub input_tables: usize,
    pub input_bytes: u64,
    pub output_tables: usize,
    pub output_bytes: u64,
    pub entries_merged: usize,
    pub duplicates_removed: usize,
    pub tombstones_dropped: usize,
    pub duration_ms: u64,
}

/// Everything a compaction needs from the database besides its inputs.
pub struct CompactionContext<'a> {
    pub sst_dir: &'a Path,
    pub table_config: TableConfig,
    pub target_file_size: u64,
    /// Oldest sequence number any reader may still read at.
    pub smallest_snapshot: SequenceNumber,
    /// Version the task was picked from; decides tombstone dropping.
    pub version: &'a Version,
    pub next_table_id: &'a AtomicU64,
    pub cancel: &'a AtomicBool,
}

pub struct CompactionOutput {
    pub tables: Vec<TableMeta>,
    pub stats: CompactionStats,
}

/// Merge the task's inputs into new tables for `task.output_level()`.
pub fn run_compaction(task: &CompactionTask, ctx: &CompactionContext<'_>) -> Result<CompactionOutput> {
    let start = Instant::now();
    info!(
        level = task.level,
        inputs = task.inputs.len(),
        next_inputs = task.next_inputs.len(),
        "compaction started"
    );

    let mut outputs = OutputSet::new(ctx);
    match merge_into(task, ctx, &mut outputs) {
        Ok(mut stats) => {
            let tables = outputs.finish()?;
            stats.input_tables = task.inputs.len() + task.next_inputs.len();
            stats.input_bytes = task.input_bytes();
            stats.output_tables = tables.len();
            stats.output_bytes = tables.iter().map(|t| t.file_size).sum();
            stats.duration_ms = start.elapsed().as_millis() as u64;

            info!(
                level = task.level,
                input_bytes = stats.input_bytes,
                output_tables = stats.output_tables,
                output_bytes = stats.output_bytes,
                duplicates = stats.duplicates_removed,
                tombstones = stats.tombstones_dropped,
                ms = stats.duration_ms,
                "compaction finished"
            );
            Ok(CompactionOutput { tables, stats })
        }
        Err(e) => {
            warn!(level = task.level, error = %e, "compaction aborted, removing partial output");
            outputs.abandon();
            Err(e)
        }
    }
}

fn merge_into(task: &CompactionTask, ctx: &CompactionContext<'_>, outputs: &mut OutputSet<'_>) -> Result<CompactionStats> {
    let output_level = task.output_level();
    let mut stats = CompactionStats::default();

    let mut current_key: Option<Key> = None;
    // Sequence of the previous version of `current_key` in merge order.
    let mut last_sequence_for_key: Option<SequenceNumber> = None;

    for entry in MergingIterator::new(task.sources()) {
        if ctx.cancel.load(Ordering::Relaxed) {
            return Err(StorageError::Closed);
        }
        let entry = entry?;

        if current_key.as_deref() != Some(entry.key.as_slice()) {
            current_key = Some(entry.key.clone());
            last_sequence_for_key = None;
        }

        let drop = if last_sequence_for_key.map_or(false, |seq| seq <= ctx.smallest_snapshot) {
            // Shadowed by a newer version every reader already sees.
            stats.duplicates_removed += 1;
            true
        } else if entry.is_tombstone()
            && entry.sequence <= ctx.smallest_snapshot
            && !ctx.version.key_may_exist_below(output_level, &entry.key)
        {
            stats.tombstones_dropped += 1;
            true
        } else {
            false
        };
        last_sequence_for_key = Some(entry.sequence);

        if !drop {
            outputs.add(&entry)?;
            stats.entries_merged += 1;
        }
    }
    Ok(stats)
}

/// Output tables of one compaction, cut at the target size.
struct OutputSet<'a> {
    ctx: &'a CompactionContext<'a>,
    current: Option<SsTableWriter>,
    finished: Vec<TableMeta>,
}

impl<'a> OutputSet<'a> {
    fn new(ctx: &'a CompactionContext<'a>) -> Self {
        OutputSet {
            ctx,
            current: None,
            finished: Vec::new(),
        }
    }

    fn add(&mut self, entry: &Entry) -> Result<()> {
        let full = self.current.as_ref().map_or(false, |writer| {
            writer.estimated_file_size() >= self.ctx.target_file_size
                && writer.last_key().map_or(false, |last| last.user_key != entry.key)
        });
        if full {
            self.finish_current()?;
        }

        if self.current.is_none() {
            let id = self.ctx.next_table_id.fetch_add(1, Ordering::SeqCst);
            let path = table_path(self.ctx.sst_dir, id);
            debug!(table = id, "opening compaction output");
            self.current = Some(SsTableWriter::new(path, id, self.ctx.table_config)?);
        }

        match self.current.as_mut() {
            Some(writer) => writer.add(entry),
            None => Err(StorageError::InvariantViolation("no open output table".into())),
        }
    }

    fn finish_current(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            self.finished.push(writer.finish()?);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<TableMeta>> {
        if let Err(e) = self.finish_current() {
            self.abandon();
            return Err(e);
        }
        Ok(std::mem::take(&mut self.finished))
    }

    fn abandon(&mut self) {
        if let Some(writer) = self.current.take() {
            let _ = writer.abandon();
        }
        for meta in self.finished.drain(..) {
            let _ = std::fs::remove_file(table_path(self.ctx.sst_dir, meta.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::options::Options;
    use crate::version::LevelManager;
    use crate::MAX_SEQUENCE;
    use tempfile::{tempdir, TempDir};

    fn make_table(dir: &TempDir, id: u64, entries: &[Entry]) -> Arc<TableHandle> {
        let path = table_path(dir.path(), id);
        let mut writer = SsTableWriter::new(&path, id, TableConfig::default()).unwrap();
        for entry in entries {
            writer.add(entry).unwrap();
        }
        writer.finish().unwrap();
        Arc::new(TableHandle::open(&path).unwrap())
    }

    fn put(key: &str, value: &str, seq: u64) -> Entry {
        Entry::put(key.as_bytes().to_vec(), value.as_bytes().to_vec(), seq)
    }

    fn run(
        dir: &TempDir,
        version: &Version,
        task: &CompactionTask,
        smallest_snapshot: SequenceNumber,
        target_file_size: u64,
    ) -> Result<CompactionOutput> {
        let next_id = AtomicU64::new(100);
        let cancel = AtomicBool::new(false);
        let ctx = CompactionContext {
            sst_dir: dir.path(),
            table_config: TableConfig::default(),
            target_file_size,
            smallest_snapshot,
            version,
            next_table_id: &next_id,
            cancel: &cancel,
        };
        run_compaction(task, &ctx)
    }

    #[test]
    fn test_newest_version_wins() -> Result<()> {
        let dir = tempdir()?;
        let manager = LevelManager::new(Options::default());
        manager.add_table(0, make_table(&dir, 1, &[put("a", "old", 1), put("b", "b", 2)]))?;
        manager.add_table(0, make_table(&dir, 2, &[put("a", "new", 3), put("c", "c", 4)]))?;

        let version = manager.current();
        let task = CompactionTask::new(&version, 0, version.tables(0).to_vec());
        let output = run(&dir, &version, &task, MAX_SEQUENCE, u64::MAX)?;

        assert_eq!(output.tables.len(), 1);
        assert_eq!(output.stats.entries_merged, 3);
        assert_eq!(output.stats.duplicates_removed, 1);

        let merged = Arc::new(SsTableReader::open(table_path(dir.path(), output.tables[0].id))?);
        let entries: Vec<Entry> = merged.iter(KeyRange::all()).collect::<Result<_>>()?;
        assert_eq!(entries, vec![put("a", "new", 3), put("b", "b", 2), put("c", "c", 4)]);
        Ok(())
    }

    #[test]
    fn test_snapshot_keeps_older_version() -> Result<()> {
        let dir = tempdir()?;
        let manager = LevelManager::new(Options::default());
        manager.add_table(0, make_table(&dir, 1, &[put("a", "v1", 1)]))?;
        manager.add_table(0, make_table(&dir, 2, &[put("a", "v2", 5)]))?;

        let version = manager.current();
        let task = CompactionTask::new(&version, 0, version.tables(0).to_vec());
        // A snapshot at sequence 2 still needs v1.
        let output = run(&dir, &version, &task, 2, u64::MAX)?;
        assert_eq!(output.stats.entries_merged, 2);

        let reader = SsTableReader::open(table_path(dir.path(), output.tables[0].id))?;
        assert_eq!(reader.get(b"a", 2)?.unwrap().value, Some(b"v1".to_vec()));
        assert_eq!(reader.get(b"a", MAX_SEQUENCE)?.unwrap().value, Some(b"v2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_tombstone_dropped_only_at_base_level() -> Result<()> {
        let dir = tempdir()?;
        let manager = LevelManager::new(Options::default());
        manager.add_table(0, make_table(&dir, 1, &[Entry::tombstone(b"x".to_vec(), 5)]))?;
        manager.add_table(2, make_table(&dir, 2, &[put("x", "deep", 1)]))?;

        let version = manager.current();
        let task = CompactionTask::new(&version, 0, version.tables(0).to_vec());
        let output = run(&dir, &version, &task, MAX_SEQUENCE, u64::MAX)?;
        // L2 may still hold x, so the tombstone must survive.
        assert_eq!(output.stats.tombstones_dropped, 0);
        assert_eq!(output.tables.len(), 1);

        let manager = LevelManager::new(Options::default());
        manager.add_table(0, make_table(&dir, 3, &[Entry::tombstone(b"x".to_vec(), 5)]))?;
        manager.add_table(1, make_table(&dir, 4, &[put("x", "old", 1)]))?;
        let version = manager.current();
        let task = CompactionTask::new(&version, 0, version.tables(0).to_vec());
        let output = run(&dir, &version, &task, MAX_SEQUENCE, u64::MAX)?;
        assert_eq!(output.stats.tombstones_dropped, 1);
        assert_eq!(output.stats.duplicates_removed, 1);
        assert!(output.tables.is_empty());
        Ok(())
    }

    #[test]
    fn test_outputs_split_between_user_keys() -> Result<()> {
        let dir = tempdir()?;
        let manager = LevelManager::new(Options::default());
        let mut entries = Vec::new();
        for i in 0..200u64 {
            let key = format!("key_{:04}", i);
            entries.push(put(&key, &"v".repeat(100), 1000 + i));
        }
        manager.add_table(0, make_table(&dir, 1, &entries))?;
        let version = manager.current();
        let task = CompactionTask::new(&version, 0, version.tables(0).to_vec());

        let output = run(&dir, &version, &task, MAX_SEQUENCE, 1024)?;
        assert!(output.tables.len() > 1);
        for pair in output.tables.windows(2) {
            assert!(pair[0].largest_key < pair[1].smallest_key);
        }

        let metrics = Metrics::new();
        let handles: Vec<_> = output
            .tables
            .iter()
            .map(|m| Arc::new(TableHandle::open(table_path(dir.path(), m.id)).unwrap()))
            .collect();
        let next = version.apply(&task.removed(), handles.into_iter().map(|h| (1, h)).collect())?;
        assert!(next.get(b"key_0150", MAX_SEQUENCE, &metrics)?.is_some());
        Ok(())
    }

    #[test]
    fn test_cancelled_compaction_leaves_no_files() -> Result<()> {
        let dir = tempdir()?;
        let manager = LevelManager::new(Options::default());
        manager.add_table(0, make_table(&dir, 1, &[put("a", "1", 1), put("b", "2", 2)]))?;
        let version = manager.current();
        let task = CompactionTask::new(&version, 0, version.tables(0).to_vec());

        let next_id = AtomicU64::new(100);
        let cancel = AtomicBool::new(true);
        let ctx = CompactionContext {
            sst_dir: dir.path(),
            table_config: TableConfig::default(),
            target_file_size: u64::MAX,
            smallest_snapshot: MAX_SEQUENCE,
            version: &version,
            next_table_id: &next_id,
            cancel: &cancel,
        };
        assert!(matches!(run_compaction(&task, &ctx), Err(StorageError::Closed)));
        assert!(!table_path(dir.path(), 100).exists());
        Ok(())
    }
}
