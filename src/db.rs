//! Database façade.
//!
//! ## Architecture
//!
//! ```text
//! put/delete/batch ──► writer lock ──► WAL append ──► active memtable
//!                                                        │ full
//!                                                        ▼
//!                          frozen memtables (newest first, WAL rotated)
//!                                                        │ worker: Flush
//!                                                        ▼
//!                               L0 table ──► manifest edit ──► new Version
//!                                                        │ worker: Compact
//!                                                        ▼
//!                                              L1 .. Ln tables
//! ```
//!
//! Readers clone the current `Arc<SuperVersion>` and read without locks.
//! Flush and compaction run on one background thread fed over a crossbeam
//! channel, or inline on the writing thread when `background_work` is off.
//!
//! Lock order: manifest, then writer, then super version.

use crate::backoff::ExponentialBackoff;
use crate::batch::WriteBatch;
use crate::compaction::{run_compaction, CompactionContext, CompactionStats, CompactionTask};
use crate::iterator::{DbIterator, EntryIter, MergingIterator};
use crate::manifest::{Manifest, ManifestState, VersionEdit};
use crate::memtable::MemTable;
use crate::metrics::Metrics;
use crate::options::Options;
use crate::sstable::{parse_table_id, table_path, SsTableWriter, TableConfig, TableMeta};
use crate::version::{LevelManager, LevelSummary, TableHandle, Version};
use crate::wal::{self, Wal, WalRecord};
use crate::{Key, KeyRange, Result, SequenceNumber, StorageError, Value};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const WAL_DIR: &str = "wal";
const SST_DIR: &str = "sst";

/// Frozen memtables beyond this are flushed by the writer itself.
const MAX_PENDING_IMMUTABLES: usize = 4;

/// Message for the background worker
enum WorkerMessage {
    /// Flush frozen memtables, then compact.
    Flush,
    Compact,
    Shutdown,
}

/// A frozen memtable and the first WAL segment written after it.
#[derive(Clone)]
struct ImmutableMemTable {
    table: Arc<MemTable>,
    next_log: u64,
}

/// Everything a reader needs, published as one immutable unit.
struct SuperVersion {
    mem: Arc<MemTable>,
    /// Newest first.
    imms: Vec<ImmutableMemTable>,
    version: Arc<Version>,
}

struct WriterState {
    wal: Wal,
    next_sequence: SequenceNumber,
}

struct DbInner {
    path: PathBuf,
    wal_dir: PathBuf,
    sst_dir: PathBuf,
    options: Options,

    writer: Mutex<WriterState>,
    super_version: RwLock<Arc<SuperVersion>>,
    levels: LevelManager,
    manifest: Mutex<Manifest>,

    /// Highest sequence whose write is fully applied and visible.
    last_sequence: AtomicU64,
    next_table_id: AtomicU64,
    /// Live snapshot sequence -> reference count.
    snapshots: Mutex<BTreeMap<SequenceNumber, usize>>,

    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    shutting_down: AtomicBool,
    closed: AtomicBool,

    worker_tx: Mutex<Option<Sender<WorkerMessage>>>,
    metrics: Arc<Metrics>,
}

pub struct Database {
    inner: Arc<DbInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub memtable_entries: usize,
    pub memtable_bytes: usize,
    pub immutable_memtables: usize,
    pub immutable_memtable_entries: usize,
    pub num_sstables: usize,
    pub levels: Vec<LevelSummary>,
    pub last_sequence: SequenceNumber,
    pub live_snapshots: usize,
}

/// A pinned read point. Reads through it ignore later writes, and
/// compaction keeps every version it can see until it is dropped.
pub struct Snapshot {
    sequence: SequenceNumber,
    inner: Arc<DbInner>,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut snapshots = self.inner.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&self.sequence) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&self.sequence);
            }
        }
    }
}

/// Memtable rebuilt from the WAL.
pub struct RecoveredLog {
    pub memtable: Arc<MemTable>,
    /// Highest sequence replayed, 0 if none.
    pub last_sequence: SequenceNumber,
    pub records: usize,
    /// Set when replay stopped at a damaged record.
    pub corruption: Option<String>,
}

/// Replay the WAL segments numbered `log_number` and up into a fresh
/// memtable. Replaying the same log twice yields the same memtable.
pub fn recover(wal_dir: impl AsRef<Path>, log_number: u64, paranoid: bool) -> Result<RecoveredLog> {
    let replay = wal::replay(wal_dir.as_ref(), log_number, paranoid)?;
    let memtable = Arc::new(MemTable::new());
    let mut last_sequence = 0;
    let records = replay.records.len();

    for record in replay.records {
        last_sequence = last_sequence.max(record.last_sequence());
        apply_record(&memtable, record)?;
    }

    Ok(RecoveredLog {
        memtable,
        last_sequence,
        records,
        corruption: replay.corruption,
    })
}

fn apply_record(memtable: &MemTable, record: WalRecord) -> Result<()> {
    match record {
        WalRecord::Put {
            sequence,
            key,
            value,
        } => memtable.put(key, value, sequence),
        WalRecord::Delete { sequence, key } => memtable.delete(key, sequence),
        WalRecord::Batch { sequence, batch } => {
            for entry in batch.entries(sequence) {
                memtable.apply(entry)?;
            }
            Ok(())
        }
    }
}

/// Write every entry of `memtable` into a new table. `None` if it is empty.
fn write_table(sst_dir: &Path, id: u64, config: TableConfig, memtable: &Arc<MemTable>) -> Result<Option<Arc<TableHandle>>> {
    if memtable.is_empty() {
        return Ok(None);
    }

    let path = table_path(sst_dir, id);
    let mut writer = SsTableWriter::new(&path, id, config)?;
    for entry in memtable.iter() {
        if let Err(e) = writer.add(&entry) {
            let _ = writer.abandon();
            return Err(e);
        }
    }
    writer.finish()?;

    match TableHandle::open(&path) {
        Ok(handle) => Ok(Some(Arc::new(handle))),
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            Err(e)
        }
    }
}

impl Database {
    /// Open (or create) the database in `path` and recover its state.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();

        let exists = Manifest::exists(&path);
        if !exists && !options.create_if_missing {
            return Err(StorageError::InvalidArgument(format!(
                "database {:?} does not exist",
                path
            )));
        }
        if exists && options.error_if_exists {
            return Err(StorageError::InvalidArgument(format!(
                "database {:?} already exists",
                path
            )));
        }

        let wal_dir = path.join(WAL_DIR);
        let sst_dir = path.join(SST_DIR);
        std::fs::create_dir_all(&wal_dir)?;
        std::fs::create_dir_all(&sst_dir)?;

        let interval = options.manifest_snapshot_interval;
        let mut manifest = if exists {
            Manifest::open(&path, interval)?
        } else {
            Manifest::create(&path, ManifestState::default(), interval)?
        };
        let state = manifest.state().clone();

        if let Some(deepest) = state.tables.iter().map(|(level, _)| *level).max() {
            if deepest >= options.max_levels {
                return Err(StorageError::InvalidArgument(format!(
                    "database has tables at level {} but max_levels is {}",
                    deepest, options.max_levels
                )));
            }
        }

        // Tables named by the manifest.
        let levels = LevelManager::new(options.clone());
        let mut live = HashSet::new();
        let mut tables = Vec::with_capacity(state.tables.len());
        for (level, meta) in &state.tables {
            let handle = TableHandle::open(table_path(&sst_dir, meta.id))?;
            live.insert(meta.id);
            tables.push((*level, Arc::new(handle)));
        }
        let version = levels.current().apply(&[], tables)?;
        levels.install(Arc::new(version));
        remove_orphan_tables(&sst_dir, &live)?;

        let max_live_id = live.iter().copied().max().unwrap_or(0);
        let next_table_id = AtomicU64::new(state.next_table_id.max(max_live_id + 1));

        // Everything logged since the last flush.
        let recovered = recover(&wal_dir, state.log_number, options.paranoid_checks)?;
        let last_sequence = state.last_sequence.max(recovered.last_sequence);
        let newest_segment = wal::list_segments(&wal_dir)?
            .last()
            .map_or(0, |(number, _)| *number);
        let new_log = newest_segment.max(state.log_number) + 1;

        let mut edit = VersionEdit {
            log_number: Some(new_log),
            last_sequence: Some(last_sequence),
            ..VersionEdit::default()
        };
        let id = next_table_id.fetch_add(1, Ordering::SeqCst);
        let recovered_table = write_table(&sst_dir, id, TableConfig::from(&options), &recovered.memtable)?;
        if let Some(table) = &recovered_table {
            edit.add_table(0, table.meta().clone());
        }
        edit.next_table_id = Some(next_table_id.load(Ordering::SeqCst));

        let version = match recovered_table {
            Some(table) => Arc::new(levels.current().apply(&[], vec![(0, table)])?),
            None => levels.current(),
        };
        manifest.log_edit(&edit)?;
        levels.install(Arc::clone(&version));
        wal::remove_segments_before(&wal_dir, new_log)?;

        info!(
            path = ?path,
            tables = version.table_count(),
            recovered_records = recovered.records,
            last_sequence,
            "opened database"
        );

        let wal = Wal::open(&wal_dir, new_log)?;
        let metrics = Arc::new(Metrics::new());
        metrics.sstable_count.set(version.table_count() as u64);

        let inner = Arc::new(DbInner {
            path,
            wal_dir,
            sst_dir,
            writer: Mutex::new(WriterState {
                wal,
                next_sequence: last_sequence + 1,
            }),
            super_version: RwLock::new(Arc::new(SuperVersion {
                mem: Arc::new(MemTable::new()),
                imms: Vec::new(),
                version,
            })),
            levels,
            manifest: Mutex::new(manifest),
            last_sequence: AtomicU64::new(last_sequence),
            next_table_id,
            snapshots: Mutex::new(BTreeMap::new()),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            worker_tx: Mutex::new(None),
            metrics,
            options,
        });

        let worker = if inner.options.background_work {
            let (tx, rx) = channel::unbounded();
            *inner.worker_tx.lock() = Some(tx);
            let handle = spawn_worker(Arc::clone(&inner), rx)?;
            inner.schedule(WorkerMessage::Compact)?;
            Some(handle)
        } else {
            inner.maybe_compact()?;
            None
        };

        Ok(Database {
            inner,
            worker: Mutex::new(worker),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write(key.len() + value.len(), |sequence| WalRecord::Put {
            sequence,
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write(key.len(), |sequence| WalRecord::Delete {
            sequence,
            key: key.to_vec(),
        })
    }

    /// Apply every op of `batch` atomically.
    pub fn batch_write(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return self.inner.check_open();
        }
        self.inner.metrics.batches_total.inc();
        self.inner.write(batch.payload_bytes(), |sequence| WalRecord::Batch {
            sequence,
            batch: batch.clone(),
        })
    }

    /// Write all `pairs` as one atomic batch.
    pub fn write_all<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let mut batch = WriteBatch::new();
        for (key, value) in pairs {
            batch.put(key, value);
        }
        self.batch_write(&batch)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.inner.get(key, None)
    }

    pub fn get_at(&self, key: &[u8], snapshot: &Snapshot) -> Result<Option<Value>> {
        self.inner.get(key, Some(snapshot.sequence))
    }

    /// Live pairs with `start <= key < end`, ascending.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<DbIterator> {
        self.inner.iter(KeyRange::new(start, end), None)
    }

    pub fn scan_at(&self, start: &[u8], end: &[u8], snapshot: &Snapshot) -> Result<DbIterator> {
        self.inner.iter(KeyRange::new(start, end), Some(snapshot.sequence))
    }

    /// Live pairs with `key >= start`, ascending.
    pub fn scan_from(&self, start: &[u8]) -> Result<DbIterator> {
        let range = KeyRange {
            start: Bound::Included(start.to_vec()),
            end: Bound::Unbounded,
        };
        self.inner.iter(range, None)
    }

    /// Every live pair, ascending.
    pub fn iter(&self) -> Result<DbIterator> {
        self.inner.iter(KeyRange::all(), None)
    }

    pub fn read_all(&self) -> Result<BTreeMap<Key, Value>> {
        self.iter()?.collect()
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        self.inner.check_open()?;
        let mut snapshots = self.inner.snapshots.lock();
        let sequence = self.inner.last_sequence.load(Ordering::Acquire);
        *snapshots.entry(sequence).or_insert(0) += 1;
        Ok(Snapshot {
            sequence,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Freeze the active memtable and write it, and anything else pending,
    /// to level 0 before returning.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_open()?;
        {
            let mut writer = self.inner.writer.lock();
            self.inner.freeze_active(&mut writer)?;
        }
        self.inner.flush_pending()?;
        if self.inner.options.background_work {
            self.inner.schedule(WorkerMessage::Compact)
        } else {
            self.inner.maybe_compact()
        }
    }

    /// Flush, then push every table overlapping `[start, end)` down to the
    /// deepest level holding data.
    pub fn compact_range(&self, start: &[u8], end: &[u8]) -> Result<CompactionStats> {
        self.flush()?;
        self.inner.compact_range(&KeyRange::new(start, end))
    }

    pub fn compact_all(&self) -> Result<CompactionStats> {
        self.flush()?;
        self.inner.compact_range(&KeyRange::all())
    }

    /// Table layout currently serving reads.
    pub fn current_version(&self) -> Arc<Version> {
        self.inner.levels.current()
    }

    pub fn level_summary(&self) -> Vec<LevelSummary> {
        self.inner.levels.level_summary()
    }

    pub fn stats(&self) -> EngineStats {
        let sv = self.inner.super_version();
        EngineStats {
            memtable_entries: sv.mem.len(),
            memtable_bytes: sv.mem.approx_size(),
            immutable_memtables: sv.imms.len(),
            immutable_memtable_entries: sv.imms.iter().map(|m| m.table.len()).sum(),
            num_sstables: sv.version.table_count(),
            levels: self.level_summary(),
            last_sequence: self.inner.last_sequence.load(Ordering::Acquire),
            live_snapshots: self.inner.snapshots.lock().values().sum(),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.refresh_gauges();
        Arc::clone(&self.inner.metrics)
    }

    /// Stop background work, cancelling a running compaction, and sync the
    /// WAL. Later calls return `Closed`; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        if let Some(tx) = self.inner.worker_tx.lock().take() {
            let _ = tx.send(WorkerMessage::Shutdown);
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("background worker panicked");
            }
        }

        self.inner.writer.lock().wal.sync()?;
        info!(path = ?self.inner.path, "closed database");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error while closing database");
        }
    }
}

impl DbInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn super_version(&self) -> Arc<SuperVersion> {
        Arc::clone(&self.super_version.read())
    }

    fn schedule(&self, message: WorkerMessage) -> Result<()> {
        if let Some(tx) = self.worker_tx.lock().as_ref() {
            tx.send(message)?;
        }
        Ok(())
    }

    /// Sequence numbers are assigned, logged and applied under the writer
    /// lock; the new `last_sequence` is published only after the memtable
    /// holds every entry of the record.
    fn write(&self, payload_bytes: usize, build: impl FnOnce(SequenceNumber) -> WalRecord) -> Result<()> {
        self.check_open()?;
        let start = Instant::now();

        let froze = {
            let mut writer = self.writer.lock();
            let record = build(writer.next_sequence);
            let last = record.last_sequence();
            writer.wal.append(&record, self.options.sync_writes)?;

            let mem = Arc::clone(&self.super_version.read().mem);
            apply_record(&mem, record)?;
            writer.next_sequence = last + 1;
            self.last_sequence.store(last, Ordering::Release);

            self.metrics.memtable_size_bytes.set(mem.approx_size() as u64);
            self.metrics.memtable_entries.set(mem.len() as u64);
            // Committed. A failed freeze is retried by the next write.
            if mem.approx_size() >= self.options.max_memtable_bytes {
                match self.freeze_active(&mut writer) {
                    Ok(froze) => froze,
                    Err(e) => {
                        self.metrics.background_errors.inc();
                        warn!(error = %e, "memtable freeze failed, will retry on next write");
                        false
                    }
                }
            } else {
                false
            }
        };

        self.metrics.writes_total.inc();
        self.metrics.writes_bytes.add(payload_bytes as u64);
        if froze {
            if let Err(e) = self.after_freeze() {
                self.metrics.background_errors.inc();
                warn!(error = %e, "flush after freeze failed");
            }
        }
        self.metrics.write_latency.observe_since(start);
        Ok(())
    }

    /// Freeze the active memtable behind a fresh one and start a new WAL
    /// segment. Returns false when there was nothing to freeze.
    fn freeze_active(&self, writer: &mut WriterState) -> Result<bool> {
        let mut slot = self.super_version.write();
        if slot.mem.is_empty() {
            return Ok(false);
        }

        let next_log = writer.wal.rotate()?;
        slot.mem.freeze();

        let mut imms = Vec::with_capacity(slot.imms.len() + 1);
        imms.push(ImmutableMemTable {
            table: Arc::clone(&slot.mem),
            next_log,
        });
        imms.extend(slot.imms.iter().cloned());

        debug!(
            entries = slot.mem.len(),
            bytes = slot.mem.approx_size(),
            pending = imms.len(),
            "froze memtable"
        );
        self.metrics.immutable_count.set(imms.len() as u64);
        self.metrics.memtable_size_bytes.set(0);
        self.metrics.memtable_entries.set(0);

        *slot = Arc::new(SuperVersion {
            mem: Arc::new(MemTable::new()),
            imms,
            version: Arc::clone(&slot.version),
        });
        Ok(true)
    }

    fn after_freeze(&self) -> Result<()> {
        if !self.options.background_work {
            self.flush_pending()?;
            return self.maybe_compact();
        }

        let pending = self.super_version.read().imms.len();
        if pending > MAX_PENDING_IMMUTABLES {
            // The worker is falling behind; flush on this thread.
            warn!(pending, "too many frozen memtables, flushing inline");
            self.flush_pending()?;
        }
        self.schedule(WorkerMessage::Flush)
    }

    /// Flush frozen memtables oldest first. Returns how many were flushed.
    fn flush_pending(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock();
        let mut flushed = 0;
        loop {
            let oldest = self.super_version.read().imms.last().cloned();
            match oldest {
                Some(imm) => self.flush_one(&imm)?,
                None => break,
            }
            flushed += 1;
        }
        Ok(flushed)
    }

    fn flush_one(&self, imm: &ImmutableMemTable) -> Result<()> {
        let start = Instant::now();
        let id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let table = write_table(&self.sst_dir, id, TableConfig::from(&self.options), &imm.table)?;

        let mut edit = VersionEdit {
            log_number: Some(imm.next_log),
            next_table_id: Some(self.next_table_id.load(Ordering::SeqCst)),
            last_sequence: Some(self.last_sequence.load(Ordering::Acquire)),
            ..VersionEdit::default()
        };
        let mut added = Vec::new();
        if let Some(table) = &table {
            edit.add_table(0, table.meta().clone());
            added.push((0, Arc::clone(table)));
        }

        let committed = self.commit(&edit, &[], added, |imms| {
            imms.retain(|m| !Arc::ptr_eq(&m.table, &imm.table));
        });
        if let Err(e) = committed {
            if let Some(table) = table {
                table.mark_obsolete();
            }
            return Err(e);
        }

        wal::remove_segments_before(&self.wal_dir, imm.next_log)?;

        let bytes = table.as_ref().map_or(0, |t| t.meta().file_size);
        self.metrics.flushes_total.inc();
        self.metrics.flush_bytes.add(bytes);
        self.metrics.flush_duration.observe_since(start);
        info!(
            table = id,
            entries = imm.table.len(),
            bytes,
            ms = start.elapsed().as_millis() as u64,
            "flushed memtable"
        );
        Ok(())
    }

    /// Log `edit`, then publish the matching version. `update_imms` may
    /// adjust the frozen memtable list in the same swap.
    fn commit(
        &self,
        edit: &VersionEdit,
        removed: &[(usize, u64)],
        added: Vec<(usize, Arc<TableHandle>)>,
        update_imms: impl FnOnce(&mut Vec<ImmutableMemTable>),
    ) -> Result<()> {
        let mut manifest = self.manifest.lock();
        let version = Arc::new(self.levels.current().apply(removed, added)?);
        manifest.log_edit(edit)?;
        self.levels.install(Arc::clone(&version));

        let _writer = self.writer.lock();
        let mut slot = self.super_version.write();
        let mut imms = slot.imms.clone();
        update_imms(&mut imms);
        self.metrics.immutable_count.set(imms.len() as u64);
        self.metrics.sstable_count.set(version.table_count() as u64);
        *slot = Arc::new(SuperVersion {
            mem: Arc::clone(&slot.mem),
            imms,
            version,
        });
        Ok(())
    }

    /// Oldest sequence any reader can still ask for.
    fn smallest_snapshot(&self) -> SequenceNumber {
        let snapshots = self.snapshots.lock();
        match snapshots.keys().next() {
            Some(&oldest) => oldest,
            None => self.last_sequence.load(Ordering::Acquire),
        }
    }

    /// Run automatic compactions until no level is over its trigger.
    fn maybe_compact(&self) -> Result<()> {
        let _guard = self.compaction_lock.lock();
        while !self.shutting_down.load(Ordering::Acquire) {
            match self.levels.pick_compaction_candidate() {
                Some(task) => {
                    self.run_task(&task, true)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn compact_range(&self, range: &KeyRange) -> Result<CompactionStats> {
        let _guard = self.compaction_lock.lock();
        let mut total = CompactionStats::default();

        let version = self.levels.current();
        let mut last_level = 1;
        for level in 1..version.num_levels() {
            if version
                .tables(level)
                .iter()
                .any(|t| range.overlaps(&t.meta().smallest_key, &t.meta().largest_key))
            {
                last_level = level;
            }
        }

        for level in 0..last_level {
            self.check_not_shutting_down()?;
            let version = self.levels.current();
            // L0 tables overlap each other, so they always go together.
            let inputs: Vec<_> = if level == 0 {
                version.tables(0).to_vec()
            } else {
                version
                    .tables(level)
                    .iter()
                    .filter(|t| range.overlaps(&t.meta().smallest_key, &t.meta().largest_key))
                    .cloned()
                    .collect()
            };
            if inputs.is_empty() {
                continue;
            }

            let task = CompactionTask::new(&version, level, inputs);
            let stats = self.run_task(&task, false)?;
            total.input_tables += stats.input_tables;
            total.input_bytes += stats.input_bytes;
            total.output_tables += stats.output_tables;
            total.output_bytes += stats.output_bytes;
            total.entries_merged += stats.entries_merged;
            total.duplicates_removed += stats.duplicates_removed;
            total.tombstones_dropped += stats.tombstones_dropped;
            total.duration_ms += stats.duration_ms;
        }
        Ok(total)
    }

    fn check_not_shutting_down(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn run_task(&self, task: &CompactionTask, allow_trivial_move: bool) -> Result<CompactionStats> {
        let start = Instant::now();

        if allow_trivial_move && task.is_trivial_move() {
            let table = &task.inputs[0];
            let mut edit = VersionEdit::default();
            edit.remove_table(task.level, table.id())
                .add_table(task.output_level(), table.meta().clone());
            self.commit(
                &edit,
                &[(task.level, table.id())],
                vec![(task.output_level(), Arc::clone(table))],
                |_| {},
            )?;

            self.metrics.trivial_moves.inc();
            info!(table = table.id(), from = task.level, to = task.output_level(), "moved table");
            return Ok(CompactionStats::default());
        }

        let version = self.levels.current();
        let ctx = CompactionContext {
            sst_dir: &self.sst_dir,
            table_config: TableConfig::from(&self.options),
            target_file_size: self.options.target_file_size,
            smallest_snapshot: self.smallest_snapshot(),
            version: &version,
            next_table_id: &self.next_table_id,
            cancel: &self.shutting_down,
        };
        let output = run_compaction(task, &ctx)?;

        let mut handles = Vec::with_capacity(output.tables.len());
        for meta in &output.tables {
            match TableHandle::open(table_path(&self.sst_dir, meta.id)) {
                Ok(handle) => handles.push(Arc::new(handle)),
                Err(e) => {
                    remove_tables(&self.sst_dir, &output.tables);
                    return Err(e);
                }
            }
        }

        let removed = task.removed();
        let mut edit = VersionEdit {
            removed: removed.clone(),
            next_table_id: Some(self.next_table_id.load(Ordering::SeqCst)),
            ..VersionEdit::default()
        };
        let output_level = task.output_level();
        for meta in &output.tables {
            edit.add_table(output_level, meta.clone());
        }
        let added = handles.iter().map(|h| (output_level, Arc::clone(h))).collect();

        if let Err(e) = self.commit(&edit, &removed, added, |_| {}) {
            for handle in &handles {
                handle.mark_obsolete();
            }
            return Err(e);
        }
        task.mark_inputs_obsolete();

        self.metrics.compactions_total.inc();
        self.metrics.compaction_bytes_in.add(output.stats.input_bytes);
        self.metrics.compaction_bytes_out.add(output.stats.output_bytes);
        self.metrics.tombstones_dropped.add(output.stats.tombstones_dropped as u64);
        self.metrics.compaction_duration.observe_since(start);
        Ok(output.stats)
    }

    /// Read point for a read without a snapshot. Loaded after the super
    /// version is pinned, so nothing it can see was compacted away.
    fn read_sequence(&self, snapshot: Option<SequenceNumber>) -> SequenceNumber {
        snapshot.unwrap_or_else(|| self.last_sequence.load(Ordering::Acquire))
    }

    fn get(&self, key: &[u8], snapshot: Option<SequenceNumber>) -> Result<Option<Value>> {
        self.check_open()?;
        let start = Instant::now();
        self.metrics.reads_total.inc();

        let sv = self.super_version();
        let sequence = self.read_sequence(snapshot);
        let mut found = sv.mem.get(key, sequence);
        if found.is_none() {
            found = sv.imms.iter().find_map(|imm| imm.table.get(key, sequence));
        }
        if found.is_none() {
            found = sv.version.get(key, sequence, &self.metrics)?;
        }

        let value = found.and_then(|entry| entry.value);
        if value.is_some() {
            self.metrics.reads_hits.inc();
        } else {
            self.metrics.reads_misses.inc();
        }
        self.metrics.read_latency.observe_since(start);
        Ok(value)
    }

    fn iter(&self, range: KeyRange, snapshot: Option<SequenceNumber>) -> Result<DbIterator> {
        self.check_open()?;
        self.metrics.scans_total.inc();

        let sv = self.super_version();
        let sequence = self.read_sequence(snapshot);
        let mut sources: Vec<EntryIter> = Vec::with_capacity(2 + sv.imms.len());
        sources.push(Box::new(sv.mem.scan(range.clone()).map(Ok)));
        for imm in &sv.imms {
            sources.push(Box::new(imm.table.scan(range.clone()).map(Ok)));
        }
        sources.extend(sv.version.iterators(&range));

        Ok(DbIterator::new(
            MergingIterator::new(sources),
            sequence,
            Arc::clone(&sv.version),
        ))
    }

    fn refresh_gauges(&self) {
        let sv = self.super_version();
        let wal_bytes = self.writer.lock().wal.total_size();
        self.metrics.wal_size_bytes.set(wal_bytes);
        self.metrics.disk_usage_bytes.set(sv.version.total_bytes() + wal_bytes);
        self.metrics.sstable_count.set(sv.version.table_count() as u64);
        self.metrics.immutable_count.set(sv.imms.len() as u64);
    }
}

fn remove_tables(sst_dir: &Path, tables: &[TableMeta]) {
    for meta in tables {
        let _ = std::fs::remove_file(table_path(sst_dir, meta.id));
    }
}

/// Delete table files the manifest does not reference.
fn remove_orphan_tables(sst_dir: &Path, live: &HashSet<u64>) -> Result<()> {
    let mut removed = 0;
    for entry in std::fs::read_dir(sst_dir)? {
        let path = entry?.path();
        if let Some(id) = parse_table_id(&path) {
            if !live.contains(&id) {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
    }
    if removed > 0 {
        info!(removed, "deleted orphan tables");
    }
    Ok(())
}

fn spawn_worker(inner: Arc<DbInner>, rx: Receiver<WorkerMessage>) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("levelkv-bg".into())
        .spawn(move || background_loop(inner, rx))?;
    Ok(handle)
}

/// Runs until `Shutdown`. A failed job is retried after a backoff delay;
/// any message arriving meanwhile runs the work right away.
fn background_loop(inner: Arc<DbInner>, rx: Receiver<WorkerMessage>) {
    let mut backoff = ExponentialBackoff::new();
    let mut retry_in = None;

    loop {
        let message = match retry_in {
            Some(delay) => match rx.recv_timeout(delay) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => WorkerMessage::Flush,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        let result = match message {
            WorkerMessage::Shutdown => break,
            WorkerMessage::Flush => inner.flush_pending().and_then(|_| inner.maybe_compact()),
            WorkerMessage::Compact => inner.maybe_compact(),
        };

        match result {
            Ok(()) => {
                backoff.reset();
                retry_in = None;
            }
            Err(_) if inner.shutting_down.load(Ordering::Acquire) => break,
            Err(e) => {
                inner.metrics.background_errors.inc();
                let delay = backoff.next();
                warn!(
                    error = %e,
                    attempt = backoff.attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    "background work failed"
                );
                retry_in = Some(delay);
            }
        }
    }
    debug!("background worker stopped");
}
