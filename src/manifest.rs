//! MANIFEST: the durable list of live tables.
//!
//! The file is a sequence of framed records `[crc32:4][len:4][bincode]`.
//! The first record is always a full `Snapshot`; every flush or compaction
//! appends one `Edit`. After `snapshot_interval` edits the file is
//! rewritten as a single snapshot through `MANIFEST.tmp` and a rename, so a
//! crash leaves either the old or the new file, never a mix.

use crate::sstable::TableMeta;
use crate::{Result, SequenceNumber, StorageError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";
const FRAME_HEADER: usize = 8;

/// One atomic change to the table set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionEdit {
    pub added: Vec<(usize, TableMeta)>,
    /// (level, table id)
    pub removed: Vec<(usize, u64)>,
    pub log_number: Option<u64>,
    pub next_table_id: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
}

impl VersionEdit {
    pub fn add_table(&mut self, level: usize, meta: TableMeta) -> &mut Self {
        self.added.push((level, meta));
        self
    }

    pub fn remove_table(&mut self, level: usize, id: u64) -> &mut Self {
        self.removed.push((level, id));
        self
    }
}

/// Everything recorded in the manifest, folded to its latest state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestState {
    pub tables: Vec<(usize, TableMeta)>,
    /// WAL segments numbered below this are covered by tables.
    pub log_number: u64,
    pub next_table_id: u64,
    pub last_sequence: SequenceNumber,
}

impl Default for ManifestState {
    fn default() -> Self {
        ManifestState {
            tables: Vec::new(),
            log_number: 1,
            next_table_id: 1,
            last_sequence: 0,
        }
    }
}

impl ManifestState {
    pub fn apply(&mut self, edit: &VersionEdit) {
        for (level, id) in &edit.removed {
            self.tables
                .retain(|(l, meta)| !(*l == *level && meta.id == *id));
        }
        self.tables.extend(edit.added.iter().cloned());

        if let Some(log_number) = edit.log_number {
            self.log_number = self.log_number.max(log_number);
        }
        if let Some(next_table_id) = edit.next_table_id {
            self.next_table_id = self.next_table_id.max(next_table_id);
        }
        if let Some(last_sequence) = edit.last_sequence {
            self.last_sequence = self.last_sequence.max(last_sequence);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum ManifestRecord {
    Snapshot(ManifestState),
    Edit(VersionEdit),
}

pub struct Manifest {
    dir: PathBuf,
    file: File,
    state: ManifestState,
    edits_since_snapshot: usize,
    snapshot_interval: usize,
}

impl Manifest {
    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).exists()
    }

    /// Start a fresh manifest holding `state`.
    pub fn create(dir: impl AsRef<Path>, state: ManifestState, snapshot_interval: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let file = write_snapshot_file(&dir, &state)?;
        info!(dir = ?dir, "created manifest");
        Ok(Manifest {
            dir,
            file,
            state,
            edits_since_snapshot: 0,
            snapshot_interval,
        })
    }

    /// Load the manifest in `dir`. A torn final record is dropped and the
    /// file rewritten without it.
    pub fn open(dir: impl AsRef<Path>, snapshot_interval: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(MANIFEST_FILE);
        let data = std::fs::read(&path)?;

        let (records, torn) = read_frames(&data)?;
        let mut records = records.into_iter();
        let mut state = match records.next() {
            Some(ManifestRecord::Snapshot(state)) => state,
            Some(ManifestRecord::Edit(_)) => {
                return Err(StorageError::Corruption(
                    "manifest does not start with a snapshot".into(),
                ))
            }
            None => return Err(StorageError::Corruption("manifest is empty".into())),
        };

        let mut edits = 0;
        for record in records {
            match record {
                ManifestRecord::Edit(edit) => state.apply(&edit),
                ManifestRecord::Snapshot(snapshot) => state = snapshot,
            }
            edits += 1;
        }
        debug!(edits, tables = state.tables.len(), "loaded manifest");

        let mut manifest = Manifest {
            file: OpenOptions::new().append(true).open(&path)?,
            dir,
            state,
            edits_since_snapshot: edits,
            snapshot_interval,
        };
        if torn {
            warn!("manifest had a torn final record, rewriting");
            manifest.rewrite()?;
        }
        Ok(manifest)
    }

    pub fn state(&self) -> &ManifestState {
        &self.state
    }

    /// Durably record `edit`. Returns once the edit is fsynced.
    pub fn log_edit(&mut self, edit: &VersionEdit) -> Result<()> {
        let mut frame = BytesMut::new();
        encode_frame(&ManifestRecord::Edit(edit.clone()), &mut frame)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;

        self.state.apply(edit);
        self.edits_since_snapshot += 1;

        if self.edits_since_snapshot >= self.snapshot_interval {
            self.rewrite()?;
        }
        Ok(())
    }

    /// Replace the file with one snapshot of the current state.
    pub fn rewrite(&mut self) -> Result<()> {
        self.file = write_snapshot_file(&self.dir, &self.state)?;
        debug!(
            edits = self.edits_since_snapshot,
            tables = self.state.tables.len(),
            "rewrote manifest snapshot"
        );
        self.edits_since_snapshot = 0;
        Ok(())
    }
}

fn write_snapshot_file(dir: &Path, state: &ManifestState) -> Result<File> {
    let tmp = dir.join(MANIFEST_TMP_FILE);
    let path = dir.join(MANIFEST_FILE);

    let mut frame = BytesMut::new();
    encode_frame(&ManifestRecord::Snapshot(state.clone()), &mut frame)?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&frame)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &path)?;
    // Persist the rename itself; not every platform can open a directory.
    if let Ok(dir) = File::open(dir) {
        let _ = dir.sync_all();
    }

    Ok(OpenOptions::new().append(true).open(&path)?)
}

fn encode_frame(record: &ManifestRecord, out: &mut BytesMut) -> Result<()> {
    let body = bincode::serialize(record)?;
    out.put_u32_le(crc32fast::hash(&body));
    out.put_u32_le(body.len() as u32);
    out.put_slice(&body);
    Ok(())
}

/// Decode every frame. The flag is set when the final frame was torn.
fn read_frames(data: &[u8]) -> Result<(Vec<ManifestRecord>, bool)> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        if data.len() - pos < FRAME_HEADER {
            return Ok((records, true));
        }
        let mut header = &data[pos..pos + FRAME_HEADER];
        let checksum = header.get_u32_le();
        let len = header.get_u32_le() as usize;
        let end = pos + FRAME_HEADER + len;
        if end > data.len() {
            return Ok((records, true));
        }

        let body = &data[pos + FRAME_HEADER..end];
        if crc32fast::hash(body) != checksum {
            if end == data.len() {
                return Ok((records, true));
            }
            return Err(StorageError::Corruption(format!(
                "manifest checksum mismatch at offset {}",
                pos
            )));
        }
        records.push(bincode::deserialize(body)?);
        pos = end;
    }
    Ok((records, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(id: u64, smallest: &str, largest: &str) -> TableMeta {
        TableMeta {
            id,
            file_size: 100,
            entry_count: 2,
            tombstone_count: 0,
            smallest_key: smallest.as_bytes().to_vec(),
            largest_key: largest.as_bytes().to_vec(),
            min_sequence: 1,
            max_sequence: 2,
        }
    }

    #[test]
    fn test_edits_survive_reopen() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut manifest = Manifest::create(dir.path(), ManifestState::default(), 64)?;
            let mut edit = VersionEdit {
                log_number: Some(3),
                next_table_id: Some(2),
                last_sequence: Some(10),
                ..VersionEdit::default()
            };
            edit.add_table(0, meta(1, "a", "m"));
            manifest.log_edit(&edit)?;

            let mut compaction = VersionEdit {
                next_table_id: Some(3),
                ..VersionEdit::default()
            };
            compaction.remove_table(0, 1).add_table(1, meta(2, "a", "m"));
            manifest.log_edit(&compaction)?;
        }

        let manifest = Manifest::open(dir.path(), 64)?;
        let state = manifest.state();
        assert_eq!(state.tables, vec![(1, meta(2, "a", "m"))]);
        assert_eq!(state.log_number, 3);
        assert_eq!(state.next_table_id, 3);
        assert_eq!(state.last_sequence, 10);
        Ok(())
    }

    #[test]
    fn test_snapshot_rewrite_after_interval() -> Result<()> {
        let dir = tempdir()?;
        let mut manifest = Manifest::create(dir.path(), ManifestState::default(), 2)?;
        for id in 1..=5 {
            let mut edit = VersionEdit::default();
            edit.add_table(0, meta(id, "a", "b"));
            manifest.log_edit(&edit)?;
        }
        drop(manifest);

        let data = std::fs::read(dir.path().join(MANIFEST_FILE))?;
        let (records, torn) = read_frames(&data)?;
        assert!(!torn);
        // Last rewrite after edit 4, then edit 5 appended.
        assert_eq!(records.len(), 2);
        assert!(!dir.path().join(MANIFEST_TMP_FILE).exists());

        assert_eq!(Manifest::open(dir.path(), 2)?.state().tables.len(), 5);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_dropped() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut manifest = Manifest::create(dir.path(), ManifestState::default(), 64)?;
            let mut edit = VersionEdit::default();
            edit.add_table(0, meta(1, "a", "b"));
            manifest.log_edit(&edit)?;
        }
        let path = dir.path().join(MANIFEST_FILE);
        let len = std::fs::metadata(&path)?.len();
        OpenOptions::new().write(true).open(&path)?.set_len(len - 3)?;

        let manifest = Manifest::open(dir.path(), 64)?;
        assert!(manifest.state().tables.is_empty());
        Ok(())
    }
}
