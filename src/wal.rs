//! Segmented Write-Ahead Log
//!
//! Every mutation is appended here before it touches the memtable.
//!
//! ## Layout
//!
//! - wal/000001.log ← covers an already flushed memtable, deleted
//! - wal/000002.log ← frozen memtable waiting for flush
//! - wal/000003.log ← active memtable, current writes
//!
//! A new segment starts every time the memtable is frozen. Once the flush of
//! that memtable is committed to the manifest, every segment below the
//! manifest's log number is deleted.
//!
//! ## Record format (little endian)
//!
//! ```text
//! [checksum:4][length:4][seq:8][op:1][key_len:4][key][value_len:4][value]
//! ```
//!
//! `length` counts the bytes after the length field and the CRC32 covers
//! `length` plus those bytes. A BATCH record has an empty key and carries the
//! encoded batch as its value.

use crate::batch::WriteBatch;
use crate::{OpType, Result, SequenceNumber, StorageError};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HEADER_SIZE: usize = 8;
const SEGMENT_EXTENSION: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Put {
        sequence: SequenceNumber,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        sequence: SequenceNumber,
        key: Vec<u8>,
    },
    /// `sequence` is the number of the first op; op `i` uses `sequence + i`.
    Batch {
        sequence: SequenceNumber,
        batch: WriteBatch,
    },
}

impl WalRecord {
    pub fn sequence(&self) -> SequenceNumber {
        match self {
            WalRecord::Put { sequence, .. }
            | WalRecord::Delete { sequence, .. }
            | WalRecord::Batch { sequence, .. } => *sequence,
        }
    }

    /// Highest sequence number this record consumes.
    pub fn last_sequence(&self) -> SequenceNumber {
        match self {
            WalRecord::Batch { sequence, batch } if !batch.is_empty() => {
                sequence + batch.len() as u64 - 1
            }
            other => other.sequence(),
        }
    }

    fn op_type(&self) -> OpType {
        match self {
            WalRecord::Put { .. } => OpType::Put,
            WalRecord::Delete { .. } => OpType::Delete,
            WalRecord::Batch { .. } => OpType::Batch,
        }
    }
}

/// Position just past an appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WalOffset {
    pub segment: u64,
    pub offset: u64,
}

pub struct Wal {
    dir: PathBuf,
    current_segment: WalSegment,
    segment_number: u64,
}

struct WalSegment {
    file: File,
    path: PathBuf,
    /// Scratch space reused for encoding records.
    buffer: BytesMut,
    bytes_written: u64,
}

impl Wal {
    /// Open the log in `dir`, appending to segment `segment_number`.
    pub fn open(dir: impl AsRef<Path>, segment_number: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let current_segment = WalSegment::open(&dir, segment_number)?;
        debug!(segment = segment_number, "opened WAL segment");

        Ok(Self {
            dir,
            current_segment,
            segment_number,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_number(&self) -> u64 {
        self.segment_number
    }

    /// Append a record. With `sync` the record is on stable storage when
    /// this returns; otherwise it has been handed to the OS.
    pub fn append(&mut self, record: &WalRecord, sync: bool) -> Result<WalOffset> {
        let offset = self.current_segment.append(record)?;
        if sync {
            self.current_segment.sync()?;
        }
        Ok(WalOffset {
            segment: self.segment_number,
            offset,
        })
    }

    /// Finish the current segment and start the next one. Returns the new
    /// segment number.
    pub fn rotate(&mut self) -> Result<u64> {
        self.current_segment.sync()?;

        let next = self.segment_number + 1;
        self.current_segment = WalSegment::open(&self.dir, next)?;
        self.segment_number = next;

        info!(segment = next, "rotated WAL");
        Ok(next)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.current_segment.sync()
    }

    /// Bytes across all live segments.
    pub fn total_size(&self) -> u64 {
        list_segments(&self.dir)
            .map(|segments| {
                segments
                    .iter()
                    .filter_map(|(_, path)| std::fs::metadata(path).ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

impl WalSegment {
    fn open(dir: &Path, segment_number: u64) -> Result<Self> {
        let path = segment_path(dir, segment_number);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();

        Ok(Self {
            file,
            path,
            buffer: BytesMut::with_capacity(4096),
            bytes_written,
        })
    }

    fn append(&mut self, record: &WalRecord) -> Result<u64> {
        self.buffer.clear();
        encode_record(record, &mut self.buffer)?;
        self.file.write_all(&self.buffer)?;
        self.bytes_written += self.buffer.len() as u64;
        Ok(self.bytes_written)
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

pub fn segment_path(dir: &Path, segment_number: u64) -> PathBuf {
    dir.join(format!("{:06}.{}", segment_number, SEGMENT_EXTENSION))
}

fn parse_segment_number(path: &Path) -> Option<u64> {
    if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Segments in `dir`, ascending by number.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(number) = parse_segment_number(&path) {
            segments.push((number, path));
        }
    }
    segments.sort_by_key(|(number, _)| *number);
    Ok(segments)
}

/// Delete segments numbered below `log_number`. Returns how many went.
pub fn remove_segments_before(dir: &Path, log_number: u64) -> Result<usize> {
    let mut deleted = 0;
    let mut reclaimed = 0u64;

    for (number, path) in list_segments(dir)? {
        if number >= log_number {
            break;
        }
        reclaimed += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        std::fs::remove_file(&path)?;
        deleted += 1;
    }

    if deleted > 0 {
        info!(segments = deleted, bytes = reclaimed, "WAL cleanup");
    }
    Ok(deleted)
}

/// Result of replaying the log.
#[derive(Debug, Default)]
pub struct WalReplay {
    pub records: Vec<WalRecord>,
    /// Set when replay stopped early at a damaged record.
    pub corruption: Option<String>,
}

/// Read every record of the segments numbered `min_segment` and up.
///
/// A torn final record in the newest segment is dropped silently. Any other
/// malformed record is a `Corruption` error.
pub fn read_all(dir: &Path, min_segment: u64) -> Result<Vec<WalRecord>> {
    let mut records = Vec::new();
    let segments: Vec<_> = list_segments(dir)?
        .into_iter()
        .filter(|(number, _)| *number >= min_segment)
        .collect();

    let last = segments.last().map(|(number, _)| *number);
    for (number, path) in &segments {
        read_segment(path, Some(*number) == last, &mut records)?;
    }
    Ok(records)
}

/// Replay for recovery. Unless `paranoid`, a damaged record ends the replay
/// instead of failing it, keeping everything read before it.
pub fn replay(dir: &Path, min_segment: u64, paranoid: bool) -> Result<WalReplay> {
    let mut replay = WalReplay::default();
    let segments: Vec<_> = list_segments(dir)?
        .into_iter()
        .filter(|(number, _)| *number >= min_segment)
        .collect();

    let last = segments.last().map(|(number, _)| *number);
    for (number, path) in &segments {
        debug!(segment = number, "replaying WAL segment");
        match read_segment(path, Some(*number) == last, &mut replay.records) {
            Ok(()) => {}
            Err(StorageError::Corruption(msg)) if !paranoid => {
                warn!(segment = number, error = %msg, "WAL corruption, truncating recovery");
                replay.corruption = Some(msg);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if !replay.records.is_empty() {
        info!(records = replay.records.len(), "recovered records from WAL");
    }
    Ok(replay)
}

fn read_segment(path: &Path, is_last: bool, records: &mut Vec<WalRecord>) -> Result<()> {
    let data = std::fs::read(path)?;
    let mut pos = 0usize;

    while pos < data.len() {
        let remaining = data.len() - pos;
        if remaining < HEADER_SIZE {
            return torn_tail(path, is_last, pos);
        }

        let mut header = &data[pos..pos + HEADER_SIZE];
        let checksum = header.get_u32_le();
        let length = header.get_u32_le() as usize;

        let end = match pos.checked_add(HEADER_SIZE + length) {
            Some(end) if end <= data.len() => end,
            _ => return torn_tail(path, is_last, pos),
        };

        let mut hasher = Hasher::new();
        hasher.update(&data[pos + 4..end]);
        let computed = hasher.finalize();

        if computed != checksum {
            if is_last && end == data.len() {
                // Partial write of the final record.
                debug!(path = ?path, offset = pos, "discarding torn WAL record");
                return Ok(());
            }
            return Err(StorageError::Corruption(format!(
                "Checksum mismatch in {:?} at offset {}: expected {}, got {}",
                path, pos, checksum, computed
            )));
        }

        records.push(decode_payload(&data[pos + HEADER_SIZE..end])?);
        pos = end;
    }

    Ok(())
}

fn torn_tail(path: &Path, is_last: bool, pos: usize) -> Result<()> {
    if is_last {
        debug!(path = ?path, offset = pos, "discarding truncated WAL tail");
        Ok(())
    } else {
        Err(StorageError::Corruption(format!(
            "Truncated record in sealed segment {:?} at offset {}",
            path, pos
        )))
    }
}

fn encode_record(record: &WalRecord, out: &mut BytesMut) -> Result<()> {
    let mut payload = BytesMut::new();
    payload.put_u64_le(record.sequence());
    payload.put_u8(record.op_type() as u8);

    match record {
        WalRecord::Put { key, value, .. } => {
            put_field(&mut payload, key)?;
            put_field(&mut payload, value)?;
        }
        WalRecord::Delete { key, .. } => {
            put_field(&mut payload, key)?;
            put_field(&mut payload, &[])?;
        }
        WalRecord::Batch { batch, .. } => {
            let mut body = BytesMut::new();
            batch.encode(&mut body);
            put_field(&mut payload, &[])?;
            put_field(&mut payload, &body)?;
        }
    }

    if payload.len() > u32::MAX as usize {
        return Err(StorageError::InvalidArgument("Record too large".into()));
    }
    let length = (payload.len() as u32).to_le_bytes();

    let mut hasher = Hasher::new();
    hasher.update(&length);
    hasher.update(&payload);
    let checksum = hasher.finalize();

    out.reserve(HEADER_SIZE + payload.len());
    out.put_u32_le(checksum);
    out.put_slice(&length);
    out.put_slice(&payload);
    Ok(())
}

fn put_field(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    if bytes.len() > u32::MAX as usize {
        return Err(StorageError::InvalidArgument("Field too long".into()));
    }
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
    Ok(())
}

fn decode_payload(mut buf: &[u8]) -> Result<WalRecord> {
    if buf.remaining() < 9 {
        return Err(StorageError::Corruption("Record payload too short".into()));
    }
    let sequence = buf.get_u64_le();
    let type_byte = buf.get_u8();
    let op_type = OpType::from_u8(type_byte)
        .ok_or_else(|| StorageError::Corruption(format!("Invalid op type: {}", type_byte)))?;

    let key = take_field(&mut buf, "key")?;
    let value = take_field(&mut buf, "value")?;
    if buf.has_remaining() {
        return Err(StorageError::Corruption("Trailing bytes in record".into()));
    }

    Ok(match op_type {
        OpType::Put => WalRecord::Put {
            sequence,
            key,
            value,
        },
        OpType::Delete => WalRecord::Delete { sequence, key },
        OpType::Batch => WalRecord::Batch {
            sequence,
            batch: WriteBatch::decode(&value)?,
        },
    })
}

fn take_field(buf: &mut &[u8], what: &str) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(StorageError::Corruption(format!("Truncated {} length", what)));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(StorageError::Corruption(format!("Truncated {}", what)));
    }
    let field = buf[..len].to_vec();
    buf.advance(len);
    Ok(field)
}
