use levelkv::wal::{self, Wal};
use levelkv::{recover, Database, Options, Result, StorageError, WalRecord, WriteBatch};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn inline_options() -> Options {
    Options::default().background_work(false)
}

fn newest_segment(db_path: &Path) -> Result<PathBuf> {
    let segments = wal::list_segments(&db_path.join("wal"))?;
    Ok(segments.last().map(|(_, path)| path.clone()).unwrap())
}

#[test]
fn test_crash_recovery_from_wal() -> Result<()> {
    let dir = tempdir()?;

    {
        let db = Database::open(dir.path(), inline_options().sync_writes(true))?;
        db.put(b"a", b"1")?;
        db.put(b"a", b"2")?;
        db.put(b"b", b"x")?;
        db.delete(b"b")?;
        // Dropped without a flush: only the WAL holds these writes.
    }

    let db = Database::open(dir.path(), inline_options())?;
    assert_eq!(db.get(b"a")?, Some(b"2".to_vec()));
    assert_eq!(db.get(b"b")?, None);
    assert_eq!(db.stats().last_sequence, 4);

    // New writes continue the sequence.
    db.put(b"c", b"3")?;
    assert_eq!(db.stats().last_sequence, 5);
    Ok(())
}

#[test]
fn test_recovery_with_tables_and_wal() -> Result<()> {
    let dir = tempdir()?;

    {
        let db = Database::open(dir.path(), inline_options())?;
        for i in 0..100 {
            db.put(format!("key{:03}", i).as_bytes(), b"flushed")?;
        }
        db.flush()?;
        for i in 50..150 {
            db.put(format!("key{:03}", i).as_bytes(), b"logged")?;
        }
        db.close()?;
    }

    let db = Database::open(dir.path(), inline_options())?;
    assert_eq!(db.get(b"key010")?, Some(b"flushed".to_vec()));
    assert_eq!(db.get(b"key060")?, Some(b"logged".to_vec()));
    assert_eq!(db.get(b"key149")?, Some(b"logged".to_vec()));
    assert_eq!(db.read_all()?.len(), 150);
    Ok(())
}

#[test]
fn test_repeated_reopen_is_stable() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Database::open(dir.path(), inline_options())?;
        db.put(b"k", b"v")?;
    }

    for _ in 0..3 {
        let db = Database::open(dir.path(), inline_options())?;
        assert_eq!(db.get(b"k")?, Some(b"v".to_vec()));
        assert_eq!(db.stats().last_sequence, 1);
        assert_eq!(db.stats().num_sstables, 1);
    }
    Ok(())
}

#[test]
fn test_batch_survives_recovery() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Database::open(dir.path(), inline_options())?;
        let mut batch = WriteBatch::new();
        batch.put(b"x".to_vec(), b"1".to_vec()).put(b"y".to_vec(), b"2".to_vec());
        db.batch_write(&batch)?;
    }

    let db = Database::open(dir.path(), inline_options())?;
    assert_eq!(db.get(b"x")?, Some(b"1".to_vec()));
    assert_eq!(db.get(b"y")?, Some(b"2".to_vec()));
    assert_eq!(db.stats().last_sequence, 2);
    Ok(())
}

#[test]
fn test_torn_wal_tail_is_ignored() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Database::open(dir.path(), inline_options())?;
        db.put(b"a", b"1")?;
        db.put(b"b", b"2")?;
    }

    let segment = newest_segment(dir.path())?;
    let mut file = OpenOptions::new().append(true).open(&segment)?;
    file.write_all(&[0x13, 0x37, 0x00])?;
    drop(file);

    let db = Database::open(dir.path(), inline_options())?;
    assert_eq!(db.get(b"a")?, Some(b"1".to_vec()));
    assert_eq!(db.get(b"b")?, Some(b"2".to_vec()));
    Ok(())
}

#[test]
fn test_mid_log_corruption() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Database::open(dir.path(), inline_options())?;
        db.put(b"a", b"1")?;
        db.put(b"b", b"2")?;
        db.put(b"c", b"3")?;
    }

    // Each record here is 27 bytes; damage the value of the second one.
    let segment = newest_segment(dir.path())?;
    let mut file = OpenOptions::new().write(true).open(&segment)?;
    file.seek(SeekFrom::Start(27 + 26))?;
    file.write_all(b"#")?;
    drop(file);

    let strict = Database::open(dir.path(), inline_options().paranoid_checks(true));
    assert!(matches!(strict, Err(ref e) if e.is_corruption()));

    let db = Database::open(dir.path(), inline_options())?;
    assert_eq!(db.get(b"a")?, Some(b"1".to_vec()));
    assert_eq!(db.get(b"b")?, None);
    assert_eq!(db.get(b"c")?, None);
    Ok(())
}

#[test]
fn test_recover_from_wal_only() -> Result<()> {
    let dir = tempdir()?;
    {
        let mut log = Wal::open(dir.path(), 1)?;
        log.append(
            &WalRecord::Put {
                sequence: 1,
                key: b"k".to_vec(),
                value: b"v1".to_vec(),
            },
            false,
        )?;
        log.rotate()?;
        log.append(
            &WalRecord::Put {
                sequence: 2,
                key: b"k".to_vec(),
                value: b"v2".to_vec(),
            },
            true,
        )?;
    }

    let recovered = recover(dir.path(), 1, true)?;
    assert_eq!(recovered.records, 2);
    assert_eq!(recovered.last_sequence, 2);
    assert!(recovered.corruption.is_none());
    let newest = recovered.memtable.get(b"k", u64::MAX).unwrap();
    assert_eq!(newest.value, Some(b"v2".to_vec()));

    // Segments below the log number are already covered by tables.
    let tail = recover(dir.path(), 2, true)?;
    assert_eq!(tail.records, 1);
    Ok(())
}

#[test]
fn test_orphan_tables_are_removed_on_open() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Database::open(dir.path(), inline_options())?;
        db.put(b"k", b"v")?;
        db.flush()?;
    }

    let orphan = dir.path().join("sst").join("999999.sst");
    std::fs::write(&orphan, b"leftover from an interrupted compaction")?;

    let db = Database::open(dir.path(), inline_options())?;
    assert!(!orphan.exists());
    assert_eq!(db.get(b"k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn test_missing_database_without_create() {
    let dir = tempdir().unwrap();
    let result = Database::open(dir.path().join("nope"), Options::default().create_if_missing(false));
    assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
}
