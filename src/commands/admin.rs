//! Maintenance commands: manual compaction and status output

use crate::cli::OutputFormat;
use levelkv::{Database, Result};

/// Flush and compact the whole key space
pub fn compact(db: &Database) -> Result<()> {
    let stats = db.compact_all()?;
    println!("Compaction finished");
    println!("Input tables       : {}", stats.input_tables);
    println!("Output tables      : {}", stats.output_tables);
    println!("Bytes in / out     : {} / {}", stats.input_bytes, stats.output_bytes);
    println!("Duplicates removed : {}", stats.duplicates_removed);
    println!("Tombstones dropped : {}", stats.tombstones_dropped);
    println!("Duration           : {} ms", stats.duration_ms);
    Ok(())
}

pub fn show_stats(db: &Database, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => show_stats_text(db),
        OutputFormat::Json => show_stats_json(db),
    }
}

fn show_stats_text(db: &Database) -> Result<()> {
    let stats = db.stats();

    println!("Database           : {:?}", db.path());
    println!("Last sequence      : {}", stats.last_sequence);
    println!("Memtable           : {} entries, {} bytes", stats.memtable_entries, stats.memtable_bytes);
    println!("Frozen memtables   : {}", stats.immutable_memtables);
    println!("Tables             : {}", stats.num_sstables);
    println!();
    println!("Level  Tables        Bytes");
    for level in &stats.levels {
        println!("L{:<5} {:>6} {:>12}", level.level, level.tables, level.bytes);
    }
    println!();
    print!("{}", db.metrics().summary());
    Ok(())
}

fn show_stats_json(db: &Database) -> Result<()> {
    let stats = db.stats();
    let metrics = db.metrics();

    let levels: Vec<_> = stats
        .levels
        .iter()
        .map(|l| serde_json::json!({ "level": l.level, "tables": l.tables, "bytes": l.bytes }))
        .collect();
    let report = serde_json::json!({
        "path": db.path(),
        "last_sequence": stats.last_sequence,
        "memtable_entries": stats.memtable_entries,
        "memtable_bytes": stats.memtable_bytes,
        "immutable_memtables": stats.immutable_memtables,
        "sstables": stats.num_sstables,
        "levels": levels,
        "disk_usage_bytes": metrics.disk_usage_bytes.get(),
        "wal_size_bytes": metrics.wal_size_bytes.get(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
