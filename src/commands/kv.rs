//! Key-value commands
//!
//! Provides PUT/GET/DELETE/SCAN against a local database directory

use levelkv::{Database, Result};

/// Execute a PUT command
pub fn put(db: &Database, key: &str, value: &str) -> Result<()> {
    db.put(key.as_bytes(), value.as_bytes())?;
    println!("OK");
    Ok(())
}

/// Execute a GET command
pub fn get(db: &Database, key: &str) -> Result<()> {
    match db.get(key.as_bytes())? {
        Some(value) => println!("{}", String::from_utf8_lossy(&value)),
        None => println!("(not found)"),
    }
    Ok(())
}

/// Execute a DELETE command
pub fn delete(db: &Database, key: &str) -> Result<()> {
    db.delete(key.as_bytes())?;
    println!("OK");
    Ok(())
}

/// Print live pairs in `[start, end)`, or from `start` onwards when `end`
/// is omitted.
pub fn scan(db: &Database, start: &str, end: Option<&str>, limit: Option<usize>) -> Result<()> {
    let pairs = match end {
        Some(end) => db.scan(start.as_bytes(), end.as_bytes())?,
        None => db.scan_from(start.as_bytes())?,
    };

    let mut count = 0;
    for pair in pairs.take(limit.unwrap_or(usize::MAX)) {
        let (key, value) = pair?;
        println!(
            "{} = {}",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&value)
        );
        count += 1;
    }
    println!("({} pairs)", count);
    Ok(())
}
