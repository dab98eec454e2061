use clap::Parser;
use levelkv::{Database, Options, Result};
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut options = match &cli.config {
        Some(path) => Options::from_json_file(path)?,
        None => Options::default(),
    };
    if let Some(bytes) = cli.memtable_max_size {
        options = options.max_memtable_bytes(bytes);
    }
    // One-shot process: do flush and compaction on this thread.
    options = options.background_work(false);

    let db = Database::open(&cli.db_path, options)?;

    match cli.command {
        Commands::Put { key, value } => commands::kv::put(&db, &key, &value)?,
        Commands::Get { key } => commands::kv::get(&db, &key)?,
        Commands::Delete { key } => commands::kv::delete(&db, &key)?,
        Commands::Scan { start, end, limit } => {
            commands::kv::scan(&db, &start, end.as_deref(), limit)?
        }
        Commands::Compact => commands::admin::compact(&db)?,
        Commands::Stats { format } => commands::admin::show_stats(&db, format)?,
    }

    db.close()
}
