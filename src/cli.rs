//! Command-line interface definitions
//!
//! Defines all CLI commands and arguments using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// levelkv - embedded LSM key-value store
#[derive(Parser, Debug)]
#[command(name = "levelkv")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database directory
    #[arg(short, long, global = true, value_name = "PATH", default_value = "./levelkv-data")]
    pub db_path: PathBuf,

    /// Options file (JSON); fields left out keep their defaults
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Memtable size in bytes before it is flushed to disk
    #[arg(short, long, global = true, value_name = "BYTES")]
    pub memtable_max_size: Option<usize>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Put a key-value pair
    Put {
        /// Key to store
        key: String,

        /// Value to store
        value: String,
    },

    /// Get a value by key
    Get {
        /// Key to retrieve
        key: String,
    },

    /// Delete a key
    Delete {
        /// Key to delete
        key: String,
    },

    /// List live pairs with start <= key < end
    Scan {
        /// First key of the range
        #[arg(default_value = "")]
        start: String,

        /// End of the range (exclusive); scans to the last key when omitted
        end: Option<String>,

        /// Stop after this many pairs
        #[arg(long, short = 'l')]
        limit: Option<usize>,
    },

    /// Flush the memtable and compact every level
    Compact,

    /// Show level layout and engine metrics
    Stats {
        #[arg(long, short = 'f', value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

/// Output format for status commands
#[derive(Debug, Clone, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_put() {
        let cli = Cli::parse_from(["levelkv", "put", "user:1", "alice"]);

        match cli.command {
            Commands::Put { key, value } => {
                assert_eq!(key, "user:1");
                assert_eq!(value, "alice");
            }
            _ => panic!("Expected Put command"),
        }
        assert_eq!(cli.db_path, PathBuf::from("./levelkv-data"));
    }

    #[test]
    fn test_parse_global_options() {
        let cli = Cli::parse_from([
            "levelkv",
            "get",
            "my.key",
            "--db-path",
            "/data/kv",
            "--memtable-max-size",
            "65536",
        ]);

        assert_eq!(cli.db_path, PathBuf::from("/data/kv"));
        assert_eq!(cli.memtable_max_size, Some(65536));
        match cli.command {
            Commands::Get { key } => assert_eq!(key, "my.key"),
            _ => panic!("Expected Get command"),
        }
    }

    #[test]
    fn test_parse_scan_defaults() {
        let cli = Cli::parse_from(["levelkv", "scan"]);

        match cli.command {
            Commands::Scan { start, end, limit } => {
                assert_eq!(start, "");
                assert!(end.is_none());
                assert!(limit.is_none());
            }
            _ => panic!("Expected Scan command"),
        }
    }

    #[test]
    fn test_parse_stats_format() {
        let cli = Cli::parse_from(["levelkv", "stats", "--format", "json"]);

        match cli.command {
            Commands::Stats { format } => assert!(matches!(format, OutputFormat::Json)),
            _ => panic!("Expected Stats command"),
        }
    }
}
