use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// kestrel: inspect and maintain a Kestrel key-value store
#[derive(Debug, Parser)]
#[command(name = "kestrel", about = "Inspect and maintain a Kestrel key-value store", version)]
pub struct Args {
    /// Store directory (overrides `storage.dir` from the config file)
    #[arg(short = 'd', long, env = "KESTREL_DIR")]
    pub dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short = 'c', long, env = "KESTREL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Keys and values on the command line and in output are hex encoded
    #[arg(long, global = true)]
    pub hex: bool,

    /// JSON output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Key count and per-file statistics
    Stats,
    /// Print the value stored under a key
    Get { key: String },
    /// List keys (and values) in order
    Scan {
        /// Only keys starting with this prefix
        #[arg(short, long)]
        prefix: Option<String>,
        /// Stop after this many entries
        #[arg(short, long)]
        limit: Option<u64>,
        /// Print keys only
        #[arg(long)]
        keys_only: bool,
    },
    /// Insert or overwrite a key
    Put { key: String, value: String },
    /// Erase a key
    Erase { key: String },
    /// Erase every key in the inclusive range FIRST..=LAST
    EraseRange { first: String, last: String },
    /// Run one compaction pass
    Compact,
}
