mod args;
mod format;

use std::process;

use anyhow::{Context, Result};
use args::{Args, Command};
use clap::Parser;
use format::ByteMode;
use kestrel_common::config::KvConfig;
use kestrel_storage::KeyValueDb;
use tracing::debug;

fn main() {
    if let Err(e) = run() {
        eprintln!("kestrel: error: {:#}", e);
        process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<KvConfig> {
    let mut config = match &args.config {
        Some(path) => KvConfig::load(path)
            .with_context(|| format!("Cannot load config: {}", path.display()))?,
        None => KvConfig::default(),
    };
    if let Some(dir) = &args.dir {
        config.storage.dir = dir.clone();
    }
    // One-shot commands compact explicitly.
    config.compaction.background = false;
    Ok(config)
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    debug!(dir = %config.storage.dir.display(), "opening store");
    let db = KeyValueDb::open(config).context("Could not open store")?;
    let bytes = ByteMode::from_flag(args.hex);

    match &args.command {
        Command::Stats => {
            let stats = db.stats();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", stats);
            }
        }
        Command::Get { key } => {
            let tr = db.start_read_only_transaction();
            match tr.get(&bytes.parse(key)?)? {
                Some(value) => println!("{}", bytes.render(&value)),
                None => anyhow::bail!("key not found: {}", key),
            }
        }
        Command::Scan {
            prefix,
            limit,
            keys_only,
        } => {
            let mut tr = db.start_read_only_transaction();
            if let Some(prefix) = prefix {
                tr.set_key_prefix(&bytes.parse(prefix)?);
            }
            let limit = limit.unwrap_or(u64::MAX) as usize;
            let mut rows = Vec::new();
            for entry in tr.iter().take(limit) {
                let (key, value) = entry?;
                rows.push((bytes.render(&key), bytes.render(&value)));
            }
            if args.json {
                let out: Vec<serde_json::Value> = rows
                    .into_iter()
                    .map(|(k, v)| {
                        if *keys_only {
                            serde_json::json!({ "key": k })
                        } else {
                            serde_json::json!({ "key": k, "value": v })
                        }
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for (k, v) in rows {
                    if *keys_only {
                        println!("{}", k);
                    } else {
                        println!("{}\t{}", k, v);
                    }
                }
            }
        }
        Command::Put { key, value } => {
            let mut tr = db.start_write_transaction().wait()?;
            let created = tr.create_or_update(&bytes.parse(key)?, &bytes.parse(value)?)?;
            tr.commit()?;
            println!("{}", if created { "created" } else { "updated" });
        }
        Command::Erase { key } => {
            let mut tr = db.start_write_transaction().wait()?;
            let erased = tr.erase_one(&bytes.parse(key)?)?;
            tr.commit()?;
            println!("{}", if erased { "erased" } else { "not found" });
        }
        Command::EraseRange { first, last } => {
            let mut tr = db.start_write_transaction().wait()?;
            let erased = tr.erase_range(&bytes.parse(first)?, &bytes.parse(last)?)?;
            tr.commit()?;
            println!("erased {}", erased);
        }
        Command::Compact => {
            let report = db.compact()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
        }
    }
    db.close()?;
    Ok(())
}
