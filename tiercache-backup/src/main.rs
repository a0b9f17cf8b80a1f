//! tiercache Backup Tool
//!
//! Offline inspection of a backup directory: list chains, verify
//! checksums, export a point-in-time keyspace and prune expired backups.
//! Works without a running server.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tiercache_server::backup::{LocalStorage, RestoreTarget};
use tiercache_server::config::{LogFormat, LoggingConfig};
use tiercache_server::logging::init_logging;
use tracing::info;

mod export;
mod inspect;
mod prune;
mod verify;

#[derive(Parser)]
#[command(name = "tiercache-backup")]
#[command(about = "Inspect, verify, export and prune tiercache backups", long_about = None)]
#[command(version)]
struct Cli {
    /// Backup directory (backup.directory in the server config)
    #[arg(short, long, global = true, default_value = "./data/backups")]
    dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List backups, oldest first
    List {
        /// Print manifests as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one manifest and the chain needed to restore it
    Inspect {
        /// Backup id
        id: String,
    },

    /// Check stored data against manifest checksums
    Verify {
        /// Backup id (default: every backup)
        id: Option<String>,
    },

    /// Materialize a backup chain and write the keyspace as JSON lines
    Export {
        /// Backup id (default: newest)
        #[arg(long, conflicts_with = "at")]
        id: Option<String>,

        /// Newest backup at or before this RFC 3339 instant
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write stored envelopes instead of decompressed values
        #[arg(long)]
        raw: bool,
    },

    /// Delete backups past retention that nothing depends on
    Prune {
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

fn restore_target(id: Option<String>, at: Option<DateTime<Utc>>) -> RestoreTarget {
    match (id, at) {
        (Some(id), _) => RestoreTarget::Manifest(id),
        (None, Some(at)) => RestoreTarget::PointInTime(at),
        (None, None) => RestoreTarget::Latest,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        level: if cli.verbose { "debug" } else { "warn" }.to_string(),
        format: LogFormat::Pretty,
    });

    let storage = LocalStorage::open(&cli.dir)
        .await
        .with_context(|| format!("Failed to open backup directory {:?}", cli.dir))?;

    match cli.command {
        Commands::List { json } => {
            let listing = inspect::list(&storage, json).await?;
            print!("{}", listing);
        }

        Commands::Inspect { id } => {
            let details = inspect::inspect(&storage, &id).await?;
            print!("{}", details);
        }

        Commands::Verify { id } => {
            let summary = verify::verify(&storage, id.as_deref()).await?;
            println!("{}", summary);
            summary.into_result()?;
        }

        Commands::Export {
            id,
            at,
            output,
            raw,
        } => {
            let target = restore_target(id, at);
            info!("Exporting {:?}", target);
            let stats = match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {:?}", path))?;
                    export::export(&storage, &target, raw, std::io::BufWriter::new(file)).await?
                }
                None => export::export(&storage, &target, raw, std::io::stdout().lock()).await?,
            };
            eprintln!("{}", stats);
        }

        Commands::Prune { dry_run } => {
            let ids = prune::prune(&storage, dry_run).await?;
            let verb = if dry_run { "Would delete" } else { "Deleted" };
            println!("{} {} backup(s)", verb, ids.len());
            for id in ids {
                println!("  {}", id);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_support {
    use std::sync::Arc;
    use tiercache_server::backup::{BackupConfig, BackupManager, LocalStorage};
    use tiercache_server::cache::{L2Backend, MemoryL2, TieredCache, TieredCacheConfig};
    use tiercache_server::compression::CompressionConfig;

    /// Cache plus manager writing into `dir`
    pub async fn manager(dir: &std::path::Path, retention_days: u32) -> (Arc<TieredCache>, BackupManager) {
        let cache = Arc::new(TieredCache::new(
            TieredCacheConfig::default(),
            Arc::new(MemoryL2::new()) as Arc<dyn L2Backend>,
            CompressionConfig::default(),
        ));
        let storage = Arc::new(LocalStorage::open(dir).await.unwrap());
        let config = BackupConfig {
            retention_days,
            directory: dir.to_path_buf(),
            ..Default::default()
        };
        (cache.clone(), BackupManager::new(config, cache, storage))
    }
}
