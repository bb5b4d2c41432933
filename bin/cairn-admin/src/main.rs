//! Cairn Admin - Offline shard administration
//!
//! Opens a single shard directly from its configuration and runs one
//! maintenance operation on it.

use anyhow::{Context, Result, bail};
use cairn_common::{EpochCounter, Mode, ShardConfig};
use cairn_storage::{Shard, ShardInfo};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cairn-admin")]
#[command(about = "Cairn shard administration tool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cairn/shard.toml")]
    config: PathBuf,

    /// Shard root directory, overrides the component paths of the config
    #[arg(long)]
    root: Option<PathBuf>,

    /// Current epoch, used to decide expiration
    #[arg(long, default_value_t = 0)]
    epoch: u64,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write every stored object to a new dump file
    Dump {
        /// Output file, must not exist
        path: PathBuf,
        /// Skip unreadable objects instead of failing
        #[arg(long)]
        ignore_errors: bool,
    },
    /// Put every object of a dump file into the shard
    Restore {
        /// Dump file
        path: PathBuf,
        /// Skip bad records instead of failing
        #[arg(long)]
        ignore_errors: bool,
    },
    /// Print physical and logical object counters
    Counters,
    /// Rebuild the metabase from blob store contents
    Resync,
    /// Print shard state
    Info,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    shard: ShardConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&config_str).with_context(|| format!("parsing {}", path.display()))
}

fn start_shard(mut config: ShardConfig, mode: Mode, epoch: u64) -> Result<Shard> {
    config.mode = mode;
    let shard = Shard::new(config, Arc::new(EpochCounter::new(epoch)))?;
    shard.open()?;
    shard.init()?;
    Ok(shard)
}

/// Like [`start_shard`] but refuses a degraded fallback mode
fn open_shard(config: ShardConfig, mode: Mode, epoch: u64) -> Result<Shard> {
    let shard = start_shard(config, mode, epoch)?;
    if shard.mode() != mode {
        bail!("shard came up in {} mode, {mode} required", shard.mode());
    }
    Ok(shard)
}

fn print_info(info: &ShardInfo) {
    println!("Shard");
    println!("=====");
    println!("Mode: {}", info.mode);
    if let Some(counters) = &info.counters {
        println!("Objects: {} physical, {} logical", counters.phy, counters.logic);
    }
    match &info.metabase {
        Some(mb) => println!(
            "Metabase: {} (version {})",
            mb.path.display(),
            mb.version.map_or_else(|| "unset".to_string(), |v| v.to_string())
        ),
        None => println!("Metabase: unavailable"),
    }
    for storage in &info.blobstor {
        let limit = storage
            .max_object_size
            .map_or_else(|| "any size".to_string(), |max| format!("up to {max} bytes"));
        println!("Blob store: {:?} {} ({limit})", storage.kind, storage.path.display());
    }
    if let Some(wc) = &info.writecache {
        println!(
            "Write-cache: {} ({} objects, {}/{} bytes{})",
            wc.path.display(),
            wc.objects,
            wc.used_bytes,
            wc.capacity_bytes,
            if wc.read_only { ", read-only" } else { "" }
        );
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args.config)?;

    // CLI takes precedence
    let log_level = args.log_level.unwrap_or(config.logging.level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut shard_config = config.shard;
    if let Some(root) = &args.root {
        let rooted = ShardConfig::with_root(root);
        shard_config.metabase.path = rooted.metabase.path;
        shard_config.blobstor.storages = rooted.blobstor.storages;
        shard_config.writecache.path = rooted.writecache.path;
    }
    info!(config = %args.config.display(), epoch = args.epoch, "cairn-admin starting");

    match args.command {
        Commands::Dump {
            path,
            ignore_errors,
        } => {
            let shard = open_shard(shard_config, Mode::ReadOnly, args.epoch)?;
            let res = shard.dump(&path, ignore_errors)?;
            shard.close()?;
            println!("Dumped {} objects to {} ({} failed)", res.count, path.display(), res.failed);
        }
        Commands::Restore {
            path,
            ignore_errors,
        } => {
            let shard = open_shard(shard_config, Mode::ReadWrite, args.epoch)?;
            let res = shard.restore(&path, ignore_errors)?;
            shard.close()?;
            println!("Restored {} objects from {} ({} failed)", res.count, path.display(), res.failed);
        }
        Commands::Counters => {
            let shard = open_shard(shard_config, Mode::ReadOnly, args.epoch)?;
            let counters = shard.object_counters()?;
            shard.close()?;
            println!("Physical: {}", counters.phy);
            println!("Logical:  {}", counters.logic);
        }
        Commands::Resync => {
            shard_config.refill_metabase = true;
            let shard = open_shard(shard_config, Mode::ReadWrite, args.epoch)?;
            let counters = shard.object_counters()?;
            shard.close()?;
            println!("Metabase rebuilt: {} physical, {} logical", counters.phy, counters.logic);
        }
        Commands::Info => {
            let shard = start_shard(shard_config, Mode::ReadOnly, args.epoch)?;
            print_info(&shard.info());
            shard.close()?;
        }
    }

    Ok(())
}
