//! Binary entry point: parses configuration, wires up logging and the
//! concrete transport/storage implementations, and runs the lifecycle
//! controller to completion.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use backup_core::{ConfigRecord, FlatFileHashStore, LifecycleController, LoggingTransport, DEFAULT_BLOCKSIZE};
use clap::Parser;
use serde::Deserialize;

/// Carve, hash and watch a set of directories for a content-addressed
/// backup service.
#[derive(Debug, Parser)]
#[command(name = "backup-agentd", version, about)]
struct Cli {
    /// Directory to carve and watch. May be given more than once.
    #[arg(short = 'd', long = "dir")]
    dirs: Vec<PathBuf>,

    /// Optional TOML config file; CLI flags override values it sets.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Block size, in bytes, used to chunk regular files for hashing.
    #[arg(long)]
    blocksize: Option<u64>,

    /// Directory used for the local hash cache.
    #[arg(long)]
    dircache: Option<PathBuf>,

    /// File name of the local hash database within `dircache`.
    #[arg(long)]
    dbname: Option<String>,

    /// Remote storage service host.
    #[arg(long)]
    host: Option<String>,

    /// Remote storage service port.
    #[arg(long)]
    port: Option<u16>,
}

/// Shape of the optional TOML config file; every field is optional so a
/// partial file can be layered under CLI overrides.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    dirs: Option<Vec<PathBuf>>,
    blocksize: Option<u64>,
    dircache: Option<PathBuf>,
    dbname: Option<String>,
    host: Option<String>,
    port: Option<u16>,
}

fn default_dircache() -> PathBuf {
    dirs_cache_home().join("backup-agent")
}

fn dirs_cache_home() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
        .unwrap_or_else(|| PathBuf::from("/var/cache"))
}

fn build_config(cli: Cli) -> anyhow::Result<ConfigRecord> {
    let file_config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => FileConfig::default(),
    };

    let dirname_list = if !cli.dirs.is_empty() {
        cli.dirs
    } else {
        file_config.dirs.unwrap_or_default()
    };

    Ok(ConfigRecord {
        dirname_list,
        blocksize: cli.blocksize.or(file_config.blocksize).unwrap_or(DEFAULT_BLOCKSIZE),
        dircache: cli.dircache.or(file_config.dircache).unwrap_or_else(default_dircache),
        dbname: cli.dbname.or(file_config.dbname).unwrap_or_else(|| "hashes.db".to_string()),
        host: cli.host.or(file_config.host).unwrap_or_else(|| "localhost".to_string()),
        port: cli.port.or(file_config.port).unwrap_or(9999),
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = build_config(cli)?;
    config.validate().context("invalid configuration")?;

    let store = FlatFileHashStore::open(&config.dircache, &config.dbname)
        .context("opening local hash store")?;
    let transport = Arc::new(LoggingTransport);

    let controller = LifecycleController::new(config, Box::new(store), transport)
        .context("starting up")?;

    controller.run().context("running agent")?;
    Ok(())
}
