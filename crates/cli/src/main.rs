//! `vaultfs` CLI: drives the core's lifecycle (start, stop, status, one-off
//! config edits) against the reference pass-through provider. The FUSE/
//! WinFSP syscall shim is out of scope; this binary only exercises the
//! façade directly, in the `#[derive(Parser)]` CLI style of `crates/rqbit`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use vaultfs_core::config::Config;
use vaultfs_core::facade::DataPlane;
use vaultfs_core::logging::{init_logging, InitLoggingOptions};
use vaultfs_core::provider::passthrough::PassthroughProvider;
use vaultfs_core::provider::Provider;

#[derive(Parser)]
#[command(version, author, about = "vaultfs data plane CLI")]
struct Opts {
    /// Data directory holding cache, metadata and config.json.
    #[arg(short = 'd', long = "dd", env = "VAULTFS_DATA_DIR")]
    data_dir: PathBuf,

    /// Root directory backing the reference pass-through provider.
    #[arg(long = "remote-root", env = "VAULTFS_REMOTE_ROOT")]
    remote_root: Option<PathBuf>,

    /// RUST_LOG-style filter for the console logger.
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate config.json in the data directory if it doesn't exist yet.
    Gc,
    /// Apply one `-set key value` config edit.
    Set { key: String, value: String },
    /// Dry-run provider connectivity.
    Test,
    /// Print mount status as JSON.
    Status,
    /// Start, then immediately stop all background threads.
    Unmount,
}

const EXIT_MOUNT_FAILED: i32 = 1;
const EXIT_CONFIG_INVALID: i32 = 2;
const EXIT_PROVIDER_UNREACHABLE: i32 = 3;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),
    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::ConfigInvalid(_) => EXIT_CONFIG_INVALID,
            CliError::ProviderUnreachable(_) => EXIT_PROVIDER_UNREACHABLE,
        }
    }
}

fn main() {
    let opts = Opts::parse();
    if let Err(e) = init_logging(InitLoggingOptions {
        default_rust_log_value: opts.log_level.as_deref(),
        ..Default::default()
    }) {
        eprintln!("failed to initialize logging: {e:#}");
    }

    let code = match run(opts) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{e:#}");
            e.downcast_ref::<CliError>()
                .map(CliError::exit_code)
                .unwrap_or(EXIT_MOUNT_FAILED)
        }
    };
    std::process::exit(code);
}

fn open_provider(opts: &Opts) -> Result<PassthroughProvider, CliError> {
    let remote_root = opts
        .remote_root
        .clone()
        .unwrap_or_else(|| opts.data_dir.join("remote"));
    PassthroughProvider::new(remote_root).map_err(|e| CliError::ProviderUnreachable(e.to_string()))
}

fn run(opts: Opts) -> anyhow::Result<()> {
    std::fs::create_dir_all(&opts.data_dir).context("creating data directory")?;

    match &opts.command {
        Command::Gc => {
            Config::load_or_default(&opts.data_dir).context("generating default config")?;
            println!("wrote {}", Config::path(&opts.data_dir).display());
        }
        Command::Set { key, value } => {
            let mut cfg = Config::load_or_default(&opts.data_dir)
                .map_err(|e| CliError::ConfigInvalid(e.to_string()))?;
            cfg.set_by_key(key, value)
                .map_err(|e| CliError::ConfigInvalid(e.to_string()))?;
            cfg.save(&opts.data_dir).context("saving config")?;
        }
        Command::Test => {
            let provider = open_provider(&opts)?;
            provider.list("/").map_err(|e| CliError::ProviderUnreachable(e.to_string()))?;
            println!("provider reachable");
        }
        Command::Status => {
            let provider = Arc::new(open_provider(&opts)?);
            let plane = DataPlane::start(opts.data_dir.clone(), provider)
                .map_err(|e| anyhow::anyhow!("mount failed: {e:#}"))?;
            let stats = plane.statfs();
            println!(
                "{}",
                serde_json::json!({
                    "total_bytes": stats.total_bytes,
                    "used_bytes": stats.used_bytes,
                    "free_bytes": stats.free_bytes,
                    "item_count": stats.item_count,
                })
            );
            plane.shutdown();
        }
        Command::Unmount => {
            let provider = Arc::new(open_provider(&opts)?);
            let plane = DataPlane::start(opts.data_dir.clone(), provider)
                .map_err(|e| anyhow::anyhow!("mount failed: {e:#}"))?;
            plane.shutdown();
        }
    }
    Ok(())
}
