//! Logging setup.
//!
//! Same shape as `rqbit`'s `tracing_subscriber_config_utils`: an
//! `EnvFilter` wrapped in a reload layer so the level can change at runtime,
//! a stdout `fmt` layer (plain or JSON), and an optional file sink with its
//! own independent filter. No broadcast channel here, since there's no HTTP
//! log-tail endpoint in this crate.

use anyhow::Context;
use std::io::LineWriter;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Layer};

pub struct InitLoggingOptions<'a> {
    pub default_rust_log_value: Option<&'a str>,
    pub log_file: Option<&'a str>,
    pub log_file_rust_log: Option<&'a str>,
    pub json: bool,
}

impl<'a> Default for InitLoggingOptions<'a> {
    fn default() -> Self {
        Self {
            default_rust_log_value: None,
            log_file: None,
            log_file_rust_log: None,
            json: false,
        }
    }
}

pub struct LoggingHandle {
    reload_handle: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl LoggingHandle {
    /// Applies a new `RUST_LOG`-style filter string at runtime (the `-set`
    /// CLI surface can call this without restarting the process).
    pub fn set_filter(&self, directive: &str) -> anyhow::Result<()> {
        let filter = EnvFilter::builder()
            .parse(directive)
            .context("invalid log filter")?;
        self.reload_handle
            .reload(filter)
            .context("failed to apply log filter")
    }
}

pub fn init_logging(opts: InitLoggingOptions) -> anyhow::Result<LoggingHandle> {
    let initial_filter = EnvFilter::builder()
        .with_default_directive(
            opts.default_rust_log_value
                .unwrap_or("info")
                .parse()
                .context("invalid default log directive")?,
        )
        .from_env()
        .context("invalid RUST_LOG value")?;

    let (filter_layer, reload_handle) = reload::Layer::new(initial_filter);

    let stdout_layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> = if opts.json {
        Box::new(fmt::layer().json())
    } else {
        Box::new(fmt::layer())
    };

    let registry = tracing_subscriber::registry().with(stdout_layer.with_filter(filter_layer));

    if let Some(log_file) = opts.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("failed to open log file {log_file}"))?;
        let writer = std::sync::Mutex::new(LineWriter::new(file));
        let file_filter = EnvFilter::builder()
            .parse(opts.log_file_rust_log.unwrap_or("info"))
            .context("invalid log-file filter")?;
        registry
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(file_filter),
            )
            .try_init()
            .context("failed to install logging subscriber")?;
    } else {
        registry
            .try_init()
            .context("failed to install logging subscriber")?;
    }

    Ok(LoggingHandle { reload_handle })
}
