use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use threveal::config::Config;
use threveal::session::Session;

/// Per-thread migration profiler for Intel hybrid CPUs.
#[derive(Parser)]
#[command(name = "threveal", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Process to trace migrations for (default: all processes).
    #[arg(short, long)]
    pid: Option<u32>,

    /// PMU sampling period in microseconds.
    #[arg(long)]
    interval_us: Option<u64>,

    /// Capture duration in seconds.
    #[arg(long)]
    duration_secs: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("threveal {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // CLI flags override file values.
    if let Some(pid) = cli.pid {
        cfg.target_pid = Some(pid);
    }
    if let Some(us) = cli.interval_us {
        cfg.sample_interval = std::time::Duration::from_micros(us);
    }
    if let Some(secs) = cli.duration_secs {
        cfg.duration = std::time::Duration::from_secs(secs);
    }
    cfg.validate()?;

    // Ctrl-C requests a graceful stop; the capture loop observes the token.
    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received interrupt, stopping capture");
        handler_token.cancel();
    })
    .context("installing signal handler")?;

    let session = Session::new(cfg)?;
    let report = session.run(&cancel)?;

    tracing::info!(
        migrations = report.migrations_captured,
        samples = report.samples_captured,
        "threveal finished",
    );

    Ok(())
}
