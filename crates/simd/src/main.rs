//! simd - simulation worker supervisor daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use sim_core::Config;
use simd::{Daemon, DaemonConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "simd", about = "Simulation worker supervisor daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "7700")]
    port: u16,

    /// Config file (key=value)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding per-run directories (overrides config)
    #[arg(long)]
    runs_dir: Option<PathBuf>,

    /// Worker executable (overrides config)
    #[arg(long)]
    worker_bin: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<Config, sim_core::config::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            if let Some(base) = path.parent() {
                config.resolve_paths(base);
            }
            config
        }
        None => Config::default(),
    };
    if let Some(runs_dir) = &cli.runs_dir {
        config.runs_dir.clone_from(runs_dir);
    }
    if let Some(worker_bin) = &cli.worker_bin {
        config.worker_bin = Some(worker_bin.clone());
    }
    Ok(config)
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let sim = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let config = DaemonConfig {
        sim,
        port: cli.port,
        ..Default::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let daemon = match Daemon::new(config).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        };

        tokio::select! {
            result = daemon.run() => {
                if let Err(e) = result {
                    error!("daemon error: {}", e);
                }
            }
            signal = simd::shutdown::termination_signal() => {
                match signal {
                    Ok(name) => info!("received {}, initiating graceful shutdown", name),
                    Err(e) => error!("failed to listen for signals: {}", e),
                }
            }
        }

        daemon.shutdown().await;
    });
}
