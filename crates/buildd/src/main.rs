//! buildd - build pipeline daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use build_core::Config;
use buildd::{Daemon, DaemonConfig};
use clap::Parser;
use eyre::{eyre, WrapErr};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "buildd", about = "Build pipeline daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "7800")]
    port: u16,

    /// Pipeline config file (key=value)
    #[arg(short, long, env = "BUILDD_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, env = "BUILDD_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory holding local execution sessions
    #[arg(long, env = "BUILDD_SESSIONS_DIR")]
    sessions_dir: Option<PathBuf>,

    /// Directory of session templates
    #[arg(long, env = "BUILDD_TEMPLATES_DIR")]
    templates_dir: Option<PathBuf>,
}

impl Cli {
    fn daemon_config(self) -> eyre::Result<DaemonConfig> {
        let defaults = DaemonConfig::default();
        let config = match &self.config {
            Some(path) => Config::from_file(path)
                .wrap_err_with(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        Ok(DaemonConfig {
            port: self.port,
            db_path: self.db_path.unwrap_or(defaults.db_path),
            sessions_dir: self.sessions_dir.unwrap_or(defaults.sessions_dir),
            templates_dir: self.templates_dir.or(defaults.templates_dir),
            config,
            ..defaults
        })
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli.daemon_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .map_err(|e| eyre!("failed to initialize daemon: {e}"))?;
        let daemon_ref = &daemon;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {}", e);
                    }
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                    daemon_ref.shutdown();
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                    daemon_ref.shutdown();
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                    daemon_ref.shutdown();
                }
            }
        }

        Ok(())
    })
}
