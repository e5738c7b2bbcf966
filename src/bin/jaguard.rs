//! jaguard - Jaguar device daemon
//!
//! Serves the container API on the device, announces it on the local
//! network and keeps the firmware recoverable.
//!
//! ## Usage
//!
//! ```sh
//! jaguard --config /etc/jaguar/config.json
//! jaguard --state-dir /var/lib/jaguar --port 9000
//! ```
//!
//! ## Exit Codes
//!
//! | Code | Meaning                                  |
//! |------|------------------------------------------|
//! | 0    | shut down by signal                      |
//! | 1    | startup failed                           |
//! | 17   | firmware upgraded, restart required      |
//! | 18   | firmware rolled back, restart required   |

use anyhow::Context;
use clap::Parser;
use jaguar_daemon::{
    Daemon, DaemonConfig, FileFirmware, HostNetwork, ProcessRuntime, Supervisor,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jaguard", version, about = "Jaguar device daemon")]
struct Args {
    /// JSON configuration file.
    #[arg(long, short = 'c', default_value = "jaguar.json")]
    config: PathBuf,

    /// Overrides the state directory from the configuration.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Overrides the HTTP port from the configuration.
    #[arg(long, short = 'p')]
    port: Option<u16>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .compact()
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = DaemonConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Some(port) = args.port {
        config.identity.port = Some(port);
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = load_config(&args)?;

    let firmware = FileFirmware::with_path(config.state_dir.join("firmware"))
        .context("opening firmware state")?;
    let daemon = Arc::new(
        Daemon::open(config, Arc::new(ProcessRuntime::new()), Arc::new(firmware))
            .context("opening daemon state")?,
    );

    daemon.replay_installed().await;

    let network = Arc::new(HostNetwork::new(daemon.identity().port));
    let supervisor = Supervisor::new(Arc::clone(&daemon), network);

    tokio::select! {
        restart = supervisor.run() => {
            info!(reason = ?restart, "restart required");
            Ok(ExitCode::from(restart.exit_code()))
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for shutdown signal")?;
            info!("shutdown signal received");
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
