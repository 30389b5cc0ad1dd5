//! The `flockd` daemon and its command-line surface.

pub mod client;
pub mod config;
pub mod daemon;
pub mod server;

pub use client::{ClusterClient, ClusterStat};
pub use config::CliConfig;
pub use daemon::{Daemon, DaemonConfig};
pub use server::VdiEntry;

use anyhow::Context;
use corelib::Status;
use tracing_subscriber::EnvFilter;

/// Entry point behind `main`: logging, runtime, node lifecycle, exit code.
pub fn run(config: CliConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.loglevel))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async move {
        let daemon = Daemon::start(DaemonConfig::from_cli(&config)?)
            .await
            .context("failed to start node")?;

        tokio::spawn({
            let view = daemon.view_handle();
            async move {
                wait_for_signal().await;
                tracing::info!("termination signal received");
                view.set_status(Status::ShuttingDown);
            }
        });

        let final_status = daemon.wait().await;
        daemon.stop().await?;
        if final_status == Status::Killed {
            anyhow::bail!("node was killed (join rejected or fatal cluster error)");
        }
        Ok(())
    })
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
