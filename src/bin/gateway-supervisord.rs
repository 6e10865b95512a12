use anyhow::Context;
use clap::Parser;
use gateway_supervisor::{
    BasicValidator, FileStore, MemoryStore, ServerOrchestrator, Store, SupervisorSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Supervise gateway server processes
#[derive(Parser, Debug)]
#[command(name = "gateway-supervisord")]
#[command(version, about, long_about = None)]
struct Args {
    /// Settings file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// State file, overriding `supervisor.state_path`
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = match args.config {
        Some(ref path) => SupervisorSettings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => SupervisorSettings::default(),
    };
    if let Some(state) = args.state {
        settings.supervisor.state_path = Some(state);
    }

    let store: Arc<dyn Store> = match settings.supervisor.state_path {
        Some(ref path) => Arc::new(
            FileStore::open(path)
                .await
                .with_context(|| format!("opening state file {}", path.display()))?,
        ),
        None => {
            tracing::warn!("No state_path configured, server records will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let orchestrator = ServerOrchestrator::new(settings, store, Arc::new(BasicValidator));
    let report = orchestrator.boot().await.context("boot failed")?;
    for (id, error) in &report.auto_start.failed {
        tracing::error!("Server {} did not start: {}", id, error);
    }

    wait_for_shutdown_signal().await?;
    orchestrator.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}
