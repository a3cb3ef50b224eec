use clap::Parser;
use routegate::config::Config;
use routegate::coordinator::Coordinator;
use routegate::pool::WorkerPool;
use routegate::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "routegate", version, about = "Path-routing reverse proxy with a worker pool")]
struct Args {
    /// Path to the configuration file (YAML, or TOML with a .toml extension)
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routegate=debug".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).map_err(|e| {
        error!(path = %args.config.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %args.config.display(), "Configuration loaded");

    print_startup_banner(&config);

    let bind_addr = config.server.bind_addr()?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = Arc::new(WorkerPool::spawn(&config)?);
    let coordinator = Coordinator::new(bind_addr, pool, shutdown_rx);

    let coordinator_handle = tokio::spawn(async move {
        if let Err(e) = coordinator.run().await {
            error!(error = %e, "Coordinator error");
        }
    });

    wait_for_shutdown_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the accept loop to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), coordinator_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting reverse proxy");
    info!(
        bind = %config.server.bind,
        listen = config.server.listen,
        workers = config.server.worker_count(),
        balance = ?config.server.balance,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        rule_count = config.server.rules.len(),
        rules = ?config.server.rules.iter().map(|r| r.path.as_str()).collect::<Vec<_>>(),
        "Routing rules"
    );
    info!(
        upstream_count = config.server.upstreams.len(),
        upstreams = ?config.server.upstreams.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(),
        "Configured upstreams"
    );
}
