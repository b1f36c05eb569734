use sandgate::config::Config;
use sandgate::local::LocalSandbox;
use sandgate::reconciler::{MountDirectory, Reconciler};
use sandgate::sandbox::SandboxProcess;
use sandgate::supervisor::supervise;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandgate=debug".parse()?),
        )
        .init();

    // Load configuration; without an explicit path a missing default file means defaults
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("sandgate.toml"));

    let config = if explicit_path.is_none() && !config_path.exists() {
        info!("No configuration file found, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    let sandbox = Arc::new(LocalSandbox::new(config.supervisor.sandbox_id.clone()));

    let mut reconciler = Reconciler::new(config.gateway.clone());
    if let Some(ref mount_path) = config.gateway.storage.mount_path {
        reconciler = reconciler.with_storage(Arc::new(MountDirectory::new(mount_path)));
    }
    let reconciler = Arc::new(reconciler);

    // The first reconciliation must succeed
    let gateway = reconciler.ensure_gateway(sandbox.as_ref()).await.map_err(|e| {
        error!(error = %e, code = e.code().as_header_value(), "Gateway failed to start");
        e
    })?;
    info!(
        process_id = gateway.process.id(),
        origin = ?gateway.origin,
        port = config.gateway.port,
        "Gateway is ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervise_handle = {
        let reconciler = Arc::clone(&reconciler);
        let sandbox = Arc::clone(&sandbox);
        let interval = config.supervisor.supervise_interval();
        tokio::spawn(async move {
            supervise(&reconciler, sandbox.as_ref(), interval, shutdown_rx).await;
        })
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = supervise_handle.await {
        warn!(error = %e, "Supervisor task ended abnormally");
    }

    info!("Stopping gateway processes...");
    sandbox.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway supervisor");
    info!(
        port = config.gateway.port,
        command = %config.gateway.command,
        startup_timeout_ms = config.gateway.startup_timeout_ms,
        probe_timeout_ms = config.gateway.probe_timeout_ms,
        launch_lease_ttl_secs = config.gateway.launch_lease_ttl_secs,
        "Gateway settings"
    );
    info!(
        sandbox_id = %config.supervisor.sandbox_id,
        supervise_interval_secs = config.supervisor.supervise_interval_secs,
        mount_path = ?config.gateway.storage.mount_path,
        "Supervisor settings"
    );
}
