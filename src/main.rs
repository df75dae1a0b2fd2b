//! sockecho: echo backend on a UNIX domain socket.
//!
//! Features:
//! - Echoes the body of each request frame back to the caller
//! - Sequential or concurrent connection handling
//! - Lenient or strict handling of frames without a separator
//! - Configuration via CLI arguments or TOML file

use sockecho::{Config, EchoListener};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        socket = %config.socket.display(),
        backlog = config.backlog,
        dispatch = ?config.dispatch,
        read_size = config.framing.read_size,
        read_mode = ?config.framing.read_mode,
        policy = ?config.framing.policy,
        "Starting sockecho server"
    );

    let listener = EchoListener::start(&config).await?;

    let stop = listener.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        stop.stop();
    });

    listener.serve().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
