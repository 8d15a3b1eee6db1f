//! db-relay - Transparent TCP relay to a restricted database listener
//!
//! Lets a service without a route to the database reach it through this
//! process. Bytes are forwarded as-is; no protocol is parsed.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (per-session buffers)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod relay;

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{Cli, RelayConfig};
use relay::{probe_target, RelayError, RelayListener};

/// Initialize logging
///
/// Priority: --verbose flag, then RUST_LOG, then "info"
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Process entry point: parse configuration, serve until SIGINT/SIGTERM.
///
/// Exits non-zero on bad configuration, an unreachable target (unless
/// `--allow-unreachable-target`), bind failure, or a fatal listener error.
pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match RelayConfig::try_from(cli) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(config, shutdown_signal())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Probe the target, bind, and relay until `shutdown` resolves.
pub async fn serve<F>(config: Arc<RelayConfig>, shutdown: F) -> Result<(), RelayError>
where
    F: Future<Output = ()>,
{
    tracing::info!(
        "Starting db-relay v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr()
    );
    tracing::info!("Forwarding to {}", config.target_addr());

    if !probe_target(&config).await {
        if config.allow_unreachable_target {
            tracing::warn!("Target unreachable at startup; listening anyway");
        } else {
            return Err(RelayError::TargetUnreachable(config.target_addr()));
        }
    }

    let listener = RelayListener::bind(config.clone()).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener_task = tokio::spawn(listener.run(shutdown_rx));

    tokio::select! {
        _ = shutdown => {
            tracing::info!("Shutting down relay...");
            let _ = shutdown_tx.send(true);
        }
        joined = &mut listener_task => return flatten_listener(joined),
    }

    let result = flatten_listener(listener_task.await);
    tracing::info!("Shutdown complete");
    result
}

fn flatten_listener(
    joined: Result<Result<(), RelayError>, tokio::task::JoinError>,
) -> Result<(), RelayError> {
    joined.map_err(|e| RelayError::ListenerClosed(format!("listener task failed: {}", e)))?
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
