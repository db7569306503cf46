//! `tradeflow run`: drive active orders until a shutdown signal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::persistence::{self, StateFile};
use crate::runtime::{OrchestratorContext, RuntimeEngine};

const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

pub async fn run(runtime: &RuntimeEngine, state_path: &Path) -> anyhow::Result<()> {
    let scheduled = runtime.start().await?;
    info!(
        scheduled,
        state = %state_path.display(),
        "Runtime running, press Ctrl+C to stop"
    );
    let saver = spawn_state_saver(runtime.context().clone(), state_path.to_path_buf());

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");
    match timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), runtime.stop()).await {
        Ok(()) => info!("Runtime shutdown completed gracefully"),
        Err(_) => warn!("Runtime shutdown timed out after {}s, forcing", SHUTDOWN_TIMEOUT_SECS),
    }
    saver.abort();

    persistence::save(state_path, &StateFile::capture(runtime.context())).await?;
    let stats = runtime.stats();
    info!(
        runs = stats.scheduler.runs,
        errors = stats.scheduler.errors,
        tasks = stats.tasks.total,
        "Final state saved"
    );
    Ok(())
}

/// Persist the state whenever an order changes status
fn spawn_state_saver(ctx: Arc<OrchestratorContext>, path: PathBuf) -> JoinHandle<()> {
    let mut rx = ctx.orders.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Err(e) = persistence::save(&path, &StateFile::capture(&ctx)).await {
                        error!(path = %path.display(), error = %e, "Failed to save state");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
