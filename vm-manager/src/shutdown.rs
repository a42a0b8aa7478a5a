//! Process termination signals.
//!
//! On Unix, SIGINT, SIGTERM and SIGQUIT all trigger shutdown, with
//! [`tokio::signal::ctrl_c`] awaited alongside. Elsewhere only ctrl-c is
//! handled.

use std::future::Future;
use tracing::{error, info, warn};

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = tokio::signal::ctrl_c() => "ctrl_c",
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    info!(signal = name, "Shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    wait_for_ctrl_c().await
}

/// Resolves once shutdown is requested.
///
/// If the signal handlers cannot be installed, only ctrl-c is waited on. If
/// that fails too the future never resolves; the process then runs until
/// killed rather than shutting down at once.
pub async fn shutdown_requested() {
    wait_with_fallback(wait_for_shutdown_signal(), wait_for_ctrl_c()).await
}

async fn wait_for_ctrl_c() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl_c", "Shutdown signal received");
    Ok(())
}

async fn wait_with_fallback<P, F>(primary: P, fallback: F)
where
    P: Future<Output = std::io::Result<()>>,
    F: Future<Output = std::io::Result<()>>,
{
    let Err(e) = primary.await else {
        return;
    };
    warn!(error = %e, "Failed to install signal handlers, waiting for ctrl-c only");

    if let Err(e) = fallback.await {
        error!(error = %e, "Failed to listen for ctrl-c, shutdown needs an external kill");
        std::future::pending::<()>().await;
    }
}
