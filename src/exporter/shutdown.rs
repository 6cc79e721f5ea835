use anyhow::{Context, Result};
use tokio::signal;

/// Wait for a shutdown signal (SIGINT, SIGTERM on Unix; Ctrl+C elsewhere).
pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to install SIGINT handler")?;

        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv()  => {
                tracing::info!("Received SIGINT signal");
            },
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")?;
        tracing::info!("Received Ctrl+C signal");
    }

    Ok(())
}

/// `()`-returning wrapper for axum's graceful shutdown; signal-handler
/// errors are logged rather than propagated.
pub async fn shutdown_signal_handler() {
    if let Err(e) = shutdown_signal().await {
        tracing::error!("Error setting up shutdown handler: {}", e);
    }
}
