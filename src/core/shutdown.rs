/// Resolves once the process is told to stop. Stopping is cooperative: the
/// caller flags running jobs cancelled and lets in-flight grading calls
/// settle, nothing is aborted here.
pub(crate) async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Stopping on Ctrl+C");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Stopping on Ctrl+C"),
            _ = sigterm.recv() => tracing::info!("Stopping on SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        tracing::info!("Stopping on Ctrl+C");
    }
}
