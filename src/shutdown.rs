use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Returns a token cancelled on SIGTERM or interrupt. Long-lived loops
/// watch this token and drain before exiting.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
            res = tokio::signal::ctrl_c() => {
                match res {
                    Ok(()) => tracing::info!("received interrupt, initiating graceful shutdown"),
                    Err(e) => tracing::error!(error = %e, "ctrl-c listener failed, shutting down"),
                }
            }
        }

        trigger.cancel();
    });

    token
}
