use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Listen for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The binary waits on it before stopping the scheduling service.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping scanners");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping scanners");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
