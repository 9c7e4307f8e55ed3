use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Install a SIGTERM handler for the runner.
///
/// Returns a `CancellationToken` that is cancelled when SIGTERM arrives. The
/// handler does nothing else; cleanup happens on the runner's own task.
pub fn install_termination_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            tracing::warn!("Received SIGTERM, terminating the job");
            token_clone.cancel();
        }
    });

    Ok(token)
}
