//! Turning Ctrl-C and `SIGTERM` into a batch cancellation.

use tokio_util::sync::CancellationToken;

use crate::{prelude::*, ui::Ui};

/// Trip `cancel` when the user interrupts us.
///
/// Our OCR processes run in their own process groups, so the terminal's
/// Ctrl-C only reaches us. The worker pool then decides what happens to
/// running jobs.
pub fn cancel_on_signal(ui: Ui, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown_signal() => {
                warn!("Received shutdown signal, cancelling batch");
                ui.display_message(
                    "🛑",
                    "Interrupted: letting running files finish, skipping the rest",
                );
                cancel.cancel();
            }
            () = cancel.cancelled() => {}
        }
    });
}

/// Wait for either Ctrl-C or (on Unix) `SIGTERM`.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", err);
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {}", err);
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
