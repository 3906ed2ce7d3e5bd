use std::fmt;

use tokio::signal;
use tracing::{error, warn};

/// Which signal asked the gateway to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    CtrlC,
    Terminate,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::CtrlC => f.write_str("SIGINT"),
            ShutdownReason::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Resolve once Ctrl+C or SIGTERM arrives.
///
/// A handler that cannot be installed is logged and never fires; the other
/// source still works. The gateway keeps serving rather than aborting.
pub async fn wait_for_shutdown() -> ShutdownReason {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => ShutdownReason::CtrlC,
        () = terminate => ShutdownReason::Terminate,
    }
}

/// Shutdown future for `axum::serve(..).with_graceful_shutdown(..)`.
///
/// In-flight requests finish; new connections are refused.
pub async fn shutdown_signal() {
    let reason = wait_for_shutdown().await;
    warn!(signal = %reason, "Draining in-flight requests before shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_display() {
        assert_eq!(ShutdownReason::CtrlC.to_string(), "SIGINT");
        assert_eq!(ShutdownReason::Terminate.to_string(), "SIGTERM");
    }
}
