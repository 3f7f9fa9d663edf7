//! Graceful shutdown on SIGTERM or Ctrl-C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::SIGTERM;
use signal_hook::flag::register;
use tracing::{info, warn};

/// How often the SIGTERM flag is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Register a SIGTERM handler that sets an `AtomicBool` flag.
///
/// Returns an `Arc<AtomicBool>` that transitions from `false` to `true` when
/// the process receives SIGTERM.
///
/// # Errors
///
/// Returns the OS error if the signal handler cannot be registered.
pub fn register_sigterm() -> std::io::Result<Arc<AtomicBool>> {
    let term = Arc::new(AtomicBool::new(false));
    // The handler only performs an atomic store, which is async-signal-safe.
    register(SIGTERM, Arc::clone(&term))?;
    Ok(term)
}

/// Resolves once SIGTERM has been flagged or Ctrl-C is pressed.
///
/// Passed to `axum::serve(..).with_graceful_shutdown(..)`.
pub async fn signal(term_flag: Arc<AtomicBool>) {
    let sigterm = async {
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        loop {
            tick.tick().await;
            if term_flag.load(Ordering::Relaxed) {
                break;
            }
        }
    };

    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            // Without a Ctrl-C handler only SIGTERM can stop the server.
            warn!(%err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = sigterm => info!("SIGTERM received, shutting down"),
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
    }
}
