//! Cooperative cancellation.
//!
//! Cancellation is checked between phases — before a probe, before an apply,
//! and before each retry sleep — never mid-subprocess. A running command
//! finishes (or times out) on its own; the engine simply starts nothing new.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};

/// Shared cancellation flag, set once and observed by every worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Wire a `SIGINT`/`SIGTERM` handler to `token`.
///
/// The first signal requests a graceful stop; a second signal exits
/// immediately with the conventional interrupted status.
///
/// # Errors
///
/// Returns an error if the process-wide signal handler cannot be installed.
pub fn install_signal_handler(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("\ninterrupt received, finishing in-flight steps (press again to abort)");
        token.cancel();
    })
    .context("failed to install signal handler")
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_clear() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn cancel_is_sticky_and_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn token_is_visible_across_threads() {
        let token = CancelToken::new();
        let t = token.clone();
        std::thread::spawn(move || t.cancel())
            .join()
            .expect("cancel thread");
        assert!(token.is_cancelled());
    }
}
