//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM cancel a [`ShutdownToken`], which the `run` loop awaits
//! next to its input stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::info;

/// Shared cancellation flag that can also be awaited.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenState>,
}

#[derive(Default)]
struct TokenState {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Listens for SIGINT and SIGTERM and cancels its token on the first one.
pub struct ShutdownGuard {
    token: ShutdownToken,
}

impl ShutdownGuard {
    /// Start listening for signals.
    ///
    /// If signal handlers cannot be registered (e.g., in restricted environments),
    /// the guard is still created but signal handling will be disabled.
    pub fn new() -> Self {
        let token = ShutdownToken::new();
        let cancel = token.clone();

        tokio::spawn(async move {
            let sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!("Failed to register SIGINT handler: {}", e);
                    None
                }
            };

            let sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!("Failed to register SIGTERM handler: {}", e);
                    None
                }
            };

            match (sigint, sigterm) {
                (Some(mut int), Some(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => info!("Received SIGINT, shutting down..."),
                        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
                    }
                }
                (Some(mut int), None) => {
                    int.recv().await;
                    info!("Received SIGINT, shutting down...");
                }
                (None, Some(mut term)) => {
                    term.recv().await;
                    info!("Received SIGTERM, shutting down...");
                }
                (None, None) => {
                    tracing::warn!("No signal handlers registered - graceful shutdown disabled");
                    return;
                }
            }
            cancel.cancel();
        });

        Self { token }
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}
