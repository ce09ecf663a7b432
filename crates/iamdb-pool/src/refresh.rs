//! Background credential rotation.
//!
//! One task per pool: sleep the refresh interval, sign a fresh token and
//! push it into the pool's credential slot. Failures are logged and the
//! loop moves on to the next cycle; the previous token stays in place
//! until it expires.
//!
//! Cancellation is observed between cycles. A cycle stuck on a credential
//! lookup is aborted once the shutdown timeout runs out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::pool::ConnectionPool;
use crate::token::TokenGenerator;

/// Default rotation period, well inside the token lifetime.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Counters for refresh cycles.
#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of refresh activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Cancel signal plus completion handle for a running refresh task.
#[derive(Debug)]
pub struct RefreshHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl RefreshHandle {
    /// Start rotating credentials for `pool` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        interval: Duration,
        generator: TokenGenerator,
        endpoint: Endpoint,
        username: String,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let handle = tokio::spawn(run_refresh_loop(
            interval,
            generator,
            endpoint,
            username,
            pool,
            Arc::clone(&counters),
            shutdown_rx,
        ));

        info!(interval = ?interval, "credential refresh started");
        Self {
            shutdown_tx,
            handle,
            counters,
        }
    }

    pub fn stats(&self) -> RefreshStats {
        RefreshStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal cancellation without waiting.
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Cancel and wait up to `timeout` for the task to exit.
    ///
    /// Returns `false` if the task had to be aborted.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.cancel();
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => {
                debug!("credential refresh stopped");
                true
            }
            Err(_) => {
                handle.abort();
                warn!(timeout = ?timeout, "credential refresh did not stop in time, aborted");
                false
            }
        }
    }

    /// Cancel and abort immediately. Used when the owner is dropped.
    pub fn abort(&self) {
        self.cancel();
        self.handle.abort();
    }
}

async fn run_refresh_loop(
    interval: Duration,
    generator: TokenGenerator,
    endpoint: Endpoint,
    username: String,
    pool: Arc<ConnectionPool>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(endpoint = %endpoint, "refresh loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                counters.attempts.fetch_add(1, Ordering::Relaxed);
                match generator.generate(&endpoint.host, endpoint.port, &username).await {
                    Ok(token) => {
                        pool.set_password(&token);
                        counters.successes.fetch_add(1, Ordering::Relaxed);
                        info!(endpoint = %endpoint, user = %username, "rotated database credential");
                    }
                    Err(e) => {
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(endpoint = %endpoint, error = %e, "credential refresh failed, keeping previous token");
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!(endpoint = %endpoint, "refresh loop shutting down");
                break;
            }
        }
    }
}
