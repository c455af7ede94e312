//! # Scheduler Surface
//!
//! §5/§9 ask for an explicit scheduling model rather than bare
//! language-native async: every awaiting operation carries a deadline drawn
//! from one of the timeout classes in §4.4, and cancellation is observable
//! rather than implicit. `with_deadline` wraps `tokio::time::timeout` and
//! maps expiry to the wire-stable `Timeout` error; `CancellationHandle` is a
//! cooperative cancel signal built on `tokio::sync::Notify`, handed to
//! long-running loops (anti-entropy round, queue drain) so callers can
//! interrupt them without tearing down the whole task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{MkvError, Result};

/// Run `fut` to completion or fail with [`MkvError::Timeout`] after
/// `deadline` elapses. Does not cancel any partial state the future may
/// have mutated before expiry (§5: "on deadline expiry... publishes no
/// partial state" applies to the caller-visible response, not to storage
/// side effects that already committed inside `fut`).
pub async fn with_deadline<F, T>(fut: F, deadline: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| MkvError::timeout(format!("operation exceeded {deadline:?}")))
}

/// A cooperative, cloneable cancel signal. Cloning shares the same
/// underlying notifier, so any clone can cancel and any clone can observe
/// the cancellation.
#[derive(Clone)]
pub struct CancellationHandle {
    notify: Arc<Notify>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self { notify: Arc::new(Notify::new()) }
    }

    /// Signal cancellation to every waiter, current and future.
    pub fn cancel(&self) {
        self.notify.notify_waiters();
    }

    /// Resolves once [`Self::cancel`] has been called.
    pub async fn cancelled(&self) {
        self.notify.notified().await;
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}
