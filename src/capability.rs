//! Memoized "are the tables there" check shared by every store handle.
//!
//! The first caller runs the probe while holding the lock, so concurrent
//! callers wait for that single probe instead of issuing their own.

use std::future::Future;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct CapabilityCache {
    state: Mutex<Option<bool>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached answer, or run `probe` once and remember its result
    pub async fn check_once<F, Fut>(&self, probe: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut state = self.state.lock().await;
        if let Some(ready) = *state {
            return ready;
        }

        let ready = probe().await;
        tracing::debug!(ready, "capability probe finished");
        *state = Some(ready);
        ready
    }

    /// Forget the cached answer; the next `check_once` probes again
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }

    /// Record that the tables turned out to be missing mid-query
    pub async fn mark_missing(&self) {
        *self.state.lock().await = Some(false);
    }

    /// Peek at the cached answer without probing
    pub async fn cached(&self) -> Option<bool> {
        *self.state.lock().await
    }
}
