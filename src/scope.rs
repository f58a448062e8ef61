//! Ambient binding of the active [`Batcher`] to the current task, and the
//! bracketed activation object returned by [`crate::api::batchify`].

use std::sync::Arc;

use tracing::{info, warn};

use crate::batcher::Batcher;

tokio::task_local! {
    static CURRENT_BATCHER: Arc<Batcher>;
}

/// Read the Batcher bound to the ambient scope of the calling task, if any.
/// The interception layer consults this on every outbound request.
pub fn current() -> Option<Arc<Batcher>> {
    CURRENT_BATCHER.try_with(Arc::clone).ok()
}

/// Spawn `future` as a new task, carrying the calling task's active scope
/// binding (if any) along with it. `tokio::task_local!` values don't cross
/// `tokio::spawn` boundaries on their own — a request made from a plain
/// `tokio::spawn`ed task inside a `Scope::run` body would silently bypass
/// batching entirely. Use this instead of `tokio::spawn` for work fanned out
/// from inside a scope that should still be intercepted.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(batcher) => tokio::spawn(CURRENT_BATCHER.scope(batcher, future)),
        None => tokio::spawn(future),
    }
}

/// A bracketed activation: binds its Batcher for the duration of a future
/// (or, in the blocking form, a synchronous closure), flushing on exit.
pub struct Scope {
    batcher: Arc<Batcher>,
}

impl Scope {
    pub(crate) fn new(batcher: Arc<Batcher>) -> Self {
        Self { batcher }
    }

    /// Bind this scope's Batcher for the duration of `body`, then flush:
    /// drain every pending queue, submit it, and await outstanding
    /// submission/poll work before returning.
    pub async fn run<F, T>(self, body: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let batcher = Arc::clone(&self.batcher);
        let result = CURRENT_BATCHER.scope(batcher, body).await;
        self.batcher.close().await;
        if self.batcher.is_deferred_exited() {
            info!("batching scope exiting: deferred mode triggered, batches left running remotely");
        }
        result
    }

    /// Synchronous entry point for call sites with no `.await` available.
    /// Binds the scope for `body`, but can only best-effort flush afterward:
    /// if a Tokio runtime handle is reachable it blocks on the flush,
    /// otherwise it warns and leaves queued work to the idle/deferred path.
    pub fn enter_blocking<F, T>(self, body: F) -> T
    where
        F: FnOnce() -> T,
    {
        warn!("entering batchling scope synchronously; queued work will not be flushed asynchronously");
        let batcher = Arc::clone(&self.batcher);
        let result = CURRENT_BATCHER.sync_scope(batcher, body);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(self.batcher.close()),
            Err(_) => warn!("no tokio runtime reachable; skipping synchronous flush"),
        }
        if self.batcher.is_deferred_exited() {
            info!("batching scope exiting: deferred mode triggered, batches left running remotely");
        }
        result
    }
}
