//! Pending-queue bookkeeping: enqueue, size-threshold drain, and the
//! window-timer existence invariant (`queue non-empty ⇔ timer scheduled`).

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::request::{PendingRequest, QueueKey};

#[derive(Default)]
pub struct QueueState {
    pub pending_by_queue: HashMap<QueueKey, Vec<PendingRequest>>,
    pub window_tokens: HashMap<QueueKey, CancellationToken>,
}

impl QueueState {
    /// Append a request to its queue. Returns `Some(token)` if a window
    /// timer needs to be armed (the queue was previously empty), and
    /// `Some(drained)` if the size threshold was reached.
    pub fn enqueue(
        &mut self,
        key: QueueKey,
        request: PendingRequest,
        batch_size: usize,
    ) -> (Option<CancellationToken>, Option<Vec<PendingRequest>>) {
        let queue = self.pending_by_queue.entry(key.clone()).or_default();
        let was_empty = queue.is_empty();
        queue.push(request);

        let mut new_token = None;
        if was_empty {
            let token = CancellationToken::new();
            self.window_tokens.insert(key.clone(), token.clone());
            new_token = Some(token);
        }

        let drained = if queue.len() >= batch_size {
            Some(self.drain(&key))
        } else {
            None
        };

        (new_token, drained)
    }

    /// Atomically remove all pending requests for a key and cancel its
    /// window timer.
    pub fn drain(&mut self, key: &QueueKey) -> Vec<PendingRequest> {
        if let Some(token) = self.window_tokens.remove(key) {
            token.cancel();
        }
        self.pending_by_queue.remove(key).unwrap_or_default()
    }

    pub fn all_keys(&self) -> Vec<QueueKey> {
        self.pending_by_queue.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_by_queue.values().all(Vec::is_empty)
    }
}
