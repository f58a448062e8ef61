//! The central scheduler: queue partitioning, window timers, submission,
//! polling, cache-hit resumption, and close/flush.

mod process;
mod queue;

pub(crate) mod poll;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::RequestCacheStore;
use crate::error::{BatchlingError, Result};
use crate::http_client::{BoxedHttpClient, HttpResponse};
use crate::provider::ProviderRegistry;
use crate::request::PendingRequest;

use poll::attach_to_resumed;
use process::process_batch;
use queue::QueueState;

/// Tunables for the batching scheduler, mirroring the external interface's
/// enumerated scope configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub batch_window: Duration,
    pub poll_interval: Duration,
    pub dry_run: bool,
    pub cache: bool,
    pub deferred: bool,
    pub deferred_idle: Duration,
    pub cache_path: Option<PathBuf>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_window: Duration::from_secs_f64(2.0),
            poll_interval: Duration::from_secs_f64(10.0),
            dry_run: false,
            cache: true,
            deferred: false,
            deferred_idle: Duration::from_secs_f64(60.0),
            cache_path: None,
        }
    }
}

pub struct Batcher {
    pub(crate) config: BatcherConfig,
    pub(crate) client: BoxedHttpClient,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) cache: Option<RequestCacheStore>,
    queues: Mutex<QueueState>,
    pub(crate) resumed_batches: tokio::sync::Mutex<
        std::collections::HashMap<(String, String, String), crate::request::ResumedBatch>,
    >,
    last_intercepted_at: Mutex<Instant>,
    deferred_exited: AtomicBool,
    /// Handles for every submission/poll-loop task spawned on this batcher's
    /// behalf, joined by `close()` so no background work outlives it.
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Batcher {
    pub fn new(
        config: BatcherConfig,
        client: BoxedHttpClient,
        registry: Arc<ProviderRegistry>,
        cache: Option<RequestCacheStore>,
    ) -> Arc<Self> {
        let batcher = Arc::new(Self {
            config,
            client,
            registry,
            cache,
            queues: Mutex::new(QueueState::default()),
            resumed_batches: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            last_intercepted_at: Mutex::new(Instant::now()),
            deferred_exited: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        });

        if batcher.config.deferred {
            spawn_deferred_watchdog(Arc::clone(&batcher));
        }

        batcher
    }

    /// Register a spawned submission/poll-loop task so `close()` can join it.
    pub(crate) fn track_task(&self, handle: tokio::task::JoinHandle<()>) {
        self.background.lock().unwrap().push(handle);
    }

    pub fn resolve_adapter(
        &self,
        method: &reqwest::Method,
        host: &str,
        path: &str,
    ) -> Option<Arc<dyn crate::provider::ProviderAdapter>> {
        self.registry.resolve(method, host, path)
    }

    /// Route one intercepted request through the batcher: cache lookup,
    /// resumed-batch attachment, or fresh enqueue, then await its result.
    pub async fn submit(
        self: &Arc<Self>,
        adapter: Arc<dyn crate::provider::ProviderAdapter>,
        method: reqwest::Method,
        host: String,
        endpoint: String,
        headers: reqwest::header::HeaderMap,
        body: bytes::Bytes,
    ) -> Result<HttpResponse> {
        *self.last_intercepted_at.lock().unwrap() = Instant::now();

        if self.deferred_exited.load(Ordering::SeqCst) {
            debug!("submit called after deferred exit; returning synthetic deferred response");
            return Ok(synthetic_deferred_exit_response());
        }

        let parsed_body = serde_json::from_slice::<serde_json::Value>(&body).ok();
        let model = match &parsed_body {
            Some(value) => adapter.extract_model(&endpoint, value)?,
            None => adapter.extract_model(&endpoint, &serde_json::Value::Null)?,
        };
        let queue_key = (adapter.name().to_string(), endpoint.clone(), model.clone());

        let request_hash = parsed_body
            .as_ref()
            .map(|value| crate::util::request_hash(adapter.name(), &endpoint, &model, &host, value));

        let custom_id = format!("batchling-{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();

        if self.config.cache {
            if let (Some(cache), Some(hash)) = (&self.cache, &request_hash) {
                if let Some(entry) = cache.get_by_hash(hash).await? {
                    debug!(request_hash = %hash, batch_id = %entry.batch_id, "cache hit");
                    let pending = PendingRequest::new(
                        custom_id.clone(),
                        queue_key.clone(),
                        method,
                        host.clone(),
                        endpoint.clone(),
                        headers.clone(),
                        body.clone(),
                        Arc::clone(&adapter),
                        request_hash.clone(),
                        tx,
                    );

                    if self.config.dry_run {
                        let mut pending = pending;
                        pending.resolve(Ok(synthetic_cache_hit_response(&entry)));
                        return rx.await.map_err(|_| BatchlingError::SlotAbandoned)?;
                    }

                    let resume = adapter.build_resume_context(&entry.host, &headers);
                    attach_to_resumed(
                        self,
                        (entry.provider.clone(), entry.host.clone(), entry.batch_id.clone()),
                        Arc::clone(&adapter),
                        resume.base_url,
                        resume.api_headers,
                        entry.batch_id.clone(),
                        entry.custom_id.clone(),
                        pending,
                    )
                    .await;
                    return rx.await.map_err(|_| BatchlingError::SlotAbandoned)?;
                }
            }
        }

        let pending = PendingRequest::new(
            custom_id,
            queue_key.clone(),
            method,
            host,
            endpoint,
            headers,
            body,
            adapter,
            request_hash,
            tx,
        );

        let (new_token, drained) = {
            let mut queues = self.queues.lock().unwrap();
            queues.enqueue(queue_key.clone(), pending, self.config.batch_size)
        };

        if let Some(token) = new_token {
            spawn_window_timer(Arc::clone(self), queue_key.clone(), token);
        }
        if let Some(drained) = drained {
            let handle = tokio::spawn(process_batch(Arc::clone(self), queue_key, drained));
            self.track_task(handle);
        }

        rx.await.map_err(|_| BatchlingError::SlotAbandoned)?
    }

    /// Cancel all window timers, drain and submit every queue, and await
    /// every submission/poll-loop task this flush (or any already running)
    /// spawned, so no request's slot is left unresolved when this returns.
    /// Idempotent.
    pub async fn close(self: &Arc<Self>) {
        info!("closing batcher: flushing all queues");
        let keys = {
            let queues = self.queues.lock().unwrap();
            queues.all_keys()
        };
        for key in keys {
            let drained = {
                let mut queues = self.queues.lock().unwrap();
                queues.drain(&key)
            };
            if !drained.is_empty() {
                process_batch(Arc::clone(self), key, drained).await;
            }
        }

        // Join background tasks in waves: a window-timer task may call
        // `process_batch` directly, which registers a fresh poll-loop handle
        // only once it actually submits, so one pass isn't always enough.
        loop {
            let handles: Vec<tokio::task::JoinHandle<()>> = {
                let mut background = self.background.lock().unwrap();
                std::mem::take(&mut *background)
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(error) = handle.await {
                    warn!(error = %error, "background batcher task panicked during close");
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        let queues = self.queues.lock().unwrap();
        queues.is_empty()
    }

    /// Whether the deferred-idle watchdog has already tripped on this batcher.
    pub fn is_deferred_exited(&self) -> bool {
        self.deferred_exited.load(Ordering::SeqCst)
    }
}

/// The response synthesized for any call made after deferred exit. Carries
/// the `x-batchling-deferred` header so an outer surface can recognize it
/// and translate it into a graceful termination instead of an error.
fn synthetic_deferred_exit_response() -> HttpResponse {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert("x-batchling-deferred", "1".parse().unwrap());
    headers.insert(reqwest::header::CONTENT_TYPE, "application/json".parse().unwrap());
    let body = serde_json::json!({"error": {"type": "deferred_exit"}});
    HttpResponse {
        status: reqwest::StatusCode::from_u16(499).unwrap_or(reqwest::StatusCode::BAD_REQUEST),
        headers,
        body: serde_json::to_vec(&body).unwrap_or_default().into(),
    }
}

fn synthetic_cache_hit_response(entry: &crate::cache::CacheEntry) -> HttpResponse {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert("x-batchling-dry-run", "1".parse().unwrap());
    headers.insert("x-batchling-cache-hit", "1".parse().unwrap());
    headers.insert(reqwest::header::CONTENT_TYPE, "application/json".parse().unwrap());
    let body = serde_json::json!({
        "dry_run": true,
        "custom_id": entry.custom_id,
        "provider": entry.provider,
        "status": "simulated",
    });
    HttpResponse {
        status: reqwest::StatusCode::OK,
        headers,
        body: serde_json::to_vec(&body).unwrap_or_default().into(),
    }
}

fn spawn_window_timer(batcher: Arc<Batcher>, key: crate::request::QueueKey, token: tokio_util::sync::CancellationToken) {
    let window = batcher.config.batch_window;
    let tracking = Arc::clone(&batcher);
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = sleep(window) => {}
            _ = token.cancelled() => { return; }
        }
        let drained = {
            let mut queues = batcher.queues.lock().unwrap();
            if queues.window_tokens.get(&key).map(|t| t.is_cancelled()).unwrap_or(true) {
                return;
            }
            queues.drain(&key)
        };
        if !drained.is_empty() {
            process_batch(batcher, key, drained).await;
        }
    });
    tracking.track_task(handle);
}

fn spawn_deferred_watchdog(batcher: Arc<Batcher>) {
    let idle = batcher.config.deferred_idle;
    tokio::spawn(async move {
        loop {
            sleep(idle / 4 + Duration::from_millis(10)).await;
            let elapsed = batcher.last_intercepted_at.lock().unwrap().elapsed();
            let resumed_empty = batcher.resumed_batches.lock().await.is_empty();
            if elapsed >= idle && batcher.is_idle() && resumed_empty {
                warn!("batcher idle for {:?}, entering deferred exit", elapsed);
                batcher.deferred_exited.store(true, Ordering::SeqCst);
                return;
            }
        }
    });
}
