//! Polling loops: one per freshly submitted active batch, one per
//! cache-resumed batch. Both terminate by fanning results out to waiting
//! requests.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::BatchlingError;
use crate::http_client::HttpResponse;
use crate::request::{ActiveBatch, PendingRequest, ResumedBatch};

use super::process::{clone_error, fail_all};
use super::Batcher;

fn decoded_to_response(result: &crate::provider::DecodedResult) -> HttpResponse {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        "application/json".parse().unwrap(),
    );
    HttpResponse {
        status: reqwest::StatusCode::from_u16(result.status).unwrap_or(reqwest::StatusCode::OK),
        headers,
        body: serde_json::to_vec(&result.body).unwrap_or_default().into(),
    }
}

pub fn spawn_active_poll_loop(batcher: Arc<Batcher>, mut active: ActiveBatch) {
    let tracking = Arc::clone(&batcher);
    let handle = tokio::spawn(async move {
        loop {
            sleep(batcher.config.poll_interval).await;

            let snapshot = match active
                .adapter
                .poll_batch(
                    batcher.client.as_ref(),
                    &active.base_url,
                    &active.api_headers,
                    &active.batch_id,
                )
                .await
            {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(error = %error, batch_id = %active.batch_id, "poll tick failed, will retry");
                    continue;
                }
            };

            debug!(batch_id = %active.batch_id, status = %snapshot.status, "polled batch");

            if !snapshot.is_terminal {
                continue;
            }

            if !snapshot.is_success && snapshot.output_ref.is_none() && snapshot.error_ref.is_none() {
                let waiting: Vec<PendingRequest> = active.waiting.into_values().collect();
                fail_all(
                    waiting,
                    BatchlingError::ProviderApi {
                        status: 0,
                        body: format!("batch reached terminal state {}", snapshot.status),
                    },
                );
                return;
            }

            let results = match active
                .adapter
                .fetch_results(
                    batcher.client.as_ref(),
                    &active.base_url,
                    &active.api_headers,
                    &active.batch_id,
                    &snapshot,
                )
                .await
            {
                Ok(results) => results,
                Err(error) => {
                    error!(error = %error, batch_id = %active.batch_id, "failed to decode batch results");
                    let waiting: Vec<PendingRequest> = active.waiting.into_values().collect();
                    fail_all(waiting, clone_error(&error));
                    return;
                }
            };

            for result in &results {
                if let Some(mut request) = active.waiting.remove(&result.custom_id) {
                    request.resolve(Ok(decoded_to_response(result)));
                }
            }
            for (custom_id, mut request) in active.waiting.drain() {
                request.resolve(Err(BatchlingError::MissingResult(custom_id)));
            }
            return;
        }
    });
    tracking.track_task(handle);
}

/// Attach a freshly submitted pending request to an already-running (or
/// newly created) resumed-batch poll loop, keyed by `(provider, host, batch_id)`.
pub async fn attach_to_resumed(
    batcher: &Arc<Batcher>,
    key: (String, String, String),
    adapter: Arc<dyn crate::provider::ProviderAdapter>,
    base_url: String,
    api_headers: reqwest::header::HeaderMap,
    batch_id: String,
    custom_id: String,
    request: PendingRequest,
) {
    let mut resumed = batcher.resumed_batches.lock().await;
    if let Some(existing) = resumed.get_mut(&key) {
        existing.waiting.entry(custom_id).or_default().push(request);
        return;
    }

    let mut waiting = std::collections::HashMap::new();
    waiting.insert(custom_id, vec![request]);
    let batch = ResumedBatch {
        adapter,
        base_url,
        api_headers,
        batch_id,
        waiting,
    };
    resumed.insert(key.clone(), batch);
    drop(resumed);

    spawn_resumed_poll_loop(Arc::clone(batcher), key);
}

fn spawn_resumed_poll_loop(batcher: Arc<Batcher>, key: (String, String, String)) {
    let tracking = Arc::clone(&batcher);
    let handle = tokio::spawn(async move {
        loop {
            sleep(batcher.config.poll_interval).await;

            let (adapter, base_url, api_headers, batch_id) = {
                let resumed = batcher.resumed_batches.lock().await;
                match resumed.get(&key) {
                    Some(batch) => (
                        Arc::clone(&batch.adapter),
                        batch.base_url.clone(),
                        batch.api_headers.clone(),
                        batch.batch_id.clone(),
                    ),
                    None => return,
                }
            };

            let snapshot = match adapter
                .poll_batch(batcher.client.as_ref(), &base_url, &api_headers, &batch_id)
                .await
            {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(error = %error, batch_id = %batch_id, "resumed poll tick failed, will retry");
                    continue;
                }
            };

            if !snapshot.is_terminal {
                continue;
            }

            let mut resumed = batcher.resumed_batches.lock().await;
            let Some(mut batch) = resumed.remove(&key) else {
                return;
            };
            drop(resumed);

            let results = match adapter
                .fetch_results(batcher.client.as_ref(), &base_url, &api_headers, &batch_id, &snapshot)
                .await
            {
                Ok(results) => results,
                Err(error) => {
                    error!(error = %error, batch_id = %batch_id, "failed to decode resumed batch results");
                    if let Some(hashes) = collect_hashes(&batch) {
                        if let Some(cache) = &batcher.cache {
                            let _ = cache.delete_by_hashes(&hashes).await;
                        }
                    }
                    for (_, waiters) in batch.waiting.drain() {
                        fail_all(waiters, clone_error(&error));
                    }
                    return;
                }
            };

            for result in &results {
                if let Some(waiters) = batch.waiting.remove(&result.custom_id) {
                    for mut waiter in waiters {
                        waiter.resolve(Ok(decoded_to_response(result)));
                    }
                }
            }
            let missing_hashes: Vec<String> = batch
                .waiting
                .values()
                .flatten()
                .filter_map(|r| r.request_hash.clone())
                .collect();
            if !missing_hashes.is_empty() {
                if let Some(cache) = &batcher.cache {
                    let _ = cache.delete_by_hashes(&missing_hashes).await;
                }
            }
            for (custom_id, waiters) in batch.waiting.drain() {
                for mut waiter in waiters {
                    waiter.resolve(Err(BatchlingError::MissingResult(custom_id.clone())));
                }
            }
            return;
        }
    });
    tracking.track_task(handle);
}

fn collect_hashes(batch: &ResumedBatch) -> Option<Vec<String>> {
    let hashes: Vec<String> = batch
        .waiting
        .values()
        .flatten()
        .filter_map(|r| r.request_hash.clone())
        .collect();
    if hashes.is_empty() {
        None
    } else {
        Some(hashes)
    }
}
