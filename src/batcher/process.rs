//! Turning a drained queue into either a synthesized dry-run response set
//! or a real provider submission plus its polling loop.

use std::sync::Arc;

use chrono::Utc;
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

use crate::cache::CacheEntry;
use crate::error::BatchlingError;
use crate::http_client::HttpResponse;
use crate::request::{ActiveBatch, PendingRequest, QueueKey};

use super::poll::spawn_active_poll_loop;
use super::Batcher;

/// Resolve every request in a drained batch with a synthesized success
/// response. No provider I/O, no cache write.
pub fn run_dry_run(requests: Vec<PendingRequest>) {
    for mut request in requests {
        let provider = request.adapter.name().to_string();
        let custom_id = request.custom_id.clone();
        let body = serde_json::json!({
            "dry_run": true,
            "custom_id": custom_id,
            "provider": provider,
            "status": "simulated",
        });
        let mut headers = HeaderMap::new();
        headers.insert("x-batchling-dry-run", "1".parse().unwrap());
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "application/json".parse().unwrap(),
        );
        let response = HttpResponse {
            status: reqwest::StatusCode::OK,
            headers,
            body: serde_json::to_vec(&body).unwrap_or_default().into(),
        };
        request.resolve(Ok(response));
    }
}

/// Submit a drained queue to its provider and start polling for results.
/// Runs as a detached background task; failures fail every request in the
/// batch rather than propagating to a caller.
pub async fn process_batch(batcher: Arc<Batcher>, queue_key: QueueKey, requests: Vec<PendingRequest>) {
    if requests.is_empty() {
        return;
    }

    if batcher.config.dry_run {
        debug!(queue = ?queue_key, count = requests.len(), "dry-run: synthesizing batch responses");
        run_dry_run(requests);
        return;
    }

    let adapter = Arc::clone(&requests[0].adapter);
    let host = requests[0].host.clone();
    let api_headers = adapter.build_api_headers(&requests[0].headers);
    let base_url = format!("https://{host}");

    info!(queue = ?queue_key, count = requests.len(), provider = adapter.name(), "submitting batch");

    let submission = match adapter
        .submit_batch(
            batcher.client.as_ref(),
            &base_url,
            &api_headers,
            &queue_key,
            &requests,
        )
        .await
    {
        Ok(submission) => submission,
        Err(error) => {
            warn!(error = %error, queue = ?queue_key, "batch submission failed");
            fail_all(requests, clone_error(&error));
            return;
        }
    };

    if let Some(cache) = &batcher.cache {
        let (provider, endpoint, model) = queue_key.clone();
        let now = Utc::now().timestamp() as f64;
        let entries: Vec<CacheEntry> = requests
            .iter()
            .filter_map(|r| {
                r.request_hash.as_ref().map(|hash| CacheEntry {
                    request_hash: hash.clone(),
                    provider: provider.clone(),
                    endpoint: endpoint.clone(),
                    model: model.clone(),
                    host: host.clone(),
                    batch_id: submission.batch_id.clone(),
                    custom_id: r.custom_id.clone(),
                    created_at: now,
                })
            })
            .collect();
        if let Err(error) = cache.upsert_many(&entries).await {
            warn!(error = %error, "failed to persist cache entries for submitted batch");
        }
        let cutoff = Utc::now() - chrono::Duration::days(30);
        if let Err(error) = cache.delete_older_than(cutoff).await {
            warn!(error = %error, "failed to sweep stale cache rows");
        }
    }

    let waiting = requests
        .into_iter()
        .map(|r| (r.custom_id.clone(), r))
        .collect();
    let active = ActiveBatch {
        queue_key,
        adapter,
        base_url: submission.base_url,
        api_headers: submission.api_headers,
        batch_id: submission.batch_id,
        waiting,
    };

    spawn_active_poll_loop(batcher, active);
}

pub fn fail_all(requests: Vec<PendingRequest>, error: BatchlingError) {
    for mut request in requests {
        request.resolve(Err(clone_error(&error)));
    }
}

/// `BatchlingError` isn't `Clone` (it wraps `reqwest::Error`/`sqlx::Error`);
/// fan-out needs to fail N waiters from one error, so we re-render it as a
/// string-carrying variant instead of cloning the original.
pub fn clone_error(error: &BatchlingError) -> BatchlingError {
    match error {
        BatchlingError::ProviderApi { status, body } => BatchlingError::ProviderApi {
            status: *status,
            body: body.clone(),
        },
        BatchlingError::MissingResult(id) => BatchlingError::MissingResult(id.clone()),
        BatchlingError::Decode(msg) => BatchlingError::Decode(msg.clone()),
        BatchlingError::DeferredExit => BatchlingError::DeferredExit,
        other => BatchlingError::Decode(other.to_string()),
    }
}
