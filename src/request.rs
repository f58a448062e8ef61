//! Request and batch lifecycle types shared across the batcher.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use tokio::sync::oneshot;

use crate::error::BatchlingError;
use crate::http_client::HttpResponse;
use crate::provider::ProviderAdapter;

/// `(provider, endpoint, model)`. Every batch submitted to a provider
/// contains requests from exactly one queue key.
pub type QueueKey = (String, String, String);

/// One in-flight caller request, captured at interception time and waiting
/// on its result slot.
pub struct PendingRequest {
    pub custom_id: String,
    pub queue_key: QueueKey,
    pub method: reqwest::Method,
    pub host: String,
    pub endpoint: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub request_hash: Option<String>,
    slot: Option<oneshot::Sender<Result<HttpResponse, BatchlingError>>>,
}

impl PendingRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        custom_id: String,
        queue_key: QueueKey,
        method: reqwest::Method,
        host: String,
        endpoint: String,
        headers: HeaderMap,
        body: Bytes,
        adapter: Arc<dyn ProviderAdapter>,
        request_hash: Option<String>,
        slot: oneshot::Sender<Result<HttpResponse, BatchlingError>>,
    ) -> Self {
        Self {
            custom_id,
            queue_key,
            method,
            host,
            endpoint,
            headers,
            body,
            adapter,
            request_hash,
            slot: Some(slot),
        }
    }

    /// Resolve this request's slot exactly once. Subsequent calls are no-ops,
    /// matching the spec's "resolved exactly once" invariant structurally:
    /// the sender is consumed on first use.
    pub fn resolve(&mut self, result: Result<HttpResponse, BatchlingError>) {
        if let Some(slot) = self.slot.take() {
            let _ = slot.send(result);
        }
    }

    pub fn parsed_body(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// A submitted provider batch whose results are being polled.
pub struct ActiveBatch {
    pub queue_key: QueueKey,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub base_url: String,
    pub api_headers: HeaderMap,
    pub batch_id: String,
    pub waiting: HashMap<String, PendingRequest>,
}

/// A batch attached-to via cache lookup rather than freshly submitted.
/// Multiple in-process callers converging on one provider `custom_id` are
/// coalesced here: one poll loop, N resolutions.
pub struct ResumedBatch {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub base_url: String,
    pub api_headers: HeaderMap,
    pub batch_id: String,
    pub waiting: HashMap<String, Vec<PendingRequest>>,
}
