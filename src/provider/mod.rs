//! Provider adapters: the per-upstream strategy for recognizing batchable
//! traffic and translating it to/from that provider's batch API.

mod anthropic;
mod gemini;
mod openai_like;
mod registry;
mod xai;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai_like::{OpenAiLikeAdapter, OpenAiLikeDialect};
pub use registry::ProviderRegistry;
pub use xai::XaiAdapter;

#[cfg(test)]
pub(crate) use openai_like::openai_dialect;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::error::{BatchlingError, Result};
use crate::request::{PendingRequest, QueueKey};

/// Normalized poll snapshot, independent of how each provider shapes its
/// status payload.
#[derive(Debug, Clone)]
pub struct PollSnapshot {
    pub status: String,
    pub is_terminal: bool,
    pub is_success: bool,
    pub output_ref: Option<String>,
    pub error_ref: Option<String>,
}

/// What a freshly submitted batch looks like once creation succeeds.
#[derive(Debug, Clone)]
pub struct BatchSubmission {
    pub base_url: String,
    pub api_headers: HeaderMap,
    pub batch_id: String,
}

/// Context carried for the cache-hit / resumed-batch path, where the
/// original request is not being reissued.
#[derive(Debug, Clone)]
pub struct ResumeContext {
    pub base_url: String,
    pub api_headers: HeaderMap,
}

/// One decoded provider result line.
#[derive(Debug, Clone)]
pub struct DecodedResult {
    pub custom_id: String,
    pub status: u16,
    pub body: Value,
}

/// The capability set every provider batch integration implements. Kept
/// object-safe (`Arc<dyn ProviderAdapter>`) so the registry can hold a
/// heterogeneous set of providers behind one table.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable adapter name, used as the provider component of a queue key
    /// and cache row.
    fn name(&self) -> &'static str;

    /// Hostname suffixes this adapter claims.
    fn hostnames(&self) -> &'static [&'static str];

    /// Endpoint path templates recognized as batchable. A `{param}` segment
    /// matches exactly one path segment.
    fn batchable_endpoints(&self) -> &'static [&'static str];

    /// HTTP method expected for batchable calls (`POST` for every known
    /// provider today).
    fn batch_method(&self) -> reqwest::Method {
        reqwest::Method::POST
    }

    /// `true` iff `(method, host, path)` should be diverted to the batcher.
    fn is_batchable_request(&self, method: &reqwest::Method, host: &str, path: &str) -> bool {
        if method != &self.batch_method() {
            return false;
        }
        if !self.hostnames().iter().any(|h| host.ends_with(h)) {
            return false;
        }
        self.batchable_endpoints()
            .iter()
            .any(|pattern| path_matches_template(pattern, path))
    }

    /// Extract the model key used for queue partitioning from the request
    /// body (or, for path-embedded providers, the endpoint string).
    fn extract_model(&self, endpoint: &str, body: &Value) -> Result<String>;

    /// Keep only the headers the provider batch API needs (credentials),
    /// dropping everything else from the original caller request.
    fn build_api_headers(&self, request_headers: &HeaderMap) -> HeaderMap;

    /// Whether submission is file-based (upload then reference) or inline
    /// (requests posted directly in the create-batch payload).
    fn is_file_based(&self) -> bool;

    /// Serialize pending requests into this provider's batch-line format,
    /// one JSON value per line, in enqueue order.
    fn build_batch_lines(&self, requests: &[PendingRequest]) -> Result<Vec<Value>>;

    /// Submit a drained queue of pending requests to the provider, returning
    /// the created batch's identity. Performs upload (if file-based) and
    /// batch-creation HTTP calls itself via `client`.
    async fn submit_batch(
        &self,
        client: &dyn crate::http_client::HttpClient,
        base_url: &str,
        api_headers: &HeaderMap,
        queue_key: &QueueKey,
        requests: &[PendingRequest],
    ) -> Result<BatchSubmission>;

    /// Poll a batch's current state.
    async fn poll_batch(
        &self,
        client: &dyn crate::http_client::HttpClient,
        base_url: &str,
        api_headers: &HeaderMap,
        batch_id: &str,
    ) -> Result<PollSnapshot>;

    /// Download and decode a terminal batch's results into per-`custom_id`
    /// responses.
    async fn fetch_results(
        &self,
        client: &dyn crate::http_client::HttpClient,
        base_url: &str,
        api_headers: &HeaderMap,
        batch_id: &str,
        snapshot: &PollSnapshot,
    ) -> Result<Vec<DecodedResult>>;

    /// Resolve the resume context (base url, api headers) for the cache-hit
    /// path, where polling is driven purely by a stored `(host, batch_id)`.
    fn build_resume_context(&self, host: &str, headers: &HeaderMap) -> ResumeContext {
        ResumeContext {
            base_url: format!("https://{host}"),
            api_headers: self.build_api_headers(headers),
        }
    }
}

/// Match a single-segment `{param}` template against a concrete path.
fn path_matches_template(pattern: &str, path: &str) -> bool {
    if !pattern.contains('{') {
        return pattern == path;
    }
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    if pattern_segments.len() != path_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(path_segments.iter())
        .all(|(p, s)| (p.starts_with('{') && p.ends_with('}')) || p == s)
}

pub(crate) fn require_string_model(endpoint: &str, body: &Value) -> Result<String> {
    match body.get("model").and_then(Value::as_str) {
        Some(model) if !model.is_empty() => Ok(model.to_string()),
        _ => Err(BatchlingError::RequestShape(format!(
            "endpoint {endpoint} body has no usable \"model\" string"
        ))),
    }
}
