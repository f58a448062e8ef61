//! Error taxonomy for the batching router.

use thiserror::Error;

/// All errors surfaced by this crate.
#[derive(Debug, Error)]
pub enum BatchlingError {
    /// Request body was missing, not JSON, or lacked a usable model key.
    #[error("request shape error: {0}")]
    RequestShape(String),

    /// Transport-level failure talking to a provider.
    #[error("http error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// A provider API call returned a non-success status.
    #[error("provider api error ({status}): {body}")]
    ProviderApi {
        status: u16,
        body: String,
    },

    /// A provider result line could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A batch reached a terminal state without a result for a `custom_id`.
    #[error("missing result for custom_id {0}")]
    MissingResult(String),

    /// The batcher has entered deferred idle-exit and will accept no further work.
    #[error("batcher has deferred-exited")]
    DeferredExit,

    /// JSON (de)serialization failure not tied to a specific provider response.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cache store failure.
    #[error("cache error: {0}")]
    Cache(#[from] sqlx::Error),

    /// No provider adapter recognized the request; caller should pass it through.
    #[error("no adapter matched this request")]
    AdapterMatchMissing,

    /// Two adapters claimed the same (host, path) triple at registration time.
    #[error("duplicate adapter registration for host {host} path {path}")]
    DuplicateAdapter { host: String, path: String },

    /// The caller's oneshot result slot was dropped before resolution.
    #[error("result slot was abandoned")]
    SlotAbandoned,
}

pub type Result<T> = std::result::Result<T, BatchlingError>;
