//! Transparent client-side batching router for generative-model HTTP APIs.
//!
//! Bracket a region of code with [`batchify`]; ordinary one-off requests
//! made through an [`InterceptingClient`]-wrapped transport inside that
//! region are transparently rerouted into the provider's batch API and
//! reconstructed to look like the synchronous response the caller expected.

mod api;
mod batcher;
mod cache;
mod error;
mod http_client;
mod intercept;
mod provider;
mod request;
mod scope;
mod util;

pub use api::batchify;
pub use batcher::BatcherConfig;
pub use cache::{CacheEntry, RequestCacheStore, CACHE_PATH_ENV_VAR};
pub use error::{BatchlingError, Result};
pub use http_client::{HttpClient, HttpError, HttpResponse, MultipartFile, BoxedHttpClient};
pub use intercept::InterceptingClient;
pub use provider::{
    AnthropicAdapter, GeminiAdapter, OpenAiLikeAdapter, ProviderAdapter, ProviderRegistry,
    XaiAdapter,
};
pub use scope::{spawn, Scope};
