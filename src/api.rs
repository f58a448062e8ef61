//! Public entry point: construct a Batcher from configuration and hand back
//! a [`Scope`] ready to bracket the code that should be batched.

use std::sync::Arc;

use crate::batcher::{Batcher, BatcherConfig};
use crate::cache::{resolve_cache_path, RequestCacheStore};
use crate::error::Result;
use crate::provider::ProviderRegistry;
use crate::scope::Scope;

/// Build a Batcher from `config` and return the scope that activates it.
/// Mirrors the single public entry point of the source system: one call,
/// one scope, everything else driven by bracketing it.
///
/// The Batcher's own outbound calls (uploads, polls, result fetches) go
/// straight to a plain transport; they never need [`crate::intercept::InterceptingClient`]
/// themselves, since nothing reroutes them back into the batcher. Wrap your
/// own SDK's HTTP client with `InterceptingClient` separately to have its
/// calls diverted while this scope is active.
pub async fn batchify(config: BatcherConfig) -> Result<Scope> {
    let registry = Arc::new(ProviderRegistry::with_defaults()?);

    let cache = if config.cache {
        let path = resolve_cache_path(config.cache_path.clone());
        Some(RequestCacheStore::open(&path).await?)
    } else {
        None
    };

    let client: Arc<dyn crate::http_client::HttpClient> = Arc::new(reqwest::Client::new());

    let batcher = Batcher::new(config, client, registry, cache);
    Ok(Scope::new(batcher))
}
