//! Resolves an adapter for `(method, host, path)`, built once at startup.

use std::sync::Arc;

use reqwest::Method;

use crate::error::{BatchlingError, Result};

use super::openai_like::{
    cerebras_dialect, doubleword_dialect, groq_dialect, mistral_dialect, openai_dialect,
    together_dialect, OpenAiLikeAdapter,
};
use super::{AnthropicAdapter, GeminiAdapter, ProviderAdapter, XaiAdapter};

pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Build the registry with every known provider adapter. Fails fast if
    /// two adapters would claim the same hostname.
    pub fn with_defaults() -> Result<Self> {
        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
            Arc::new(OpenAiLikeAdapter::new(openai_dialect())),
            Arc::new(OpenAiLikeAdapter::new(doubleword_dialect())),
            Arc::new(OpenAiLikeAdapter::new(groq_dialect())),
            Arc::new(OpenAiLikeAdapter::new(cerebras_dialect())),
            Arc::new(OpenAiLikeAdapter::new(mistral_dialect())),
            Arc::new(OpenAiLikeAdapter::new(together_dialect())),
            Arc::new(AnthropicAdapter),
            Arc::new(GeminiAdapter),
            Arc::new(XaiAdapter),
        ];
        Self::new(adapters)
    }

    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Result<Self> {
        let mut seen_hosts: Vec<&'static str> = Vec::new();
        for adapter in &adapters {
            for host in adapter.hostnames() {
                if seen_hosts.contains(host) {
                    return Err(BatchlingError::DuplicateAdapter {
                        host: host.to_string(),
                        path: String::new(),
                    });
                }
                seen_hosts.push(host);
            }
        }
        Ok(Self { adapters })
    }

    /// Resolve an adapter for an outbound request, or `None` if it should
    /// pass through untouched.
    pub fn resolve(&self, method: &Method, host: &str, path: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.is_batchable_request(method, host, path))
            .cloned()
    }
}
