//! Canonical JSON fingerprinting used to key the request cache.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Recursively sort object keys so two structurally identical payloads
/// always serialize to the same bytes regardless of field order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// `SHA-256(canonical_json({provider, endpoint, model, host, body}))`.
pub fn request_hash(provider: &str, endpoint: &str, model: &str, host: &str, body: &Value) -> String {
    let envelope = serde_json::json!({
        "provider": provider,
        "endpoint": endpoint,
        "model": model,
        "host": host,
        "body": canonicalize(body),
    });
    // serde_json's compact Display already omits whitespace; together with
    // sorted keys this is our canonical encoding.
    let bytes = serde_json::to_vec(&envelope).expect("json envelope never fails to serialize");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_under_key_reordering() {
        let a = serde_json::json!({"model": "gpt-4o", "messages": []});
        let b = serde_json::json!({"messages": [], "model": "gpt-4o"});
        let h1 = request_hash("openai", "/v1/chat/completions", "gpt-4o", "api.openai.com", &a);
        let h2 = request_hash("openai", "/v1/chat/completions", "gpt-4o", "api.openai.com", &b);
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_differs_on_model() {
        let body = serde_json::json!({"model": "gpt-4o"});
        let h1 = request_hash("openai", "/v1/chat/completions", "gpt-4o", "api.openai.com", &body);
        let h2 = request_hash("openai", "/v1/chat/completions", "gpt-4o-mini", "api.openai.com", &body);
        assert_ne!(h1, h2);
    }
}
