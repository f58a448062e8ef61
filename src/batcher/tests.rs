//! Exercises the scheduling properties from the external spec: size
//! threshold draining, dry-run short-circuiting, and cross-model
//! partitioning. Uses a fake transport instead of a real provider so these
//! run offline and fast.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};

use crate::http_client::{HttpClient, HttpError, HttpResponse, MultipartFile};
use crate::provider::{openai_dialect, OpenAiLikeAdapter, ProviderRegistry};

use super::{Batcher, BatcherConfig};

fn json_response(value: Value) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        "application/json".parse().unwrap(),
    );
    HttpResponse {
        status: StatusCode::OK,
        headers,
        body: serde_json::to_vec(&value).unwrap().into(),
    }
}

/// Records every call it receives and answers batch create/poll/content
/// calls deterministically, echoing back whatever `custom_id`s were
/// uploaded so the fan-out can be asserted against.
#[derive(Default)]
struct FakeHttpClient {
    uploaded_jsonl: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeHttpClient {
    fn call_count(&self, method: &str, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p)| m == method && p == path)
            .count()
    }
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn request(
        &self,
        method: Method,
        url: Url,
        _headers: HeaderMap,
        _body: Option<Bytes>,
    ) -> Result<HttpResponse, HttpError> {
        let path = url.path().to_string();
        self.calls.lock().unwrap().push((method.to_string(), path.clone()));

        if method == Method::POST && path == "/v1/batches" {
            let id = format!("batch-{}", self.calls.lock().unwrap().len());
            return Ok(json_response(json!({"id": id, "status": "validating"})));
        }
        if method == Method::GET && path.starts_with("/v1/batches/") {
            return Ok(json_response(json!({
                "status": "completed",
                "output_file_id": "file-out",
            })));
        }
        if method == Method::GET && path == "/v1/files/file-out/content" {
            let jsonl = self
                .uploaded_jsonl
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            let mut out = String::new();
            for line in jsonl.lines() {
                let value: Value = serde_json::from_str(line).unwrap();
                let custom_id = value["custom_id"].as_str().unwrap();
                out.push_str(
                    &serde_json::to_string(&json!({
                        "custom_id": custom_id,
                        "response": {"status_code": 200, "body": {"ok": true}},
                    }))
                    .unwrap(),
                );
                out.push('\n');
            }
            let mut headers = HeaderMap::new();
            headers.insert(reqwest::header::CONTENT_TYPE, "application/jsonl".parse().unwrap());
            return Ok(HttpResponse {
                status: StatusCode::OK,
                headers,
                body: out.into_bytes().into(),
            });
        }

        Err(HttpError::Status {
            status: StatusCode::NOT_FOUND,
            body: Bytes::from_static(b"unhandled fake route"),
        })
    }

    async fn request_multipart(
        &self,
        method: Method,
        url: Url,
        _headers: HeaderMap,
        _fields: Vec<(String, String)>,
        file: MultipartFile,
    ) -> Result<HttpResponse, HttpError> {
        let path = url.path().to_string();
        self.calls.lock().unwrap().push((method.to_string(), path));
        let text = String::from_utf8(file.bytes.to_vec()).unwrap();
        self.uploaded_jsonl.lock().unwrap().push_back(text);
        Ok(json_response(json!({"id": "file-out"})))
    }
}

fn test_registry() -> Arc<ProviderRegistry> {
    let adapter: Arc<dyn crate::provider::ProviderAdapter> =
        Arc::new(OpenAiLikeAdapter::new(openai_dialect()));
    Arc::new(ProviderRegistry::new(vec![adapter]).unwrap())
}

fn auth_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, "Bearer sk-test".parse().unwrap());
    headers
}

#[tokio::test(flavor = "multi_thread")]
async fn size_threshold_drains_exactly_once() {
    let fake = Arc::new(FakeHttpClient::default());
    let config = BatcherConfig {
        batch_size: 3,
        batch_window: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
        cache: false,
        ..BatcherConfig::default()
    };
    let batcher = Batcher::new(config, fake.clone(), test_registry(), None);

    let adapter = batcher.resolve_adapter(&Method::POST, "api.openai.com", "/v1/chat/completions").unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let batcher = batcher.clone();
        let adapter = adapter.clone();
        handles.push(tokio::spawn(async move {
            batcher
                .submit(
                    adapter,
                    Method::POST,
                    "api.openai.com".to_string(),
                    "/v1/chat/completions".to_string(),
                    auth_headers(),
                    Bytes::from_static(br#"{"model":"gpt-4o","messages":[]}"#),
                )
                .await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        let body: Value = response.json().unwrap();
        assert_eq!(body["ok"], true);
    }

    assert_eq!(fake.call_count("POST", "/v1/files"), 1);
    assert_eq!(fake.call_count("POST", "/v1/batches"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn dry_run_resolves_without_any_http_call() {
    let fake = Arc::new(FakeHttpClient::default());
    let config = BatcherConfig {
        batch_size: 1,
        batch_window: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
        dry_run: true,
        cache: false,
        ..BatcherConfig::default()
    };
    let batcher = Batcher::new(config, fake.clone(), test_registry(), None);
    let adapter = batcher.resolve_adapter(&Method::POST, "api.openai.com", "/v1/chat/completions").unwrap();

    let response = batcher
        .submit(
            adapter,
            Method::POST,
            "api.openai.com".to_string(),
            "/v1/chat/completions".to_string(),
            auth_headers(),
            Bytes::from_static(br#"{"model":"gpt-4o","messages":[]}"#),
        )
        .await
        .unwrap();

    assert!(response.headers.contains_key("x-batchling-dry-run"));
    assert!(fake.calls.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cross_model_requests_partition_into_separate_batches() {
    let fake = Arc::new(FakeHttpClient::default());
    let config = BatcherConfig {
        batch_size: 1,
        batch_window: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
        cache: false,
        ..BatcherConfig::default()
    };
    let batcher = Batcher::new(config, fake.clone(), test_registry(), None);
    let adapter = batcher.resolve_adapter(&Method::POST, "api.openai.com", "/v1/chat/completions").unwrap();

    for model in ["gpt-4o", "gpt-4o-mini"] {
        let response = batcher
            .submit(
                adapter.clone(),
                Method::POST,
                "api.openai.com".to_string(),
                "/v1/chat/completions".to_string(),
                auth_headers(),
                Bytes::from(format!(r#"{{"model":"{model}","messages":[]}}"#)),
            )
            .await
            .unwrap();
        let body: Value = response.json().unwrap();
        assert_eq!(body["ok"], true);
    }

    assert_eq!(fake.call_count("POST", "/v1/batches"), 2);
}
