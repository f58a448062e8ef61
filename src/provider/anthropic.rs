//! Anthropic: inline batch submission, no file upload step. The poll
//! response itself carries the results URL once the batch ends.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;

use crate::error::{BatchlingError, Result};
use crate::http_client::{HttpClient, INTERNAL_HEADER};
use crate::request::{PendingRequest, QueueKey};

use super::{require_string_model, BatchSubmission, DecodedResult, PollSnapshot, ProviderAdapter};

const HOSTNAMES: &[&str] = &["api.anthropic.com"];
const BATCHABLE_ENDPOINTS: &[&str] = &["/v1/messages"];
const BATCH_ENDPOINT: &str = "/v1/messages/batches";

pub struct AnthropicAdapter;

fn http_error_to_provider(error: crate::http_client::HttpError) -> BatchlingError {
    match error {
        crate::http_client::HttpError::Reqwest(e) => BatchlingError::Reqwest(e),
        crate::http_client::HttpError::Status { status, body } => BatchlingError::ProviderApi {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).to_string(),
        },
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn hostnames(&self) -> &'static [&'static str] {
        HOSTNAMES
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        BATCHABLE_ENDPOINTS
    }

    fn extract_model(&self, endpoint: &str, body: &Value) -> Result<String> {
        require_string_model(endpoint, body)
    }

    fn build_api_headers(&self, request_headers: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for name in ["x-api-key", "anthropic-version", "anthropic-beta"] {
            if let Some(value) = request_headers.get(name) {
                headers.insert(
                    reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    value.clone(),
                );
            }
        }
        headers
    }

    fn is_file_based(&self) -> bool {
        false
    }

    fn build_batch_lines(&self, requests: &[PendingRequest]) -> Result<Vec<Value>> {
        requests
            .iter()
            .map(|request| {
                let body = request.parsed_body().ok_or_else(|| {
                    BatchlingError::RequestShape(format!(
                        "request {} has a non-JSON body",
                        request.custom_id
                    ))
                })?;
                Ok(serde_json::json!({
                    "custom_id": request.custom_id,
                    "params": body,
                }))
            })
            .collect()
    }

    async fn submit_batch(
        &self,
        client: &dyn HttpClient,
        base_url: &str,
        api_headers: &HeaderMap,
        _queue_key: &QueueKey,
        requests: &[PendingRequest],
    ) -> Result<BatchSubmission> {
        let lines = self.build_batch_lines(requests)?;
        let payload = serde_json::json!({ "requests": lines });

        let mut headers = api_headers.clone();
        headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let url = format!("{base_url}{BATCH_ENDPOINT}")
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let response = client
            .request(Method::POST, url, headers, Some(serde_json::to_vec(&payload)?.into()))
            .await
            .map_err(http_error_to_provider)?;
        let body: Value = response
            .json()
            .map_err(|e| BatchlingError::Decode(e.to_string()))?;
        let batch_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BatchlingError::Decode("create response missing batch id".to_string()))?
            .to_string();

        Ok(BatchSubmission {
            base_url: base_url.to_string(),
            api_headers: api_headers.clone(),
            batch_id,
        })
    }

    async fn poll_batch(
        &self,
        client: &dyn HttpClient,
        base_url: &str,
        api_headers: &HeaderMap,
        batch_id: &str,
    ) -> Result<PollSnapshot> {
        let mut headers = api_headers.clone();
        headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        let url = format!("{base_url}{BATCH_ENDPOINT}/{batch_id}")
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let response = client
            .request(Method::GET, url, headers, None)
            .await
            .map_err(http_error_to_provider)?;
        let body: Value = response
            .json()
            .map_err(|e| BatchlingError::Decode(e.to_string()))?;
        let status = body
            .get("processing_status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let is_terminal = status == "ended";
        let results_url = body
            .get("results_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(PollSnapshot {
            is_success: is_terminal && results_url.is_some(),
            is_terminal,
            output_ref: results_url,
            error_ref: None,
            status,
        })
    }

    async fn fetch_results(
        &self,
        client: &dyn HttpClient,
        base_url: &str,
        api_headers: &HeaderMap,
        _batch_id: &str,
        snapshot: &PollSnapshot,
    ) -> Result<Vec<DecodedResult>> {
        let results_url = snapshot
            .output_ref
            .as_ref()
            .ok_or_else(|| BatchlingError::Decode("batch completed without output".to_string()))?;
        let mut headers = api_headers.clone();
        headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        // results_url may already be absolute; fall back to base_url-relative.
        let url = if results_url.starts_with("http") {
            results_url.clone()
        } else {
            format!("{base_url}{results_url}")
        }
        .parse()
        .expect("provider-supplied results url is always valid");
        let response = client
            .request(Method::GET, url, headers, None)
            .await
            .map_err(http_error_to_provider)?;

        let mut decoded = Vec::new();
        for line in std::str::from_utf8(&response.body)
            .map_err(|e| BatchlingError::Decode(e.to_string()))?
            .lines()
            .filter(|l| !l.trim().is_empty())
        {
            let value: Value =
                serde_json::from_str(line).map_err(|e| BatchlingError::Decode(e.to_string()))?;
            let custom_id = value
                .get("custom_id")
                .and_then(Value::as_str)
                .ok_or_else(|| BatchlingError::Decode("result line missing custom_id".to_string()))?
                .to_string();
            let result = value
                .get("result")
                .ok_or_else(|| BatchlingError::Decode("result line missing result".to_string()))?;
            let result_type = result.get("type").and_then(Value::as_str).unwrap_or("");
            if result_type == "succeeded" {
                let body = result.get("message").cloned().unwrap_or(Value::Null);
                decoded.push(DecodedResult { custom_id, status: 200, body });
            } else {
                let error_obj = result.get("error").cloned().unwrap_or(Value::Null);
                let status = error_obj
                    .get("status_code")
                    .and_then(Value::as_u64)
                    .unwrap_or(500) as u16;
                decoded.push(DecodedResult {
                    custom_id,
                    status,
                    body: serde_json::json!({"error": error_obj}),
                });
            }
        }
        Ok(decoded)
    }
}
