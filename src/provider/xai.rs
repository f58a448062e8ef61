//! xAI: two-step submission (create empty batch, then push requests),
//! polling by counting pending vs completed, and `batch_request_id` as the
//! result line's custom-id field.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

use crate::error::{BatchlingError, Result};
use crate::http_client::{HttpClient, INTERNAL_HEADER};
use crate::request::{PendingRequest, QueueKey};

use super::{require_string_model, BatchSubmission, DecodedResult, PollSnapshot, ProviderAdapter};

const HOSTNAMES: &[&str] = &["api.x.ai"];
const BATCHABLE_ENDPOINTS: &[&str] = &["/v1/chat/completions"];
const BATCH_ENDPOINT: &str = "/v1/batches";

pub struct XaiAdapter;

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
impl ProviderAdapter for XaiAdapter {
    fn name(&self) -> &'static str {
        "xai"
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
        if let Some(auth) = request_headers.get(AUTHORIZATION) {
            headers.insert(AUTHORIZATION, auth.clone());
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
                    "batch_request_id": request.custom_id,
                    "body": body,
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
        let mut headers = api_headers.clone();
        headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let create_url = format!("{base_url}{BATCH_ENDPOINT}")
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let create_response = client
            .request(Method::POST, create_url, headers.clone(), Some(b"{}".to_vec().into()))
            .await
            .map_err(http_error_to_provider)?;
        let create_body: Value = create_response
            .json()
            .map_err(|e| BatchlingError::Decode(e.to_string()))?;
        let batch_id = create_body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BatchlingError::Decode("create response missing batch id".to_string()))?
            .to_string();

        let lines = self.build_batch_lines(requests)?;
        let push_url = format!("{base_url}{BATCH_ENDPOINT}/{batch_id}/requests")
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let push_payload = serde_json::json!({ "requests": lines });
        client
            .request(Method::POST, push_url, headers, Some(serde_json::to_vec(&push_payload)?.into()))
            .await
            .map_err(http_error_to_provider)?;

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
        let num_pending = body.get("num_pending").and_then(Value::as_u64).unwrap_or(0);
        let num_completed = body.get("num_completed").and_then(Value::as_u64).unwrap_or(0);
        let state = body.get("state").and_then(Value::as_str).unwrap_or("").to_string();
        let is_terminal = state == "ended" || (num_pending == 0 && num_completed > 0);
        Ok(PollSnapshot {
            is_success: is_terminal,
            is_terminal,
            output_ref: Some(batch_id.to_string()),
            error_ref: None,
            status: state,
        })
    }

    async fn fetch_results(
        &self,
        client: &dyn HttpClient,
        base_url: &str,
        api_headers: &HeaderMap,
        batch_id: &str,
        _snapshot: &PollSnapshot,
    ) -> Result<Vec<DecodedResult>> {
        let mut headers = api_headers.clone();
        headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        let url = format!("{base_url}{BATCH_ENDPOINT}/{batch_id}/results")
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let response = client
            .request(Method::GET, url, headers, None)
            .await
            .map_err(http_error_to_provider)?;
        let body: Value = response
            .json()
            .map_err(|e| BatchlingError::Decode(e.to_string()))?;
        let results = body
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| BatchlingError::Decode("results response missing results array".to_string()))?;

        let mut decoded = Vec::new();
        for item in results {
            let custom_id = item
                .get("batch_request_id")
                .and_then(Value::as_str)
                .ok_or_else(|| BatchlingError::Decode("result item missing batch_request_id".to_string()))?
                .to_string();
            let status = item.get("status_code").and_then(Value::as_u64).unwrap_or(200) as u16;
            let body = item.get("body").cloned().unwrap_or(Value::Null);
            decoded.push(DecodedResult { custom_id, status, body });
        }
        Ok(decoded)
    }
}
