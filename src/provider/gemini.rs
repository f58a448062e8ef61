//! Gemini: model is embedded in the path rather than the body, submission is
//! a two-step resumable upload, and results come back through a download
//! endpoint keyed by `alt=media`.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;

use crate::error::{BatchlingError, Result};
use crate::http_client::{HttpClient, INTERNAL_HEADER};
use crate::request::{PendingRequest, QueueKey};

use super::{BatchSubmission, DecodedResult, PollSnapshot, ProviderAdapter};

const HOSTNAMES: &[&str] = &["generativelanguage.googleapis.com"];
const BATCHABLE_SUFFIX: &str = ":generateContent";

pub struct GeminiAdapter;

fn http_error_to_provider(error: crate::http_client::HttpError) -> BatchlingError {
    match error {
        crate::http_client::HttpError::Reqwest(e) => BatchlingError::Reqwest(e),
        crate::http_client::HttpError::Status { status, body } => BatchlingError::ProviderApi {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).to_string(),
        },
    }
}

/// `/v1beta/models/{model}:generateContent` -> `{model}`.
fn model_from_path(path: &str) -> Option<&str> {
    let last = path.rsplit('/').next()?;
    last.strip_suffix(BATCHABLE_SUFFIX)
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn hostnames(&self) -> &'static [&'static str] {
        HOSTNAMES
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &["/v1beta/models/{model}:generateContent"]
    }

    fn is_batchable_request(&self, method: &reqwest::Method, host: &str, path: &str) -> bool {
        method == reqwest::Method::POST
            && self.hostnames().iter().any(|h| host.ends_with(h))
            && model_from_path(path).is_some()
    }

    fn extract_model(&self, endpoint: &str, _body: &Value) -> Result<String> {
        model_from_path(endpoint)
            .map(str::to_string)
            .ok_or_else(|| BatchlingError::RequestShape(format!("cannot extract model from {endpoint}")))
    }

    fn build_api_headers(&self, request_headers: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = request_headers.get("x-goog-api-key") {
            headers.insert("x-goog-api-key", value.clone());
        }
        headers
    }

    fn is_file_based(&self) -> bool {
        true
    }

    fn build_batch_lines(&self, requests: &[PendingRequest]) -> Result<Vec<Value>> {
        requests
            .iter()
            .enumerate()
            .map(|(i, request)| {
                let body = request.parsed_body().ok_or_else(|| {
                    BatchlingError::RequestShape(format!(
                        "request {} has a non-JSON body",
                        request.custom_id
                    ))
                })?;
                Ok(serde_json::json!({
                    "key": request.custom_id,
                    "request": body,
                    "_index": i,
                }))
            })
            .collect()
    }

    async fn submit_batch(
        &self,
        client: &dyn HttpClient,
        _base_url: &str,
        api_headers: &HeaderMap,
        queue_key: &QueueKey,
        requests: &[PendingRequest],
    ) -> Result<BatchSubmission> {
        let (_, _, model) = queue_key;
        let upload_base = "https://generativelanguage.googleapis.com/upload/v1beta";
        let api_base = "https://generativelanguage.googleapis.com/v1beta";

        let lines = self.build_batch_lines(requests)?;
        let mut jsonl = String::new();
        for line in &lines {
            jsonl.push_str(&serde_json::to_string(line)?);
            jsonl.push('\n');
        }

        let jsonl_bytes = jsonl.into_bytes();

        let mut start_headers = api_headers.clone();
        start_headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        start_headers.insert(
            "X-Goog-Upload-Protocol",
            reqwest::header::HeaderValue::from_static("resumable"),
        );
        start_headers.insert(
            "X-Goog-Upload-Command",
            reqwest::header::HeaderValue::from_static("start"),
        );
        start_headers.insert(
            "X-Goog-Upload-Header-Content-Length",
            reqwest::header::HeaderValue::from_str(&jsonl_bytes.len().to_string())
                .expect("decimal length is always a valid header value"),
        );
        start_headers.insert(
            "X-Goog-Upload-Header-Content-Type",
            reqwest::header::HeaderValue::from_static("application/jsonl"),
        );
        start_headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let start_url = format!("{upload_base}/files")
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let start_payload = serde_json::json!({"file": {"display_name": "batchling-batch"}});
        let start_response = client
            .request(
                Method::POST,
                start_url,
                start_headers,
                Some(serde_json::to_vec(&start_payload)?.into()),
            )
            .await
            .map_err(http_error_to_provider)?;
        let upload_session_url = start_response
            .headers
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| BatchlingError::Decode("upload start response missing X-Goog-Upload-URL".to_string()))?
            .to_string();

        let mut upload_headers = api_headers.clone();
        upload_headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        upload_headers.insert(
            "X-Goog-Upload-Command",
            reqwest::header::HeaderValue::from_static("upload, finalize"),
        );
        upload_headers.insert(
            "X-Goog-Upload-Offset",
            reqwest::header::HeaderValue::from_static("0"),
        );

        let upload_url = upload_session_url
            .parse()
            .map_err(|_| BatchlingError::Decode("provider-supplied upload URL is not a valid URL".to_string()))?;
        let upload_response = client
            .request(Method::POST, upload_url, upload_headers, Some(jsonl_bytes.into()))
            .await
            .map_err(http_error_to_provider)?;
        let upload_body: Value = upload_response
            .json()
            .map_err(|e| BatchlingError::Decode(e.to_string()))?;
        let file_name = upload_body
            .get("file")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| BatchlingError::Decode("upload response missing file name".to_string()))?;

        let create_url = format!("{api_base}/models/{model}:batchGenerateContent")
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let payload = serde_json::json!({
            "batch": {
                "input_config": {"file_name": file_name},
            }
        });
        let mut create_headers = api_headers.clone();
        create_headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        create_headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let create_response = client
            .request(Method::POST, create_url, create_headers, Some(serde_json::to_vec(&payload)?.into()))
            .await
            .map_err(http_error_to_provider)?;
        let create_body: Value = create_response
            .json()
            .map_err(|e| BatchlingError::Decode(e.to_string()))?;
        let batch_id = create_body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BatchlingError::Decode("create response missing batch name".to_string()))?
            .to_string();

        Ok(BatchSubmission {
            base_url: api_base.to_string(),
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
        let url = format!("{base_url}/{batch_id}")
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let response = client
            .request(Method::GET, url, headers, None)
            .await
            .map_err(http_error_to_provider)?;
        let body: Value = response
            .json()
            .map_err(|e| BatchlingError::Decode(e.to_string()))?;
        let state = body
            .get("metadata")
            .and_then(|m| m.get("state"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let is_terminal = matches!(state.as_str(), "BATCH_STATE_SUCCEEDED" | "BATCH_STATE_FAILED" | "BATCH_STATE_CANCELLED");
        let is_success = state == "BATCH_STATE_SUCCEEDED";
        let output_ref = body
            .get("response")
            .and_then(|r| r.get("responsesFile"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(PollSnapshot {
            status: state,
            is_terminal,
            is_success,
            output_ref,
            error_ref: None,
        })
    }

    async fn fetch_results(
        &self,
        client: &dyn HttpClient,
        _base_url: &str,
        api_headers: &HeaderMap,
        _batch_id: &str,
        snapshot: &PollSnapshot,
    ) -> Result<Vec<DecodedResult>> {
        let file_name = snapshot
            .output_ref
            .as_ref()
            .ok_or_else(|| BatchlingError::Decode("batch completed without output".to_string()))?;
        let mut headers = api_headers.clone();
        headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        let url = format!(
            "https://generativelanguage.googleapis.com/download/v1beta/{file_name}:download?alt=media"
        )
        .parse()
        .expect("adapter-constructed URLs are always valid");
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
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| BatchlingError::Decode("result line missing key".to_string()))?
                .to_string();
            if let Some(response_obj) = value.get("response") {
                decoded.push(DecodedResult {
                    custom_id,
                    status: 200,
                    body: response_obj.clone(),
                });
            } else if let Some(error_obj) = value.get("error") {
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
