//! Generic adapter for the OpenAI-shaped file-based batch API, parameterized
//! by a small dialect so OpenAI, Doubleword, Groq, Cerebras, Mistral and
//! Together can share one implementation instead of five near-duplicates.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

use crate::error::{BatchlingError, Result};
use crate::http_client::{HttpClient, MultipartFile, INTERNAL_HEADER};
use crate::request::{PendingRequest, QueueKey};

use super::{require_string_model, BatchSubmission, DecodedResult, PollSnapshot, ProviderAdapter};

/// The bits that differ between OpenAI-API-shaped providers.
pub struct OpenAiLikeDialect {
    pub name: &'static str,
    pub hostnames: &'static [&'static str],
    pub batchable_endpoints: &'static [&'static str],
    pub file_upload_endpoint: &'static str,
    /// Contains a single `{id}` placeholder.
    pub file_content_endpoint: &'static str,
    pub batch_endpoint: &'static str,
    pub success_status: &'static str,
    pub terminal_statuses: &'static [&'static str],
    pub output_field: &'static str,
    pub error_field: &'static str,
    pub upload_form_fields: fn() -> Vec<(String, String)>,
    pub build_submit_payload: fn(file_id: &str, endpoint: &str, model: &str) -> Value,
    pub extract_batch_id: fn(&Value) -> Option<String>,
}

pub struct OpenAiLikeAdapter {
    dialect: OpenAiLikeDialect,
}

impl OpenAiLikeAdapter {
    pub fn new(dialect: OpenAiLikeDialect) -> Self {
        Self { dialect }
    }

    fn content_url(&self, base_url: &str, file_id: &str) -> String {
        format!(
            "{base_url}{}",
            self.dialect.file_content_endpoint.replace("{id}", file_id)
        )
    }
}

fn default_upload_fields() -> Vec<(String, String)> {
    vec![("purpose".to_string(), "batch".to_string())]
}

fn default_submit_payload(file_id: &str, endpoint: &str, _model: &str) -> Value {
    serde_json::json!({
        "input_file_id": file_id,
        "endpoint": endpoint,
        "completion_window": "24h",
        "metadata": {"description": "batchling runtime batch"},
    })
}

fn default_extract_batch_id(value: &Value) -> Option<String> {
    value.get("id").and_then(Value::as_str).map(str::to_string)
}

/// OpenAI: file upload, homogeneous status/output field names.
pub fn openai_dialect() -> OpenAiLikeDialect {
    OpenAiLikeDialect {
        name: "openai",
        hostnames: &["api.openai.com"],
        batchable_endpoints: &[
            "/v1/responses",
            "/v1/chat/completions",
            "/v1/embeddings",
            "/v1/completions",
            "/v1/moderations",
        ],
        file_upload_endpoint: "/v1/files",
        file_content_endpoint: "/v1/files/{id}/content",
        batch_endpoint: "/v1/batches",
        success_status: "completed",
        terminal_statuses: &["completed", "failed", "cancelled", "expired"],
        output_field: "output_file_id",
        error_field: "error_file_id",
        upload_form_fields: default_upload_fields,
        build_submit_payload: default_submit_payload,
        extract_batch_id: default_extract_batch_id,
    }
}

/// Doubleword: an OpenAI-compatible batch API on a different host.
pub fn doubleword_dialect() -> OpenAiLikeDialect {
    OpenAiLikeDialect {
        name: "doubleword",
        hostnames: &["api.doubleword.ai"],
        batchable_endpoints: &[
            "/v1/chat/completions",
            "/v1/embeddings",
            "/v1/moderations",
            "/v1/completions",
        ],
        ..openai_dialect()
    }
}

/// Groq: OpenAI-compatible surface under its own host.
pub fn groq_dialect() -> OpenAiLikeDialect {
    OpenAiLikeDialect {
        name: "groq",
        hostnames: &["api.groq.com"],
        batchable_endpoints: &["/openai/v1/chat/completions", "/openai/v1/embeddings"],
        ..openai_dialect()
    }
}

/// Cerebras: identical shape to OpenAI, narrower endpoint surface.
pub fn cerebras_dialect() -> OpenAiLikeDialect {
    OpenAiLikeDialect {
        name: "cerebras",
        hostnames: &["api.cerebras.ai"],
        batchable_endpoints: &["/v1/chat/completions"],
        ..openai_dialect()
    }
}

/// Mistral: different batch endpoint, different output/error field names,
/// different terminal-state strings, and a submit payload that names the
/// model explicitly alongside a plural `input_files`.
pub fn mistral_dialect() -> OpenAiLikeDialect {
    OpenAiLikeDialect {
        name: "mistral",
        hostnames: &["api.mistral.ai"],
        batchable_endpoints: &[
            "/v1/chat/completions",
            "/v1/fim/completions",
            "/v1/embeddings",
            "/v1/moderations",
            "/v1/classifications",
        ],
        file_upload_endpoint: "/v1/files",
        file_content_endpoint: "/v1/files/{id}/content",
        batch_endpoint: "/v1/batch/jobs",
        success_status: "SUCCESS",
        terminal_statuses: &["SUCCESS", "FAILED", "CANCELLED", "EXPIRED"],
        output_field: "output_file",
        error_field: "error_file",
        upload_form_fields: default_upload_fields,
        build_submit_payload: |file_id, endpoint, model| {
            serde_json::json!({
                "model": model,
                "input_files": [file_id],
                "endpoint": endpoint,
                "timeout_hours": 24,
                "metadata": {"description": "batchling runtime batch"},
            })
        },
        extract_batch_id: default_extract_batch_id,
    }
}

/// Together: own upload path and form fields, terminal-state strings in
/// upper case, and a batch id nested under `job.id` in the create response.
pub fn together_dialect() -> OpenAiLikeDialect {
    OpenAiLikeDialect {
        name: "together",
        hostnames: &["api.together.xyz"],
        batchable_endpoints: &["/v1/chat/completions", "/v1/audio/transcriptions"],
        file_upload_endpoint: "/v1/files/upload",
        file_content_endpoint: "/v1/files/{id}/content",
        batch_endpoint: "/v1/batches",
        success_status: "COMPLETED",
        terminal_statuses: &["COMPLETED", "FAILED", "CANCELLED", "EXPIRED"],
        output_field: "output_file_id",
        error_field: "error_file_id",
        upload_form_fields: || {
            vec![
                ("file_name".to_string(), "batch.jsonl".to_string()),
                ("purpose".to_string(), "batch-api".to_string()),
            ]
        },
        build_submit_payload: default_submit_payload,
        extract_batch_id: |value| {
            value
                .get("job")
                .and_then(|job| job.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        },
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiLikeAdapter {
    fn name(&self) -> &'static str {
        self.dialect.name
    }

    fn hostnames(&self) -> &'static [&'static str] {
        self.dialect.hostnames
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        self.dialect.batchable_endpoints
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
        true
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
                    "method": "POST",
                    "url": request.endpoint,
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
        queue_key: &QueueKey,
        requests: &[PendingRequest],
    ) -> Result<BatchSubmission> {
        let lines = self.build_batch_lines(requests)?;
        let mut jsonl = String::new();
        for line in &lines {
            jsonl.push_str(&serde_json::to_string(line)?);
            jsonl.push('\n');
        }

        let mut headers = api_headers.clone();
        headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());

        let upload_url = format!("{base_url}{}", self.dialect.file_upload_endpoint)
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let upload_response = client
            .request_multipart(
                Method::POST,
                upload_url,
                headers.clone(),
                (self.dialect.upload_form_fields)(),
                MultipartFile {
                    field_name: "file".to_string(),
                    file_name: "batch.jsonl".to_string(),
                    content_type: "application/jsonl".to_string(),
                    bytes: jsonl.into_bytes().into(),
                },
            )
            .await
            .map_err(http_error_to_provider)?;
        let file_id = upload_response
            .json::<Value>()
            .map_err(|e| BatchlingError::Decode(e.to_string()))?
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BatchlingError::Decode("upload response missing file id".to_string()))?;

        let (_, endpoint, model) = queue_key;
        let payload = (self.dialect.build_submit_payload)(&file_id, endpoint, model);
        let create_url = format!("{base_url}{}", self.dialect.batch_endpoint)
            .parse()
            .expect("adapter-constructed URLs are always valid");
        let mut create_headers = headers.clone();
        create_headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let create_response = client
            .request(
                Method::POST,
                create_url,
                create_headers,
                Some(serde_json::to_vec(&payload)?.into()),
            )
            .await
            .map_err(http_error_to_provider)?;
        let create_body: Value = create_response
            .json()
            .map_err(|e| BatchlingError::Decode(e.to_string()))?;
        let batch_id = (self.dialect.extract_batch_id)(&create_body)
            .ok_or_else(|| BatchlingError::Decode("create response missing batch id".to_string()))?;

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
        let url = format!("{base_url}{}/{batch_id}", self.dialect.batch_endpoint)
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
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let is_terminal = self.dialect.terminal_statuses.contains(&status.as_str());
        let is_success = status == self.dialect.success_status;
        Ok(PollSnapshot {
            output_ref: body
                .get(self.dialect.output_field)
                .and_then(Value::as_str)
                .map(str::to_string),
            error_ref: body
                .get(self.dialect.error_field)
                .and_then(Value::as_str)
                .map(str::to_string),
            status,
            is_terminal,
            is_success,
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
        let file_id = snapshot
            .output_ref
            .as_ref()
            .or(snapshot.error_ref.as_ref())
            .ok_or_else(|| BatchlingError::Decode("batch completed without output".to_string()))?;
        let mut headers = api_headers.clone();
        headers.insert(INTERNAL_HEADER, crate::http_client::internal_header_value());
        let url = self
            .content_url(base_url, file_id)
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
                .get("custom_id")
                .and_then(Value::as_str)
                .ok_or_else(|| BatchlingError::Decode("result line missing custom_id".to_string()))?
                .to_string();
            if let Some(response_obj) = value.get("response") {
                let status = response_obj
                    .get("status_code")
                    .and_then(Value::as_u64)
                    .unwrap_or(200) as u16;
                let body = response_obj.get("body").cloned().unwrap_or(Value::Null);
                decoded.push(DecodedResult { custom_id, status, body });
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

fn http_error_to_provider(error: crate::http_client::HttpError) -> BatchlingError {
    match error {
        crate::http_client::HttpError::Reqwest(e) => BatchlingError::Reqwest(e),
        crate::http_client::HttpError::Status { status, body } => BatchlingError::ProviderApi {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).to_string(),
        },
    }
}
