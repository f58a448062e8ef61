//! The HTTP transport seam used both by outbound provider calls and by the
//! interception layer. Any [`HttpClient`] can stand in for a real transport,
//! which is what makes the interception decorator in [`crate::scope`] possible
//! without monkey-patching.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Method, StatusCode, Url,
};

/// A transport-level error: either reqwest failed outright, or the server
/// answered with a non-2xx status (body is still captured for the caller).
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Status { status: StatusCode, body: Bytes },
}

/// A fully buffered HTTP response. Streaming responses are out of scope for
/// the batch-API surface this crate intercepts.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// One part of a multipart upload: raw bytes plus the field/file name and
/// content type reqwest needs to build the form.
pub struct MultipartFile {
    pub field_name: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// Transport abstraction every provider call and every intercepted caller
/// request ultimately goes through.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, HttpError>;

    async fn request_multipart(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        fields: Vec<(String, String)>,
        file: MultipartFile,
    ) -> Result<HttpResponse, HttpError>;
}

pub type BoxedHttpClient = Arc<dyn HttpClient>;

#[async_trait]
impl HttpClient for reqwest::Client {
    async fn request(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, HttpError> {
        let mut builder = self.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(HttpError::Status { status, body });
        }
        Ok(HttpResponse { status, headers, body })
    }

    async fn request_multipart(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        fields: Vec<(String, String)>,
        file: MultipartFile,
    ) -> Result<HttpResponse, HttpError> {
        let mut form = reqwest::multipart::Form::new();
        for (key, value) in fields {
            form = form.text(key, value);
        }
        let part = reqwest::multipart::Part::bytes(file.bytes.to_vec()).file_name(file.file_name);
        let part = part
            .mime_str(&file.content_type)
            .unwrap_or_else(|_| reqwest::multipart::Part::bytes(file.bytes.to_vec()));
        form = form.part(file.field_name, part);

        let response = self
            .request(method, url)
            .headers(headers)
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(HttpError::Status { status, body });
        }
        Ok(HttpResponse { status, headers, body })
    }
}

/// Header set on every provider call this crate makes on its own behalf, so
/// a Batcher running inside an active scope never re-intercepts itself.
pub const INTERNAL_HEADER: &str = "x-batchling-internal";

pub fn internal_header_value() -> HeaderValue {
    HeaderValue::from_static("1")
}
