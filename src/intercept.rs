//! The interception decorator: wraps any [`HttpClient`] and, under an
//! active [`crate::scope::Scope`], diverts batchable requests to its Batcher.
//! Everything else — including the Batcher's own provider calls, marked with
//! [`INTERNAL_HEADER`] — passes straight through to the inner transport.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};

use crate::error::BatchlingError;
use crate::http_client::{HttpClient, HttpError, HttpResponse, MultipartFile, INTERNAL_HEADER};
use crate::scope;

pub struct InterceptingClient<T: HttpClient> {
    inner: T,
}

impl<T: HttpClient> InterceptingClient<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T: HttpClient> HttpClient for InterceptingClient<T> {
    async fn request(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, HttpError> {
        if headers.contains_key(INTERNAL_HEADER) {
            return self.inner.request(method, url, headers, body).await;
        }

        let Some(batcher) = scope::current() else {
            return self.inner.request(method, url, headers, body).await;
        };

        let host = url.host_str().unwrap_or("").to_string();
        let path = url.path().to_string();
        let Some(adapter) = batcher.resolve_adapter(&method, &host, &path) else {
            return self.inner.request(method, url, headers, body).await;
        };

        batcher
            .submit(adapter, method, host, path, headers, body.unwrap_or_default())
            .await
            .map_err(batchling_error_to_http_error)
    }

    async fn request_multipart(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        fields: Vec<(String, String)>,
        file: MultipartFile,
    ) -> Result<HttpResponse, HttpError> {
        // Multipart traffic (file uploads) is never itself a batchable
        // endpoint; only the Batcher's own provider calls use this path,
        // and they already carry INTERNAL_HEADER. Always delegate.
        self.inner
            .request_multipart(method, url, headers, fields, file)
            .await
    }
}

fn batchling_error_to_http_error(error: BatchlingError) -> HttpError {
    match error {
        BatchlingError::Reqwest(e) => HttpError::Reqwest(e),
        BatchlingError::ProviderApi { status, body } => HttpError::Status {
            status: reqwest::StatusCode::from_u16(status).unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            body: Bytes::from(body),
        },
        other => HttpError::Status {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: Bytes::from(other.to_string()),
        },
    }
}
