//! Shared HTTPS client for array REST APIs.

use crate::error::{Error, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Default timeout for a single array REST call
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Thin wrapper over `reqwest::Client` bound to one array endpoint
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    backend: &'static str,
}

impl RestClient {
    /// Create a client for `base_url`; a bare host name gets `https://`
    pub fn new(backend: &'static str, base_url: &str, skip_tls_verify: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(skip_tls_verify)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: normalize_base_url(base_url),
            backend,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        debug!("{} {} {}", self.backend, method, path);
        self.http.request(method, self.url(path))
    }

    /// Send and fail on any non-success status
    pub async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        self.check(operation, response).await
    }

    /// Send, returning the response for any status; callers branch on it
    pub async fn send_raw(&self, request: RequestBuilder) -> Result<Response> {
        Ok(request.send().await?)
    }

    /// Send and decode a JSON body
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(operation, request).await?;
        Ok(response.json::<T>().await?)
    }

    /// Turn a non-success response into an error
    pub async fn check(&self, operation: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.status_error(operation, status, &body))
    }

    pub fn status_error(&self, operation: &str, status: StatusCode, body: &str) -> Error {
        let body: String = body.chars().take(300).collect();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Authentication {
                system: self.backend.to_string(),
                reason: format!("{} returned HTTP {}: {}", operation, status, body),
            },
            _ => Error::BackendOperationFailed {
                backend: self.backend.to_string(),
                operation: operation.to_string(),
                reason: format!("HTTP {}: {}", status, body),
            },
        }
    }
}

fn normalize_base_url(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}
