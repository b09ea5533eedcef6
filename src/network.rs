//! Network access for cache misses and precaching.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, HOST, HeaderMap};

use crate::error::Result;
use crate::request::ProxyRequest;
use crate::response::{StoredResponse, is_hop_by_hop};

/// Abstraction over the network, so the proxy can be tested offline.
///
/// Any status code is a successful fetch; only transport failures are errors.
#[async_trait]
pub trait Network: Send + Sync {
    /// Performs `request` and buffers the full response.
    async fn fetch(&self, request: &ProxyRequest) -> Result<StoredResponse>;
}

/// Network backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestNetwork {
    client: reqwest::Client,
}

impl ReqwestNetwork {
    /// Wraps an existing client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds a client with keep-alive pooling and an optional overall timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn with_timeout(timeout: Option<Duration>) -> Result<Self> {
        Ok(Self::new(build_http_client(timeout)?))
    }
}

/// Builds a configured HTTP client for upstream requests.
fn build_http_client(timeout: Option<Duration>) -> reqwest::Result<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30));
    match timeout {
        Some(timeout) => builder.timeout(timeout).build(),
        None => builder.build(),
    }
}

/// Copies end-to-end headers. `Host` and `Content-Length` are dropped so
/// reqwest derives them from the URL and body.
fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| *name != HOST && *name != CONTENT_LENGTH)
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[async_trait]
impl Network for ReqwestNetwork {
    async fn fetch(&self, request: &ProxyRequest) -> Result<StoredResponse> {
        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(forwarded_headers(&request.headers))
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        log::debug!(
            "{} {} -> {} ({})",
            request.method,
            request.url,
            status.as_u16(),
            crate::format_bytes(body.len() as u64)
        );
        Ok(StoredResponse::from_parts(status, &headers, body))
    }
}
