//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Features:
//! - Automatic retry with backoff for transient errors
//! - Per-request timeout
//! - Default headers sent with every call
//! - Optional authenticated forward proxy, swappable at runtime

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use chainrelay_core::error::TransportError;
use chainrelay_core::policy::{RetryConfig, RetryPolicy};
use chainrelay_core::proxy::ProxyConfig;
use chainrelay_core::request::{JsonRpcRequest, JsonRpcResponse};
use chainrelay_core::transport::RpcTransport;

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Sent with every request, e.g. `User-Agent` or an API key header.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// `HOST:PORT:USERNAME:PASSWORD`; every request goes through it.
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            headers: BTreeMap::new(),
            proxy: None,
        }
    }
}

impl HttpClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn build_client(config: &HttpClientConfig) -> Result<reqwest::Client, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Other(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Other(format!("invalid value for {name}: {e}")))?;
        headers.insert(name, value);
    }

    let mut builder = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .default_headers(headers);
    if let Some(proxy) = &config.proxy {
        let route = reqwest::Proxy::all(proxy.url())
            .map_err(|e| TransportError::Other(format!("invalid proxy {}: {e}", proxy.address())))?
            .basic_auth(&proxy.username, &proxy.password);
        builder = builder.proxy(route);
    }
    builder
        .build()
        .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))
}

/// HTTP JSON-RPC client with retry.
pub struct HttpRpcClient {
    url: String,
    config: HttpClientConfig,
    http: RwLock<reqwest::Client>,
    retry: RetryPolicy,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = build_client(&config)?;
        if let Some(proxy) = &config.proxy {
            tracing::info!(proxy = %proxy.address(), "HTTP requests routed through proxy");
        }
        Ok(Self {
            url: url.into(),
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            http: RwLock::new(http),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(url, HttpClientConfig::default())
    }

    /// Send later requests through `proxy`, or directly when `None`.
    /// Requests already in flight finish on the old route.
    pub fn rotate_proxy(&self, proxy: Option<ProxyConfig>) -> Result<(), TransportError> {
        let config = HttpClientConfig {
            proxy,
            ..self.config.clone()
        };
        let http = build_client(&config)?;
        match &config.proxy {
            Some(p) => tracing::info!(url = %self.url, proxy = %p.address(), "rotated HTTP proxy"),
            None => tracing::info!(url = %self.url, "HTTP proxy removed"),
        }
        *self.http.write().unwrap_or_else(PoisonError::into_inner) = http;
        Ok(())
    }

    fn http(&self) -> reqwest::Client {
        self.http
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One POST of `req` to `url`, without retry. Returns the response
    /// headers alongside the decoded body.
    pub async fn post(
        &self,
        url: &str,
        req: &JsonRpcRequest,
    ) -> Result<(HeaderMap, JsonRpcResponse), TransportError> {
        let resp = self.http().post(url).json(req).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    ms: self.config.request_timeout_ms,
                }
            } else {
                TransportError::Http(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok((headers, serde_json::from_slice::<JsonRpcResponse>(&body)?))
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let (_, resp) = self.post(&self.url, req).await?;
        Ok(resp)
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            url = %self.url,
                            method = %req.method,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            attempt,
                            error = %e,
                            url = %self.url,
                            method = %req.method,
                            "max retries exceeded"
                        );
                        return Err(e);
                    }
                },
                // Not retryable: malformed body, RPC execution error.
                Err(e) => return Err(e),
            }
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}
