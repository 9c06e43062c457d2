//! Pooled HTTP executor for [`SignedRequest`]s.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client as HttpClient, Proxy, StatusCode};
use tracing::{debug, warn};

use super::request::SignedRequest;
use crate::config::{Config, ProxyConfig, TimeoutConfig};
use crate::error::{ClientError, Result};

/// Sends built requests over a shared connection pool.
///
/// Cloning is cheap and shares the pool.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: HttpClient,
}

impl HttpExecutor {
    /// Build an executor from the timeout and proxy settings of `config`.
    pub fn new(config: &Config) -> Result<Self> {
        let client = build_client(&config.timeout, &config.proxy)?;
        Ok(Self { client })
    }

    /// Send `request` and return the response body.
    ///
    /// Any status other than 200 is an [`ClientError::HttpStatus`] error.
    pub async fn execute(&self, request: SignedRequest) -> Result<Bytes> {
        let (method, url, headers, body) = request.into_parts();
        debug!(method = %method, url = %url, body_len = body.len(), "Sending http request");

        let mut builder = self.client.request(method, url.clone()).headers(headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Http request failed");
            ClientError::from(e)
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!(url = %url, status = status.as_u16(), "Unexpected http status");
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let body = response.bytes().await?;
        debug!(url = %url, len = body.len(), "Http response received");
        Ok(body)
    }
}

fn build_client(timeout: &TimeoutConfig, proxy: &ProxyConfig) -> Result<HttpClient> {
    // reqwest has no separate pool-acquire deadline, so it is folded into the
    // overall request budget
    let total = timeout.http_acquire_conn() + timeout.http_connect() + timeout.http_read();

    let mut builder =
        HttpClient::builder().pool_idle_timeout(non_zero(timeout.http_keepalive()));
    if let Some(connect) = non_zero(timeout.http_connect()) {
        builder = builder.connect_timeout(connect);
    }
    if let Some(read) = non_zero(timeout.http_read()) {
        builder = builder.read_timeout(read);
    }
    if let Some(total) = non_zero(total) {
        builder = builder.timeout(total);
    }

    if let Some(url) = proxy.url.as_deref() {
        let mut http_proxy = Proxy::all(url)
            .map_err(|e| ClientError::Transport(format!("invalid proxy {url}: {e}")))?;
        if let Some(username) = proxy.username.as_deref() {
            http_proxy = http_proxy.basic_auth(username, proxy.password.as_deref().unwrap_or(""));
        }
        builder = builder.proxy(http_proxy);
    }

    builder
        .build()
        .map_err(|e| ClientError::Transport(format!("failed to build http client: {e}")))
}

/// A zero duration disables the corresponding limit.
fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
