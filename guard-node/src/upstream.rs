use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method};
use reqwest::Client;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::error::{GuardError, Result};

/// Connection-pooled HTTP forwarder with retry and timeouts.
///
/// The underlying client is built lazily exactly once; the slot mutex makes
/// concurrent first use race-free. On transient transport failures the
/// pooled client is discarded before the next attempt so a stuck connection
/// is never reused.
pub struct UpstreamClient {
    base_url: String,
    request_timeout: Duration,
    connect_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    max_idle_connections: usize,
    client: Mutex<Option<Client>>,
}

/// Transport-level failures worth another attempt: connect failures,
/// timeouts and requests that died before a status line arrived.
fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_builder() || err.is_redirect() || err.is_decode() || err.status().is_some() {
        return false;
    }
    err.is_connect() || err.is_timeout() || err.is_request()
}

fn strip_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    forwarded.remove(header::HOST);
    forwarded
}

impl UpstreamClient {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            base_url: config.upstream_base_url.trim_end_matches('/').to_string(),
            request_timeout: config.upstream_timeout(),
            connect_timeout: config.upstream_connect_timeout(),
            max_retries: config.upstream_max_retries,
            retry_backoff: config.upstream_retry_backoff(),
            max_idle_connections: config.upstream_max_connections,
            client: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn ensure_client(&self) -> Result<Client> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(self.max_idle_connections)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| {
                GuardError::UpstreamPermanent(format!("failed to build HTTP client: {e}"))
            })?;
        info!(base_url = %self.base_url, "upstream HTTP client initialized");
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn discard_client(&self) {
        *self.client.lock().await = None;
    }

    /// Forward a request upstream, preserving the query string. The `Host`
    /// header is stripped; all other client headers travel verbatim.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let forwarded_headers = strip_request_headers(headers);
        let mut last_error: Option<GuardError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_backoff * attempt).await;
            }
            let client = self.ensure_client().await?;
            let mut request = client
                .request(method.clone(), &url)
                .headers(forwarded_headers.clone());
            if let Some(body) = body.clone() {
                request = request.body(body);
            }
            match request.send().await {
                Ok(response) => {
                    debug!(
                        url = %url,
                        status = response.status().as_u16(),
                        attempt = attempt + 1,
                        "upstream request completed"
                    );
                    return Ok(response);
                }
                Err(err) if is_transient(&err) => {
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        error = %err,
                        "upstream attempt failed"
                    );
                    self.discard_client().await;
                    last_error = Some(GuardError::UpstreamTransient(err.to_string()));
                }
                Err(err) => {
                    return Err(GuardError::UpstreamPermanent(err.to_string()));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| GuardError::UpstreamTransient("retries exhausted".to_string())))
    }

    /// Drop the pooled client; used at teardown.
    pub async fn close(&self) {
        self.discard_client().await;
        debug!("upstream client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let config = GuardConfig {
            upstream_base_url: "http://origin:9000/".to_string(),
            ..GuardConfig::default()
        };
        let client = UpstreamClient::new(&config);
        assert_eq!(client.base_url(), "http://origin:9000");
    }

    #[test]
    fn test_host_header_is_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("guard.example"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));
        let forwarded = strip_request_headers(&headers);
        assert!(forwarded.get(header::HOST).is_none());
        assert_eq!(
            forwarded.get("x-custom").map(|v| v.to_str().unwrap()),
            Some("kept")
        );
    }
}
