//! Time-bounded, retrying GET requests against the market data API

use crate::{
    config::{ApiConfig, ApiKeyPlacement},
    error::{ApiError, TransportError},
    transport::{HttpRequest, HttpTransport},
};
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};

/// Performs one logical GET with bounded latency and bounded retries
///
/// Only transient failures (timeouts, network errors, 5xx) are retried; the
/// wait before attempt `n + 1` is `retry_delay * n`. At most
/// `max_concurrent_requests` logical requests run at once, later ones queue
/// in arrival order. Results are never cached here.
pub struct RetryingFetcher {
    transport: Arc<dyn HttpTransport>,
    config: ApiConfig,
    permits: Semaphore,
}

impl RetryingFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, config: ApiConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent_requests.max(1));
        Self {
            transport,
            config,
            permits,
        }
    }

    /// Builds the request for an endpoint (path plus query string)
    fn build_request(&self, endpoint: &str) -> Result<HttpRequest, ApiError> {
        let mut url = format!("{}{}", self.config.base_url, endpoint);
        let mut headers = self.config.headers.clone();

        if let Some(key) = &self.config.api_key {
            match key.placement() {
                ApiKeyPlacement::Header(name) => {
                    headers.push((name.clone(), key.value().to_string()));
                }
                ApiKeyPlacement::Query(param) => {
                    let mut parsed = Url::parse(&url).map_err(|e| {
                        ApiError::validation(format!("invalid request URL for {}: {}", endpoint, e))
                    })?;
                    parsed.query_pairs_mut().append_pair(param, key.value());
                    url = parsed.into();
                }
            }
        }

        Ok(HttpRequest { url, headers })
    }

    /// Fetches `endpoint` and parses the body as JSON
    ///
    /// # Arguments
    /// * `endpoint` - Path and query string appended to the base URL
    ///
    /// # Returns
    /// The parsed body, or the error of the last attempt
    pub async fn fetch_with_retry(&self, endpoint: &str) -> Result<Value, ApiError> {
        let request = self.build_request(endpoint)?;
        let _permit = self.permits.acquire().await.map_err(|e| ApiError::Network {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;
        let max_attempts = self.config.retry_attempts.max(1);
        let start = Instant::now();
        let mut attempt = 1;

        loop {
            match self.attempt(&request, endpoint).await {
                Ok(value) => {
                    tracing::debug!(
                        endpoint,
                        attempt,
                        latency_ms = start.elapsed().as_millis() as u64,
                        "Request succeeded"
                    );
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.retry_delay * attempt;
                    tracing::warn!(
                        endpoint,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(endpoint, attempt, error = %e, "Request failed");
                    return Err(e);
                }
            }
        }
    }

    /// One attempt: send, wait at most `timeout`, classify, parse
    async fn attempt(&self, request: &HttpRequest, endpoint: &str) -> Result<Value, ApiError> {
        tracing::debug!(endpoint, "Sending request");

        let response = match timeout(self.config.timeout, self.transport.get(request)).await {
            Err(_) | Ok(Err(TransportError::Timeout)) => {
                return Err(ApiError::Timeout {
                    endpoint: endpoint.to_string(),
                    timeout: self.config.timeout,
                })
            }
            Ok(Err(TransportError::Connection(message))) => {
                return Err(ApiError::Network {
                    endpoint: endpoint.to_string(),
                    message,
                })
            }
            Ok(Ok(response)) => response,
        };

        if !response.is_success() {
            return Err(ApiError::from_status(response.status, endpoint));
        }

        serde_json::from_str(&response.body).map_err(|e| {
            ApiError::invalid_response(format!("Failed to parse response from {}: {}", endpoint, e))
        })
    }
}
