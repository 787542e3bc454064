//! HTTP helper for exercising a running instance
//!
//! Paths are resolved relative to the instance root. `query` and `post` decode
//! the body as JSON and retry the whole request on any failure (connection
//! error, non-success status, undecodable body) because individual routes of a
//! just-started server may still be warming up. The `_raw` variants and
//! [`ServerClient::without_retry`] opt out.

use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::FixtureConfig;
use crate::error::{FixtureError, Result};

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each later one
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// A single attempt
    pub fn none() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.delay * 2u32.saturating_pow(attempt.saturating_sub(1).min(16))
    }
}

/// An undecoded response
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

enum AttemptError {
    Transport(String),
    Decode(serde_json::Error),
}

/// Client bound to one instance's root URI
#[derive(Debug, Clone)]
pub struct ServerClient {
    base: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl ServerClient {
    pub fn new(base_uri: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FixtureError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            base: base_uri.into().trim_end_matches('/').to_string(),
            http,
            retry: RetryPolicy::default(),
        })
    }

    pub fn from_config(base_uri: impl Into<String>, config: &FixtureConfig) -> Result<Self> {
        Ok(Self::new(base_uri, config.client_timeout())?.with_retry(RetryPolicy {
            attempts: config.client_attempts,
            delay: config.client_retry_delay(),
        }))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            attempts: retry.attempts.max(1),
            ..retry
        };
        self
    }

    /// Same client, one attempt per call
    pub fn without_retry(&self) -> Self {
        self.clone().with_retry(RetryPolicy::none())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn base_uri(&self) -> &str {
        &self.base
    }

    /// Absolute URL for `path` under the instance root
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// GET `path` and decode the body as JSON
    pub async fn query(&self, path: &str, params: &[(&str, &str)]) -> Result<serde_json::Value> {
        self.query_as(path, params).await
    }

    /// GET `path` and decode the body as `T`
    pub async fn query_as<T: DeserializeOwned>(&self, path: &str, params: &[(&str, &str)]) -> Result<T> {
        let url = self.url(path);
        self.with_retries(&url, || {
            let request = self.http.get(&url).query(params);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| AttemptError::Transport(e.to_string()))?;
                decode(response).await
            }
        })
        .await
    }

    /// POST `payload` as JSON to `path` and decode the reply as JSON
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, payload: &B) -> Result<serde_json::Value> {
        self.post_as(path, payload).await
    }

    /// POST `payload` as JSON to `path` and decode the reply as `T`
    pub async fn post_as<T, B>(&self, path: &str, payload: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        self.with_retries(&url, || {
            let request = self.http.post(&url).json(payload);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| AttemptError::Transport(e.to_string()))?;
                decode(response).await
            }
        })
        .await
    }

    /// Single GET returning the response as-is, whatever its status
    pub async fn query_raw(&self, path: &str, params: &[(&str, &str)]) -> Result<RawResponse> {
        let url = self.url(path);
        let response = self.http.get(&url).query(params).send().await;
        raw(&url, response).await
    }

    /// Single POST of a raw body, returning the response as-is
    pub async fn post_raw(&self, path: &str, body: impl Into<reqwest::Body>) -> Result<RawResponse> {
        let url = self.url(path);
        let response = self.http.post(&url).body(body).send().await;
        raw(&url, response).await
    }

    async fn with_retries<T, F, Fut>(&self, url: &str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt >= self.retry.attempts {
                return Err(match err {
                    AttemptError::Decode(source) => FixtureError::Decode {
                        url: url.to_string(),
                        source,
                    },
                    AttemptError::Transport(last_error) => FixtureError::Client {
                        url: url.to_string(),
                        attempts: attempt,
                        last_error,
                    },
                });
            }

            let delay = self.retry.backoff(attempt);
            match &err {
                AttemptError::Transport(e) => debug!(url, attempt, error = %e, "Request failed, retrying"),
                AttemptError::Decode(e) => debug!(url, attempt, error = %e, "Undecodable response, retrying"),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> std::result::Result<T, AttemptError> {
    let response = response
        .error_for_status()
        .map_err(|e| AttemptError::Transport(e.to_string()))?;
    let body = response
        .bytes()
        .await
        .map_err(|e| AttemptError::Transport(e.to_string()))?;
    serde_json::from_slice(&body).map_err(AttemptError::Decode)
}

async fn raw(url: &str, response: reqwest::Result<reqwest::Response>) -> Result<RawResponse> {
    let failed = |e: reqwest::Error| FixtureError::Client {
        url: url.to_string(),
        attempts: 1,
        last_error: e.to_string(),
    };
    let response = response.map_err(failed)?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(failed)?.to_vec();
    Ok(RawResponse { status, headers, body })
}
