//! Readiness polling for freshly started instances
//!
//! Each probe is a single `GET` with `Connection: close`; only the status line
//! is read. Connection refused, resets, timeouts and statuses outside the
//! allowlist all count as "not yet ready". The delay between probes starts at
//! the poll interval and backs off by half again each round up to a maximum.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::FixtureConfig;
use crate::error::{FixtureError, Result};
use crate::hostname;

/// Upper bound on a single probe request
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Polls an endpoint until it answers with an accepted status
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    /// Path requested on each probe
    pub path: String,
    /// Overall bound on waiting
    pub timeout: Duration,
    /// First delay between probes
    pub poll_interval: Duration,
    /// Largest delay between probes
    pub max_poll_interval: Duration,
    /// Statuses that count as ready
    pub accept: Vec<RangeInclusive<u16>>,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(1),
            // Error pages (4xx/5xx) served before routes are configured are not "ready"
            accept: vec![200..=399],
        }
    }
}

impl ReadinessProbe {
    pub fn from_config(config: &FixtureConfig) -> Self {
        Self {
            path: config.ready_path.clone(),
            timeout: config.startup_timeout(),
            poll_interval: config.ready_poll_interval(),
            max_poll_interval: config.ready_max_poll_interval(),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.max_poll_interval = self.max_poll_interval.max(interval);
        self
    }

    /// Replace the accepted statuses with exactly `statuses`
    pub fn accept_statuses(mut self, statuses: &[u16]) -> Self {
        self.accept = statuses.iter().map(|&s| s..=s).collect();
        self
    }

    pub fn is_accepted(&self, status: u16) -> bool {
        self.accept.iter().any(|range| range.contains(&status))
    }

    fn url(&self, host: &str, port: u16) -> String {
        format!("http://{}{}", hostname::authority(host, port), self.path)
    }

    /// One probe: the response status, or a description of why there was none
    pub async fn check_once(&self, host: &str, port: u16, limit: Duration) -> std::result::Result<u16, String> {
        let connect_host = hostname::connect_host(host);

        let mut stream = match tokio::time::timeout(limit, TcpStream::connect((connect_host.as_str(), port))).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(format!("connect: {}", e)),
            Err(_) => return Err("connect: timed out".to_string()),
        };

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.path,
            hostname::authority(host, port)
        );

        if let Err(e) = stream.write_all(request.as_bytes()).await {
            return Err(format!("write: {}", e));
        }

        let read_result = tokio::time::timeout(limit, async {
            let mut reader = BufReader::new(stream);
            let mut status_line = String::new();
            reader.read_line(&mut status_line).await?;
            Ok::<_, std::io::Error>(status_line)
        })
        .await;

        match read_result {
            Ok(Ok(status_line)) => {
                // Format: "HTTP/1.1 200 OK\r\n"
                status_line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|code| code.parse::<u16>().ok())
                    .ok_or_else(|| format!("malformed status line: {:?}", status_line.trim_end()))
            }
            Ok(Err(e)) => Err(format!("read: {}", e)),
            Err(_) => Err("read: timed out".to_string()),
        }
    }

    /// Poll until ready, failing early if `liveness` reports the server has died
    pub async fn wait_until_ready<F>(&self, host: &str, port: u16, mut liveness: F) -> Result<Duration>
    where
        F: FnMut() -> Result<()>,
    {
        let url = self.url(host, port);
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut interval = self.poll_interval;
        let mut last_error = "no probe attempted".to_string();
        let mut attempts = 0u32;

        debug!(%url, timeout_ms = self.timeout.as_millis(), "Waiting for readiness");

        loop {
            liveness()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            match self.check_once(host, port, remaining.min(PROBE_REQUEST_TIMEOUT)).await {
                Ok(status) if self.is_accepted(status) => {
                    let waited = start.elapsed();
                    info!(%url, status, attempts, waited_ms = waited.as_millis(), "Server is ready");
                    return Ok(waited);
                }
                Ok(status) => {
                    debug!(%url, status, "Probe answered with a status that is not ready");
                    last_error = format!("HTTP status {}", status);
                }
                Err(e) => {
                    debug!(%url, error = %e, "Probe failed");
                    last_error = e;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(interval.min(remaining)).await;
            interval = (interval * 3 / 2).min(self.max_poll_interval);
        }

        Err(FixtureError::ReadinessTimeout {
            url,
            waited: start.elapsed(),
            last_error,
        })
    }
}

/// Wait for `host:port` to answer `GET /` with a 2xx/3xx status
pub async fn wait_until_ready(host: &str, port: u16, timeout: Duration, poll_interval: Duration) -> Result<Duration> {
    ReadinessProbe::default()
        .with_timeout(timeout)
        .with_poll_interval(poll_interval)
        .wait_until_ready(host, port, || Ok(()))
        .await
}
