//! Probe seam for liveness checks.
//!
//! Probes are timeout-bounded network calls behind a trait so tests and
//! alternative transports can be injected. A probe never propagates transport
//! failures as panics or raw errors: every failure is classified and surfaces
//! as an unhealthy observation with a diagnostic.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Why a probe failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeFailure {
    /// No response within the configured timeout.
    Timeout,
    /// The endpoint answered with an unexpected HTTP status.
    UnexpectedStatus {
        /// The status code received.
        code: u16,
    },
    /// Transport-level failure: DNS, connect, TLS, reset.
    Transport {
        /// Human-readable diagnostic.
        message: String,
    },
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "probe timed out"),
            ProbeFailure::UnexpectedStatus { code } => {
                write!(f, "unexpected status {}", code)
            }
            ProbeFailure::Transport { message } => write!(f, "transport error: {}", message),
        }
    }
}

/// A liveness probe against one endpoint URL.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// Probe `url`, returning the observed latency on success.
    ///
    /// Success means the expected status arrived within `timeout`.
    async fn probe(
        &self,
        url: &str,
        timeout: Duration,
        expected_status: u16,
    ) -> Result<Duration, ProbeFailure>;
}

/// HTTP GET probe expecting a configured status code.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a probe with a default client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder().build().unwrap_or_default(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EndpointProbe for HttpProbe {
    async fn probe(
        &self,
        url: &str,
        timeout: Duration,
        expected_status: u16,
    ) -> Result<Duration, ProbeFailure> {
        let start = Instant::now();
        let request = self.client.get(url).send();
        match tokio::time::timeout(timeout, request).await {
            Err(_) => Err(ProbeFailure::Timeout),
            Ok(Err(e)) => {
                if e.is_timeout() {
                    Err(ProbeFailure::Timeout)
                } else {
                    Err(ProbeFailure::Transport {
                        message: e.to_string(),
                    })
                }
            }
            Ok(Ok(response)) => {
                let code = response.status().as_u16();
                if code == expected_status {
                    Ok(start.elapsed())
                } else {
                    Err(ProbeFailure::UnexpectedStatus { code })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_display() {
        assert_eq!(ProbeFailure::Timeout.to_string(), "probe timed out");
        assert_eq!(
            ProbeFailure::UnexpectedStatus { code: 503 }.to_string(),
            "unexpected status 503"
        );
        assert!(ProbeFailure::Transport {
            message: "connection refused".to_string()
        }
        .to_string()
        .contains("connection refused"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_classified_not_panicked() {
        let probe = HttpProbe::new();
        let result = probe
            .probe("http://127.0.0.1:1/health", Duration::from_millis(500), 200)
            .await;
        // Either refused (transport) or swallowed by the timeout; never a panic.
        assert!(result.is_err());
    }
}
