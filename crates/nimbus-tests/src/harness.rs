//! Probe fakes shared by the integration tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_health::{EndpointProbe, ProbeFailure};

/// Endpoint probe that replays a scripted sequence of outcomes, then repeats
/// the final one.
pub struct ScriptedProbe {
    outcomes: Mutex<VecDeque<Result<Duration, ProbeFailure>>>,
    fallback: Result<Duration, ProbeFailure>,
}

impl ScriptedProbe {
    /// Create a probe that replays `outcomes` and then keeps returning
    /// `fallback`.
    pub fn new(
        outcomes: Vec<Result<Duration, ProbeFailure>>,
        fallback: Result<Duration, ProbeFailure>,
    ) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback,
        }
    }

    /// A probe that always fails with a transport error.
    pub fn always_down() -> Self {
        Self::new(
            Vec::new(),
            Err(ProbeFailure::Transport {
                message: "connection refused".to_string(),
            }),
        )
    }

    /// A probe that always succeeds with the given latency.
    pub fn always_up(latency: Duration) -> Self {
        Self::new(Vec::new(), Ok(latency))
    }
}

#[async_trait]
impl EndpointProbe for ScriptedProbe {
    async fn probe(
        &self,
        _url: &str,
        _timeout: Duration,
        _expected_status: u16,
    ) -> Result<Duration, ProbeFailure> {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
