//! Shared registry of named circuit breakers.
//!
//! Callers that guard many dependencies ask the registry for a breaker by name
//! instead of wiring one per call site. Breakers are created lazily, shared via
//! `Arc`, and all emit into the registry's single event stream.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitStats};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lazily-populated map of named breakers sharing one event channel.
///
/// Construct one per composition root and pass it by reference; there is no
/// process-global instance.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers default to `config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            default_config,
            breakers: DashMap::new(),
            events,
        }
    }

    /// Get the breaker for `name`, creating it with the default config.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Get the breaker for `name`, creating it with `config` if absent.
    ///
    /// The config only applies on first creation; an existing breaker keeps
    /// the config it was built with.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_events(name, config, self.events.clone()))
        });
        Arc::clone(entry.value())
    }

    /// Get an existing breaker, if any.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Names of all breakers created so far.
    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|b| b.key().clone()).collect()
    }

    /// Number of breakers created so far.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breakers have been created yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Stats snapshot for every breaker.
    pub fn stats(&self) -> Vec<(String, CircuitStats)> {
        self.breakers
            .iter()
            .map(|b| (b.key().clone(), b.value().stats()))
            .collect()
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }

    /// Subscribe to events from every breaker in the registry, present and
    /// future. Events carry the breaker name.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
