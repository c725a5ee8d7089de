//! Retries wrapping circuit-breaker-guarded calls.
