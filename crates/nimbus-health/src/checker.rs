//! Periodic region liveness checking with debounced transitions.
//!
//! Each registered region is probed at `interval` with a bounded timeout.
//! Consecutive failure/success counters persist across cycles and gate the
//! `Degraded`/`Recovered` transition events, so a single flapping probe does
//! not flip a region's status back and forth.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::HealthError;
use crate::probe::{EndpointProbe, HttpProbe};
use crate::status::HealthStatus;

/// Default probe interval in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 30_000;
/// Default per-probe timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// Default HTTP status treated as success.
pub const DEFAULT_EXPECTED_STATUS: u16 = 200;
/// Default consecutive failures before a region is marked degraded.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;
/// Default consecutive successes before a degraded region recovers.
pub const DEFAULT_HEALTHY_THRESHOLD: u32 = 2;
/// Default health endpoint path appended to registered base URLs.
pub const DEFAULT_HEALTH_PATH: &str = "/health";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the health checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Interval between scheduled probe cycles.
    pub interval: Duration,
    /// Timeout for a single probe.
    pub timeout: Duration,
    /// HTTP status treated as success.
    pub expected_status: u16,
    /// Consecutive failures before `Degraded` fires.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before `Recovered` fires.
    pub healthy_threshold: u32,
    /// Path appended to registered base URLs.
    pub health_path: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            expected_status: DEFAULT_EXPECTED_STATUS,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            healthy_threshold: DEFAULT_HEALTHY_THRESHOLD,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
        }
    }
}

/// Snapshot of one region's probe state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionCheck {
    /// Region id.
    pub region_id: String,
    /// Debounced status (`Unknown` until the first threshold is crossed).
    pub status: HealthStatus,
    /// Outcome of the most recent probe.
    pub healthy: bool,
    /// Latency of the most recent successful probe, in milliseconds.
    pub latency_ms: u64,
    /// Current run of failed probes.
    pub consecutive_failures: u32,
    /// Current run of successful probes.
    pub consecutive_successes: u32,
    /// Total probes.
    pub checks: u64,
    /// Total failed probes.
    pub failures: u64,
    /// Minimum observed latency in milliseconds (0 before any success).
    pub min_latency_ms: u64,
    /// Average observed latency in milliseconds.
    pub avg_latency_ms: u64,
    /// Maximum observed latency in milliseconds.
    pub max_latency_ms: u64,
    /// When the region was last probed (ms since epoch, 0 = never).
    pub last_check_ms: u64,
    /// Diagnostic from the most recent failure, if any.
    pub last_error: Option<String>,
}

impl RegionCheck {
    fn new(region_id: String) -> Self {
        Self {
            region_id,
            status: HealthStatus::Unknown,
            healthy: false,
            latency_ms: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            checks: 0,
            failures: 0,
            min_latency_ms: 0,
            avg_latency_ms: 0,
            max_latency_ms: 0,
            last_check_ms: 0,
            last_error: None,
        }
    }
}

/// Events emitted by the checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CheckerEvent {
    /// A probe batch finished.
    Checked {
        /// Snapshot for every probed region.
        results: Vec<RegionCheck>,
    },
    /// A region crossed the unhealthy threshold.
    Degraded {
        /// Region id.
        region_id: String,
        /// Failure run length when the threshold was crossed.
        consecutive_failures: u32,
        /// Diagnostic from the failing probe.
        error: Option<String>,
    },
    /// A degraded region crossed the healthy threshold.
    Recovered {
        /// Region id.
        region_id: String,
    },
}

struct RegionEntry {
    url: String,
    check: RegionCheck,
    total_latency_ms: u64,
    latency_samples: u64,
}

/// Periodic health checker over registered region endpoints.
pub struct HealthChecker {
    config: CheckerConfig,
    probe: Arc<dyn EndpointProbe>,
    regions: Mutex<HashMap<String, RegionEntry>>,
    events: broadcast::Sender<CheckerEvent>,
    running: AtomicBool,
    in_flight: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl HealthChecker {
    /// Create a checker probing over HTTP.
    pub fn new(config: CheckerConfig) -> Self {
        Self::with_probe(config, Arc::new(HttpProbe::new()))
    }

    /// Create a checker with an injected probe implementation.
    pub fn with_probe(config: CheckerConfig, probe: Arc<dyn EndpointProbe>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            probe,
            regions: Mutex::new(HashMap::new()),
            events,
            running: AtomicBool::new(false),
            in_flight: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        }
    }

    /// The checker's configuration.
    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Subscribe to checker events.
    pub fn subscribe(&self) -> broadcast::Receiver<CheckerEvent> {
        self.events.subscribe()
    }

    /// Register a region by its base endpoint URL. The configured health path
    /// is appended for probing. Re-registering replaces the URL but keeps no
    /// history.
    pub async fn register_region(&self, region_id: &str, base_url: &str) {
        let url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            self.config.health_path
        );
        let mut regions = self.regions.lock().await;
        regions.insert(
            region_id.to_string(),
            RegionEntry {
                url,
                check: RegionCheck::new(region_id.to_string()),
                total_latency_ms: 0,
                latency_samples: 0,
            },
        );
    }

    /// Remove a region from the probe set.
    pub async fn unregister_region(&self, region_id: &str) {
        self.regions.lock().await.remove(region_id);
    }

    /// Current snapshot for every registered region.
    pub async fn regions(&self) -> Vec<RegionCheck> {
        self.regions
            .lock()
            .await
            .values()
            .map(|e| e.check.clone())
            .collect()
    }

    /// Probe one region and apply the result.
    pub async fn check_region(&self, region_id: &str) -> Result<RegionCheck, HealthError> {
        let url = {
            let regions = self.regions.lock().await;
            let entry = regions.get(region_id).ok_or_else(|| HealthError::UnknownRegion {
                region_id: region_id.to_string(),
            })?;
            entry.url.clone()
        };

        let outcome = self
            .probe
            .probe(&url, self.config.timeout, self.config.expected_status)
            .await;

        let (check, event) = {
            let mut regions = self.regions.lock().await;
            let entry = regions.get_mut(region_id).ok_or_else(|| HealthError::UnknownRegion {
                region_id: region_id.to_string(),
            })?;
            let event = Self::apply(entry, &self.config, outcome.map_err(|f| f.to_string()));
            (entry.check.clone(), event)
        };

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        Ok(check)
    }

    /// Probe every registered region concurrently, apply the results, and emit
    /// one `Checked` batch event.
    pub async fn check_all_regions(&self) -> Vec<RegionCheck> {
        let targets: Vec<(String, String)> = {
            let regions = self.regions.lock().await;
            regions
                .iter()
                .map(|(id, e)| (id.clone(), e.url.clone()))
                .collect()
        };

        let probes = targets.iter().map(|(_, url)| {
            self.probe
                .probe(url, self.config.timeout, self.config.expected_status)
        });
        let outcomes = join_all(probes).await;

        let mut results = Vec::with_capacity(targets.len());
        let mut transitions = Vec::new();
        {
            let mut regions = self.regions.lock().await;
            for ((id, _), outcome) in targets.into_iter().zip(outcomes) {
                // Regions unregistered mid-cycle are skipped.
                if let Some(entry) = regions.get_mut(&id) {
                    if let Some(event) =
                        Self::apply(entry, &self.config, outcome.map_err(|f| f.to_string()))
                    {
                        transitions.push(event);
                    }
                    results.push(entry.check.clone());
                }
            }
        }

        for event in transitions {
            let _ = self.events.send(event);
        }
        let _ = self.events.send(CheckerEvent::Checked {
            results: results.clone(),
        });
        results
    }

    /// Apply one probe outcome, returning a transition event when a debounce
    /// threshold is crossed.
    fn apply(
        entry: &mut RegionEntry,
        config: &CheckerConfig,
        outcome: Result<Duration, String>,
    ) -> Option<CheckerEvent> {
        let check = &mut entry.check;
        check.checks += 1;
        check.last_check_ms = now_ms();

        match outcome {
            Ok(latency) => {
                let latency_ms = latency.as_millis() as u64;
                check.healthy = true;
                check.latency_ms = latency_ms;
                check.consecutive_successes += 1;
                check.consecutive_failures = 0;
                check.last_error = None;

                entry.total_latency_ms += latency_ms;
                entry.latency_samples += 1;
                check.avg_latency_ms = entry.total_latency_ms / entry.latency_samples;
                if entry.latency_samples == 1 || latency_ms < check.min_latency_ms {
                    check.min_latency_ms = latency_ms;
                }
                if latency_ms > check.max_latency_ms {
                    check.max_latency_ms = latency_ms;
                }

                if check.status != HealthStatus::Healthy
                    && check.consecutive_successes >= config.healthy_threshold
                {
                    let was_degraded = check.status == HealthStatus::Degraded;
                    check.status = HealthStatus::Healthy;
                    if was_degraded {
                        info!(region = %check.region_id, "region recovered");
                        return Some(CheckerEvent::Recovered {
                            region_id: check.region_id.clone(),
                        });
                    }
                }
                None
            }
            Err(message) => {
                check.failures += 1;
                check.healthy = false;
                check.consecutive_failures += 1;
                check.consecutive_successes = 0;
                check.last_error = Some(message);
                debug!(
                    region = %check.region_id,
                    consecutive_failures = check.consecutive_failures,
                    "probe failed"
                );

                if check.status != HealthStatus::Degraded
                    && check.consecutive_failures >= config.unhealthy_threshold
                {
                    check.status = HealthStatus::Degraded;
                    warn!(
                        region = %check.region_id,
                        consecutive_failures = check.consecutive_failures,
                        "region degraded"
                    );
                    return Some(CheckerEvent::Degraded {
                        region_id: check.region_id.clone(),
                        consecutive_failures: check.consecutive_failures,
                        error: check.last_error.clone(),
                    });
                }
                None
            }
        }
    }

    /// Start the scheduled probe loop. A cycle that is still running when the
    /// next tick arrives causes that tick to be skipped.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let checker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(checker.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !checker.running.load(Ordering::SeqCst) {
                    break;
                }
                if checker.in_flight.swap(true, Ordering::SeqCst) {
                    debug!("previous health check cycle still running, skipping tick");
                    continue;
                }
                let cycle = Arc::clone(&checker);
                tokio::spawn(async move {
                    cycle.check_all_regions().await;
                    cycle.in_flight.store(false, Ordering::SeqCst);
                });
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the scheduled probe loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Whether the scheduled loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeFailure;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Probe that fails while `failing` is set, and counts calls.
    struct SwitchProbe {
        failing: AtomicBool,
        calls: AtomicU32,
    }

    impl SwitchProbe {
        fn new(failing: bool) -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicBool::new(failing),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl EndpointProbe for SwitchProbe {
        async fn probe(
            &self,
            _url: &str,
            _timeout: Duration,
            _expected_status: u16,
        ) -> Result<Duration, ProbeFailure> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.failing.load(Ordering::Relaxed) {
                Err(ProbeFailure::Transport {
                    message: "connection refused".to_string(),
                })
            } else {
                Ok(Duration::from_millis(10))
            }
        }
    }

    /// Probe that holds every call open for a fixed time and records peak
    /// concurrency.
    struct SlowProbe {
        hold: Duration,
        active: AtomicU32,
        peak: AtomicU32,
    }

    #[async_trait]
    impl EndpointProbe for SlowProbe {
        async fn probe(
            &self,
            _url: &str,
            _timeout: Duration,
            _expected_status: u16,
        ) -> Result<Duration, ProbeFailure> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Duration::from_millis(1))
        }
    }

    fn fast_config() -> CheckerConfig {
        CheckerConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            ..Default::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<CheckerEvent>) -> Vec<CheckerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn config_default() {
        let config = CheckerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.expected_status, 200);
        assert_eq!(config.unhealthy_threshold, 3);
        assert_eq!(config.healthy_threshold, 2);
        assert_eq!(config.health_path, "/health");
    }

    #[tokio::test]
    async fn unknown_region_errors() {
        let checker = HealthChecker::with_probe(fast_config(), SwitchProbe::new(false));
        let result = checker.check_region("nowhere").await;
        assert!(matches!(
            result,
            Err(HealthError::UnknownRegion { region_id }) if region_id == "nowhere"
        ));
    }

    #[tokio::test]
    async fn successful_checks_track_latency() {
        let checker = HealthChecker::with_probe(fast_config(), SwitchProbe::new(false));
        checker.register_region("us-east", "http://us-east.internal").await;

        let check = checker.check_region("us-east").await.unwrap();
        assert!(check.healthy);
        assert_eq!(check.latency_ms, 10);
        assert_eq!(check.min_latency_ms, 10);
        assert_eq!(check.avg_latency_ms, 10);
        assert_eq!(check.max_latency_ms, 10);
        assert_eq!(check.checks, 1);
    }

    #[tokio::test]
    async fn status_unknown_until_threshold() {
        let checker = HealthChecker::with_probe(fast_config(), SwitchProbe::new(false));
        checker.register_region("us-east", "http://us-east.internal").await;

        let check = checker.check_region("us-east").await.unwrap();
        assert_eq!(check.status, HealthStatus::Unknown);

        let check = checker.check_region("us-east").await.unwrap();
        assert_eq!(check.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn degraded_fires_once_after_threshold() {
        let probe = SwitchProbe::new(true);
        let checker =
            HealthChecker::with_probe(fast_config(), Arc::clone(&probe) as Arc<dyn EndpointProbe>);
        checker.register_region("eu-west", "http://eu-west.internal").await;
        let mut rx = checker.subscribe();

        checker.check_region("eu-west").await.unwrap();
        checker.check_region("eu-west").await.unwrap();
        assert!(drain(&mut rx).is_empty());

        let check = checker.check_region("eu-west").await.unwrap();
        assert_eq!(check.status, HealthStatus::Degraded);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            CheckerEvent::Degraded { region_id, consecutive_failures: 3, .. }
                if region_id == "eu-west"
        ));

        // Further failures do not re-fire the transition.
        checker.check_region("eu-west").await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn recovered_fires_once_after_threshold() {
        let probe = SwitchProbe::new(true);
        let checker =
            HealthChecker::with_probe(fast_config(), Arc::clone(&probe) as Arc<dyn EndpointProbe>);
        checker.register_region("eu-west", "http://eu-west.internal").await;
        let mut rx = checker.subscribe();

        for _ in 0..3 {
            checker.check_region("eu-west").await.unwrap();
        }
        drain(&mut rx);

        probe.failing.store(false, Ordering::Relaxed);
        let check = checker.check_region("eu-west").await.unwrap();
        assert_eq!(check.status, HealthStatus::Degraded);
        assert!(drain(&mut rx).is_empty());

        let check = checker.check_region("eu-west").await.unwrap();
        assert_eq!(check.status, HealthStatus::Healthy);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            CheckerEvent::Recovered { region_id } if region_id == "eu-west"
        ));

        checker.check_region("eu-west").await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn no_recovered_event_for_never_degraded_region() {
        let checker = HealthChecker::with_probe(fast_config(), SwitchProbe::new(false));
        checker.register_region("us-east", "http://us-east.internal").await;
        let mut rx = checker.subscribe();

        checker.check_region("us-east").await.unwrap();
        checker.check_region("us-east").await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn failure_diagnostics_recorded() {
        let checker = HealthChecker::with_probe(fast_config(), SwitchProbe::new(true));
        checker.register_region("eu-west", "http://eu-west.internal").await;

        let check = checker.check_region("eu-west").await.unwrap();
        assert!(!check.healthy);
        assert_eq!(check.failures, 1);
        assert!(check.last_error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn counters_are_mutually_exclusive() {
        let probe = SwitchProbe::new(true);
        let checker =
            HealthChecker::with_probe(fast_config(), Arc::clone(&probe) as Arc<dyn EndpointProbe>);
        checker.register_region("r", "http://r.internal").await;

        checker.check_region("r").await.unwrap();
        checker.check_region("r").await.unwrap();
        probe.failing.store(false, Ordering::Relaxed);
        let check = checker.check_region("r").await.unwrap();
        assert_eq!(check.consecutive_failures, 0);
        assert_eq!(check.consecutive_successes, 1);
    }

    #[tokio::test]
    async fn check_all_emits_batch_event() {
        let checker = HealthChecker::with_probe(fast_config(), SwitchProbe::new(false));
        checker.register_region("a", "http://a.internal").await;
        checker.register_region("b", "http://b.internal").await;
        let mut rx = checker.subscribe();

        let results = checker.check_all_regions().await;
        assert_eq!(results.len(), 2);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], CheckerEvent::Checked { results } if results.len() == 2));
    }

    #[tokio::test]
    async fn scheduled_loop_probes_and_stops() {
        let probe = SwitchProbe::new(false);
        let checker = Arc::new(HealthChecker::with_probe(
            fast_config(),
            Arc::clone(&probe) as Arc<dyn EndpointProbe>,
        ));
        checker.register_region("a", "http://a.internal").await;

        checker.start();
        assert!(checker.is_running());
        tokio::time::sleep(Duration::from_millis(60)).await;
        checker.stop();
        assert!(!checker.is_running());

        // Let any cycle spawned just before the stop finish.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls = probe.calls.load(Ordering::Relaxed);
        assert!(calls >= 2, "expected several scheduled probes, got {}", calls);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(probe.calls.load(Ordering::Relaxed), calls);
    }

    #[tokio::test]
    async fn overlapping_cycles_are_skipped() {
        let probe = Arc::new(SlowProbe {
            hold: Duration::from_millis(50),
            active: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        });
        let checker = Arc::new(HealthChecker::with_probe(
            fast_config(),
            Arc::clone(&probe) as Arc<dyn EndpointProbe>,
        ));
        checker.register_region("a", "http://a.internal").await;

        checker.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        checker.stop();

        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_twice_is_a_no_op() {
        let checker = Arc::new(HealthChecker::with_probe(fast_config(), SwitchProbe::new(false)));
        checker.start();
        checker.start();
        checker.stop();
    }

    #[tokio::test]
    async fn unregister_removes_region() {
        let checker = HealthChecker::with_probe(fast_config(), SwitchProbe::new(false));
        checker.register_region("a", "http://a.internal").await;
        checker.unregister_region("a").await;
        assert!(checker.regions().await.is_empty());
        assert!(checker.check_region("a").await.is_err());
    }
}
