//! Thread-safe metrics collection
//!
//! Atomic counters for the hot paths (detection, claims, MQTT) and
//! mutex-protected collections for per-source statistics and timings. One
//! collector lives in the engine context.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Bound on stored timing samples
const MAX_SAMPLES: usize = 1000;

/// Engine-wide metrics collector
pub struct EngineMetrics {
    // Detection
    candidates_detected: AtomicU64,
    duplicates_suppressed: AtomicU64,
    bridge_messages_quarantined: AtomicU64,
    last_hook_heartbeat: AtomicU64,

    // Claims
    prefilter_rejections: AtomicU64,
    claims_attempted: AtomicU64,
    claims_won: AtomicU64,
    claims_lost: AtomicU64,
    claim_errors: AtomicU64,
    slot_busy: AtomicBool,

    // Fulfillment
    fulfillments_started: AtomicU64,
    fulfillments_succeeded: AtomicU64,
    fulfillments_failed: AtomicU64,
    cancellations_succeeded: AtomicU64,
    cancellations_failed: AtomicU64,
    documents_sanitized: AtomicU64,
    sanitizer_failures: AtomicU64,
    fulfillment_times: Mutex<Vec<u64>>, // milliseconds

    // Per-source download statistics
    source_stats: Mutex<HashMap<String, SourceStats>>,

    // Control channel
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connection_failures: AtomicU64,
    notifications_published: AtomicU64,
    publish_failures: AtomicU64,
    signals_received: AtomicU64,

    // Lifecycle
    engine_state: Mutex<String>,
    uptime_start: AtomicU64,
    session_alive: AtomicBool,
    session_launches: AtomicU64,
    relaunch_failures: AtomicU64,
    recoveries: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            candidates_detected: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            bridge_messages_quarantined: AtomicU64::new(0),
            last_hook_heartbeat: AtomicU64::new(0),
            prefilter_rejections: AtomicU64::new(0),
            claims_attempted: AtomicU64::new(0),
            claims_won: AtomicU64::new(0),
            claims_lost: AtomicU64::new(0),
            claim_errors: AtomicU64::new(0),
            slot_busy: AtomicBool::new(false),
            fulfillments_started: AtomicU64::new(0),
            fulfillments_succeeded: AtomicU64::new(0),
            fulfillments_failed: AtomicU64::new(0),
            cancellations_succeeded: AtomicU64::new(0),
            cancellations_failed: AtomicU64::new(0),
            documents_sanitized: AtomicU64::new(0),
            sanitizer_failures: AtomicU64::new(0),
            fulfillment_times: Mutex::new(Vec::new()),
            source_stats: Mutex::new(HashMap::new()),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            notifications_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            signals_received: AtomicU64::new(0),
            engine_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            session_alive: AtomicBool::new(false),
            session_launches: AtomicU64::new(0),
            relaunch_failures: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    // Detection
    pub fn candidate_detected(&self) {
        self.candidates_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bridge_message_quarantined(&self) {
        self.bridge_messages_quarantined
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn hook_heartbeat(&self) {
        self.last_hook_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Claims
    pub fn prefilter_rejected(&self) {
        self.prefilter_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn claim_attempted(&self) {
        self.claims_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn claim_won(&self) {
        self.claims_won.fetch_add(1, Ordering::Relaxed);
    }

    pub fn claim_lost(&self) {
        self.claims_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn claim_error(&self) {
        self.claim_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_slot_busy(&self, busy: bool) {
        self.slot_busy.store(busy, Ordering::Relaxed);
    }

    // Fulfillment
    pub fn fulfillment_started(&self) {
        self.fulfillments_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fulfillment_succeeded(&self, duration: Duration) {
        self.fulfillments_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_fulfillment_time(duration);
    }

    pub fn fulfillment_failed(&self, duration: Duration) {
        self.fulfillments_failed.fetch_add(1, Ordering::Relaxed);
        self.record_fulfillment_time(duration);
    }

    pub fn cancellation_succeeded(&self) {
        self.cancellations_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancellation_failed(&self) {
        self.cancellations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn document_sanitized(&self) {
        self.documents_sanitized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sanitizer_failed(&self) {
        self.sanitizer_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fulfillment_time(&self, duration: Duration) {
        if let Ok(mut times) = self.fulfillment_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_SAMPLES {
                times.remove(0);
            }
        }
    }

    /// Record one source attempt, successful or not
    pub fn source_attempted(&self, source: &str, duration: Duration, success: bool) {
        if let Ok(mut stats) = self.source_stats.lock() {
            let entry = stats
                .entry(source.to_string())
                .or_insert_with(|| SourceStats::new(source));
            entry.attempts += 1;
            entry.last_attempt = current_timestamp();
            entry.times.push(duration.as_millis() as u64);
            if entry.times.len() > MAX_SAMPLES {
                entry.times.remove(0);
            }
            if !success {
                entry.failures += 1;
            }
        }
    }

    // Control channel
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.mqtt_connected.store(true, Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn notification_published(&self) {
        self.notifications_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn signal_received(&self) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle
    pub fn set_engine_state(&self, state: &str) {
        if let Ok(mut current) = self.engine_state.lock() {
            if *current != state {
                *current = state.to_string();
            }
        }
    }

    pub fn set_session_alive(&self, alive: bool) {
        self.session_alive.store(alive, Ordering::Relaxed);
    }

    pub fn session_alive(&self) -> bool {
        self.session_alive.load(Ordering::Relaxed)
    }

    pub fn session_launched(&self) {
        self.session_launches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relaunch_failed(&self) {
        self.relaunch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_recovered(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    fn fulfillment_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.fulfillment_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    fn source_snapshots(&self) -> HashMap<String, SourceStatsSnapshot> {
        self.source_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(name, s)| (name.clone(), s.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Point-in-time copy of every metric
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95) = self.fulfillment_time_statistics();

        MetricsSnapshot {
            detection: DetectionMetrics {
                candidates_detected: self.candidates_detected.load(Ordering::Relaxed),
                duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
                bridge_messages_quarantined: self
                    .bridge_messages_quarantined
                    .load(Ordering::Relaxed),
                last_hook_heartbeat: self.last_hook_heartbeat.load(Ordering::Relaxed),
            },
            claims: ClaimMetrics {
                prefilter_rejections: self.prefilter_rejections.load(Ordering::Relaxed),
                attempted: self.claims_attempted.load(Ordering::Relaxed),
                won: self.claims_won.load(Ordering::Relaxed),
                lost: self.claims_lost.load(Ordering::Relaxed),
                errors: self.claim_errors.load(Ordering::Relaxed),
                slot_busy: self.slot_busy.load(Ordering::Relaxed),
            },
            fulfillment: FulfillmentMetrics {
                started: self.fulfillments_started.load(Ordering::Relaxed),
                succeeded: self.fulfillments_succeeded.load(Ordering::Relaxed),
                failed: self.fulfillments_failed.load(Ordering::Relaxed),
                cancellations_succeeded: self.cancellations_succeeded.load(Ordering::Relaxed),
                cancellations_failed: self.cancellations_failed.load(Ordering::Relaxed),
                documents_sanitized: self.documents_sanitized.load(Ordering::Relaxed),
                sanitizer_failures: self.sanitizer_failures.load(Ordering::Relaxed),
                avg_duration_ms: avg,
                duration_p50_ms: p50,
                duration_p95_ms: p95,
                sources: self.source_snapshots(),
            },
            control: ControlMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                notifications_published: self.notifications_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                signals_received: self.signals_received.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .engine_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                session_alive: self.session_alive.load(Ordering::Relaxed),
                session_launches: self.session_launches.load(Ordering::Relaxed),
                relaunch_failures: self.relaunch_failures.load(Ordering::Relaxed),
                recoveries: self.recoveries.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct SourceStats {
    name: String,
    attempts: u64,
    failures: u64,
    times: Vec<u64>, // milliseconds
    last_attempt: u64,
}

impl SourceStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attempts: 0,
            failures: 0,
            times: Vec::new(),
            last_attempt: 0,
        }
    }

    fn snapshot(&self) -> SourceStatsSnapshot {
        let avg_duration_ms = if self.times.is_empty() {
            0.0
        } else {
            self.times.iter().sum::<u64>() as f64 / self.times.len() as f64
        };
        let success_rate = if self.attempts == 0 {
            0.0
        } else {
            (self.attempts - self.failures) as f64 / self.attempts as f64
        };
        SourceStatsSnapshot {
            name: self.name.clone(),
            attempts: self.attempts,
            failures: self.failures,
            avg_duration_ms,
            last_attempt: self.last_attempt,
            success_rate,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub detection: DetectionMetrics,
    pub claims: ClaimMetrics,
    pub fulfillment: FulfillmentMetrics,
    pub control: ControlMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct DetectionMetrics {
    pub candidates_detected: u64,
    pub duplicates_suppressed: u64,
    pub bridge_messages_quarantined: u64,
    pub last_hook_heartbeat: u64,
}

#[derive(Debug, Serialize)]
pub struct ClaimMetrics {
    pub prefilter_rejections: u64,
    pub attempted: u64,
    pub won: u64,
    pub lost: u64,
    pub errors: u64,
    pub slot_busy: bool,
}

#[derive(Debug, Serialize)]
pub struct FulfillmentMetrics {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancellations_succeeded: u64,
    pub cancellations_failed: u64,
    pub documents_sanitized: u64,
    pub sanitizer_failures: u64,
    pub avg_duration_ms: f64,
    pub duration_p50_ms: f64,
    pub duration_p95_ms: f64,
    pub sources: HashMap<String, SourceStatsSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct SourceStatsSnapshot {
    pub name: String,
    pub attempts: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
    pub last_attempt: u64,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct ControlMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub notifications_published: u64,
    pub publish_failures: u64,
    pub signals_received: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub session_alive: bool,
    pub session_launches: u64,
    pub relaunch_failures: u64,
    pub recoveries: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_claim_counters() {
        let metrics = EngineMetrics::new();

        metrics.claim_attempted();
        metrics.claim_attempted();
        metrics.claim_won();
        metrics.claim_lost();
        metrics.set_slot_busy(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.claims.attempted, 2);
        assert_eq!(snapshot.claims.won, 1);
        assert_eq!(snapshot.claims.lost, 1);
        assert!(snapshot.claims.slot_busy);
    }

    #[test]
    fn test_source_statistics() {
        let metrics = EngineMetrics::new();

        metrics.source_attempted("mirror", Duration::from_millis(500), true);
        metrics.source_attempted("mirror", Duration::from_millis(300), false);

        let snapshot = metrics.snapshot();
        let mirror = snapshot.fulfillment.sources.get("mirror").unwrap();
        assert_eq!(mirror.attempts, 2);
        assert_eq!(mirror.failures, 1);
        assert_eq!(mirror.success_rate, 0.5);
        assert!(mirror.avg_duration_ms > 350.0);
    }

    #[test]
    fn test_fulfillment_timings() {
        let metrics = EngineMetrics::new();

        metrics.fulfillment_started();
        metrics.fulfillment_succeeded(Duration::from_millis(1500));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fulfillment.started, 1);
        assert_eq!(snapshot.fulfillment.succeeded, 1);
        assert!(snapshot.fulfillment.avg_duration_ms > 1400.0);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(EngineMetrics::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.candidate_detected();
                        metrics.notification_published();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.detection.candidates_detected, 1000);
        assert_eq!(snapshot.control.notifications_published, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.5).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_timing_samples_are_bounded() {
        let metrics = EngineMetrics::new();
        for i in 0..1500 {
            metrics.fulfillment_failed(Duration::from_millis(i));
        }
        let len = metrics.fulfillment_times.lock().unwrap().len();
        assert_eq!(len, MAX_SAMPLES);
    }
}
