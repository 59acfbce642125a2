//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! Join latency is kept twice: a window that `report()` drains for the
//! periodic log line, and a lifetime histogram that `snapshot()` reads for
//! Prometheus scrapes.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only; the registry keeps its own active-session count.

use crate::domain::error::AdmissionError;
use crate::domain::types::Role;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Read all buckets without resetting them
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps the latency window; `snapshot()`
/// only reads.
pub struct Metrics {
    /// Admissions by role (monotonic)
    joins_host: AtomicU64,
    joins_performer: AtomicU64,
    /// Admissions without a proximity check (monotonic)
    joins_degraded: AtomicU64,
    /// Re-joins of an existing participant (monotonic)
    joins_idempotent: AtomicU64,
    /// Rejections by reason (monotonic)
    rejected_not_found: AtomicU64,
    rejected_inactive: AtomicU64,
    rejected_out_of_range: AtomicU64,
    rejected_invalid: AtomicU64,
    /// Join decision latency histogram buckets (reset on report)
    join_latency_buckets: [AtomicU64; NUM_BUCKETS],
    join_latency_sum_us: AtomicU64,
    join_latency_max_us: AtomicU64,
    joins_since_report: AtomicU64,
    /// Join decision latency since startup (never reset)
    join_latency_total_buckets: [AtomicU64; NUM_BUCKETS],
    join_latency_total_sum_us: AtomicU64,
    join_latency_total_max_us: AtomicU64,
    /// Queue / membership operations (monotonic)
    enqueues_total: AtomicU64,
    dequeues_total: AtomicU64,
    performer_changes_total: AtomicU64,
    leaves_total: AtomicU64,
    sessions_ended_total: AtomicU64,
    chat_messages_total: AtomicU64,
    /// Operations rolled back after an invariant check failed (monotonic)
    invariant_violations_total: AtomicU64,
    /// Distance computations (monotonic)
    distance_remote_total: AtomicU64,
    distance_fallback_total: AtomicU64,
    distance_local_total: AtomicU64,
    /// Location acquisition (monotonic)
    location_attempts_total: AtomicU64,
    location_retries_total: AtomicU64,
    location_failures_total: AtomicU64,
    /// Broadcast deltas dropped due to channel full (monotonic)
    broadcast_dropped_total: AtomicU64,
    broadcast_sent_total: AtomicU64,
    /// HTTP requests served (monotonic)
    http_requests_total: AtomicU64,
    /// Active sessions (updated by registry)
    active_sessions: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            joins_host: AtomicU64::new(0),
            joins_performer: AtomicU64::new(0),
            joins_degraded: AtomicU64::new(0),
            joins_idempotent: AtomicU64::new(0),
            rejected_not_found: AtomicU64::new(0),
            rejected_inactive: AtomicU64::new(0),
            rejected_out_of_range: AtomicU64::new(0),
            rejected_invalid: AtomicU64::new(0),
            join_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            join_latency_sum_us: AtomicU64::new(0),
            join_latency_max_us: AtomicU64::new(0),
            joins_since_report: AtomicU64::new(0),
            join_latency_total_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            join_latency_total_sum_us: AtomicU64::new(0),
            join_latency_total_max_us: AtomicU64::new(0),
            enqueues_total: AtomicU64::new(0),
            dequeues_total: AtomicU64::new(0),
            performer_changes_total: AtomicU64::new(0),
            leaves_total: AtomicU64::new(0),
            sessions_ended_total: AtomicU64::new(0),
            chat_messages_total: AtomicU64::new(0),
            invariant_violations_total: AtomicU64::new(0),
            distance_remote_total: AtomicU64::new(0),
            distance_fallback_total: AtomicU64::new(0),
            distance_local_total: AtomicU64::new(0),
            location_attempts_total: AtomicU64::new(0),
            location_retries_total: AtomicU64::new(0),
            location_failures_total: AtomicU64::new(0),
            broadcast_dropped_total: AtomicU64::new(0),
            broadcast_sent_total: AtomicU64::new(0),
            http_requests_total: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
            started_at: Instant::now(),
        }
    }

    /// Record an accepted join (lock-free)
    #[inline]
    pub fn record_join(&self, role: Role, degraded: bool, idempotent: bool, latency_us: u64) {
        if idempotent {
            self.joins_idempotent.fetch_add(1, Ordering::Relaxed);
        } else {
            match role {
                Role::Host => self.joins_host.fetch_add(1, Ordering::Relaxed),
                Role::Performer => self.joins_performer.fetch_add(1, Ordering::Relaxed),
            };
        }
        if degraded {
            self.joins_degraded.fetch_add(1, Ordering::Relaxed);
        }
        self.record_join_latency(latency_us);
    }

    /// Record a rejected join (lock-free)
    #[inline]
    pub fn record_join_rejected(&self, error: &AdmissionError, latency_us: u64) {
        let counter = match error {
            AdmissionError::SessionNotFound(_) => &self.rejected_not_found,
            AdmissionError::SessionInactive(_) => &self.rejected_inactive,
            AdmissionError::OutOfRange { .. } => &self.rejected_out_of_range,
            AdmissionError::InvalidLocation { .. } | AdmissionError::InvariantViolation(_) => {
                &self.rejected_invalid
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.record_join_latency(latency_us);
    }

    #[inline]
    fn record_join_latency(&self, latency_us: u64) {
        self.joins_since_report.fetch_add(1, Ordering::Relaxed);
        self.join_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        // Update histogram bucket
        let bucket = bucket_index(latency_us);
        self.join_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.join_latency_total_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.join_latency_total_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        // Update max
        update_atomic_max(&self.join_latency_max_us, latency_us);
        update_atomic_max(&self.join_latency_total_max_us, latency_us);
    }

    #[inline]
    pub fn record_enqueue(&self) {
        self.enqueues_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dequeue(&self) {
        self.dequeues_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_performer_change(&self) {
        self.performer_changes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_leave(&self, ended_session: bool) {
        self.leaves_total.fetch_add(1, Ordering::Relaxed);
        if ended_session {
            self.sessions_ended_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_chat_message(&self) {
        self.chat_messages_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invariant_violation(&self) {
        self.invariant_violations_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a distance served by the authoritative remote path
    #[inline]
    pub fn record_distance_remote(&self) {
        self.distance_remote_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a remote failure recovered by the local formula
    #[inline]
    pub fn record_distance_fallback(&self) {
        self.distance_fallback_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a distance computed locally with no remote configured
    #[inline]
    pub fn record_distance_local(&self) {
        self.distance_local_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_location_attempt(&self) {
        self.location_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_location_retry(&self) {
        self.location_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_location_failure(&self) {
        self.location_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_broadcast(&self, delivered: bool) {
        if delivered {
            self.broadcast_sent_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.broadcast_dropped_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_http_request(&self) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_active_sessions(&self, count: u64) {
        self.active_sessions.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn distance_fallback_total(&self) -> u64 {
        self.distance_fallback_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn distance_remote_total(&self) -> u64 {
        self.distance_remote_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn location_retries_total(&self) -> u64 {
        self.location_retries_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn invariant_violations_total(&self) -> u64 {
        self.invariant_violations_total.load(Ordering::Relaxed)
    }

    /// Generate a metrics summary, resetting the periodic join-latency window
    pub fn report(&self) -> MetricsSummary {
        // Swap periodic counters to zero and get their values
        let join_count = self.joins_since_report.swap(0, Ordering::Relaxed);
        let join_latency_sum = self.join_latency_sum_us.swap(0, Ordering::Relaxed);
        let join_latency_max = self.join_latency_max_us.swap(0, Ordering::Relaxed);
        let join_lat_buckets = swap_buckets(&self.join_latency_buckets);

        // Calculate elapsed time and reset
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        self.summarize(join_lat_buckets, join_count, join_latency_sum, join_latency_max, elapsed.as_secs_f64())
    }

    /// Lifetime view for scrapes. Reads only, so it never disturbs `report()`.
    pub fn snapshot(&self) -> MetricsSummary {
        let join_lat_buckets = load_buckets(&self.join_latency_total_buckets);
        let join_count: u64 = join_lat_buckets.iter().sum();
        self.summarize(
            join_lat_buckets,
            join_count,
            self.join_latency_total_sum_us.load(Ordering::Relaxed),
            self.join_latency_total_max_us.load(Ordering::Relaxed),
            self.started_at.elapsed().as_secs_f64(),
        )
    }

    fn summarize(
        &self,
        join_lat_buckets: [u64; NUM_BUCKETS],
        join_count: u64,
        join_latency_sum: u64,
        join_latency_max: u64,
        elapsed_secs: f64,
    ) -> MetricsSummary {
        let joins_per_sec = if elapsed_secs > 0.0 { join_count as f64 / elapsed_secs } else { 0.0 };
        let join_lat_avg_us = if join_count > 0 { join_latency_sum / join_count } else { 0 };

        MetricsSummary {
            joins_host: self.joins_host.load(Ordering::Relaxed),
            joins_performer: self.joins_performer.load(Ordering::Relaxed),
            joins_degraded: self.joins_degraded.load(Ordering::Relaxed),
            joins_idempotent: self.joins_idempotent.load(Ordering::Relaxed),
            rejected_not_found: self.rejected_not_found.load(Ordering::Relaxed),
            rejected_inactive: self.rejected_inactive.load(Ordering::Relaxed),
            rejected_out_of_range: self.rejected_out_of_range.load(Ordering::Relaxed),
            rejected_invalid: self.rejected_invalid.load(Ordering::Relaxed),
            joins_per_sec,
            join_lat_buckets,
            join_lat_sum_us: join_latency_sum,
            join_lat_avg_us,
            join_lat_max_us: join_latency_max,
            join_lat_p50_us: percentile_from_buckets(&join_lat_buckets, 0.50),
            join_lat_p95_us: percentile_from_buckets(&join_lat_buckets, 0.95),
            join_lat_p99_us: percentile_from_buckets(&join_lat_buckets, 0.99),
            enqueues_total: self.enqueues_total.load(Ordering::Relaxed),
            dequeues_total: self.dequeues_total.load(Ordering::Relaxed),
            performer_changes_total: self.performer_changes_total.load(Ordering::Relaxed),
            leaves_total: self.leaves_total.load(Ordering::Relaxed),
            sessions_ended_total: self.sessions_ended_total.load(Ordering::Relaxed),
            chat_messages_total: self.chat_messages_total.load(Ordering::Relaxed),
            invariant_violations_total: self.invariant_violations_total.load(Ordering::Relaxed),
            distance_remote_total: self.distance_remote_total.load(Ordering::Relaxed),
            distance_fallback_total: self.distance_fallback_total.load(Ordering::Relaxed),
            distance_local_total: self.distance_local_total.load(Ordering::Relaxed),
            location_attempts_total: self.location_attempts_total.load(Ordering::Relaxed),
            location_retries_total: self.location_retries_total.load(Ordering::Relaxed),
            location_failures_total: self.location_failures_total.load(Ordering::Relaxed),
            broadcast_sent_total: self.broadcast_sent_total.load(Ordering::Relaxed),
            broadcast_dropped_total: self.broadcast_dropped_total.load(Ordering::Relaxed),
            http_requests_total: self.http_requests_total.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Public constant for number of histogram buckets
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Public constant for histogram bucket bounds (for Prometheus export)
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

/// Point-in-time metrics snapshot
#[derive(Debug)]
pub struct MetricsSummary {
    pub joins_host: u64,
    pub joins_performer: u64,
    pub joins_degraded: u64,
    pub joins_idempotent: u64,
    pub rejected_not_found: u64,
    pub rejected_inactive: u64,
    pub rejected_out_of_range: u64,
    pub rejected_invalid: u64,
    pub joins_per_sec: f64,
    pub join_lat_buckets: [u64; NUM_BUCKETS],
    pub join_lat_sum_us: u64,
    pub join_lat_avg_us: u64,
    pub join_lat_max_us: u64,
    pub join_lat_p50_us: u64,
    pub join_lat_p95_us: u64,
    pub join_lat_p99_us: u64,
    pub enqueues_total: u64,
    pub dequeues_total: u64,
    pub performer_changes_total: u64,
    pub leaves_total: u64,
    pub sessions_ended_total: u64,
    pub chat_messages_total: u64,
    pub invariant_violations_total: u64,
    pub distance_remote_total: u64,
    pub distance_fallback_total: u64,
    pub distance_local_total: u64,
    pub location_attempts_total: u64,
    pub location_retries_total: u64,
    pub location_failures_total: u64,
    pub broadcast_sent_total: u64,
    pub broadcast_dropped_total: u64,
    pub http_requests_total: u64,
    pub active_sessions: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            active_sessions = %self.active_sessions,
            joins_host = %self.joins_host,
            joins_performer = %self.joins_performer,
            joins_degraded = %self.joins_degraded,
            joins_per_sec = format!("{:.2}", self.joins_per_sec),
            join_p99_us = %self.join_lat_p99_us,
            rejected_out_of_range = %self.rejected_out_of_range,
            rejected_inactive = %self.rejected_inactive,
            distance_fallbacks = %self.distance_fallback_total,
            broadcast_dropped = %self.broadcast_dropped_total,
            invariant_violations = %self.invariant_violations_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SessionId;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_record_join_by_role() {
        let metrics = Metrics::new();
        metrics.record_join(Role::Host, false, false, 50);
        metrics.record_join(Role::Performer, true, false, 150);
        metrics.record_join(Role::Performer, false, true, 150);

        let summary = metrics.report();
        assert_eq!(summary.joins_host, 1);
        assert_eq!(summary.joins_performer, 1);
        assert_eq!(summary.joins_degraded, 1);
        assert_eq!(summary.joins_idempotent, 1);
        assert_eq!(summary.join_lat_buckets[0], 1);
        assert_eq!(summary.join_lat_buckets[1], 2);
        assert_eq!(summary.join_lat_max_us, 150);
    }

    #[test]
    fn test_report_resets_latency_window() {
        let metrics = Metrics::new();
        metrics.record_join(Role::Host, false, false, 300);
        let first = metrics.report();
        assert_eq!(first.join_lat_avg_us, 300);

        let second = metrics.report();
        assert_eq!(second.join_lat_avg_us, 0);
        assert_eq!(second.join_lat_buckets.iter().sum::<u64>(), 0);
        // Monotonic counters survive the report
        assert_eq!(second.joins_host, 1);
    }

    #[test]
    fn test_snapshot_does_not_drain() {
        let metrics = Metrics::new();
        metrics.record_join(Role::Host, false, false, 300);
        metrics.record_join(Role::Performer, false, false, 90);

        let first = metrics.snapshot();
        metrics.report();
        let second = metrics.snapshot();

        for summary in [&first, &second] {
            assert_eq!(summary.join_lat_buckets.iter().sum::<u64>(), 2);
            assert_eq!(summary.join_lat_buckets[0], 1);
            assert_eq!(summary.join_lat_buckets[2], 1);
            assert_eq!(summary.join_lat_sum_us, 390);
            assert_eq!(summary.join_lat_max_us, 300);
        }

        // The drained window does not affect later lifetime totals
        metrics.record_join(Role::Performer, false, false, 10);
        assert_eq!(metrics.snapshot().join_lat_buckets[0], 2);
        assert_eq!(metrics.report().join_lat_buckets.iter().sum::<u64>(), 1);
    }

    #[test]
    fn test_rejections_by_reason() {
        let metrics = Metrics::new();
        metrics.record_join_rejected(&AdmissionError::SessionNotFound(SessionId::from("x")), 10);
        metrics.record_join_rejected(
            &AdmissionError::OutOfRange { distance_meters: 100.0, radius_meters: 30.0 },
            10,
        );
        let summary = metrics.report();
        assert_eq!(summary.rejected_not_found, 1);
        assert_eq!(summary.rejected_out_of_range, 1);
        assert_eq!(summary.rejected_inactive, 0);
    }

    #[test]
    fn test_percentile_from_buckets() {
        let mut buckets = [0u64; NUM_BUCKETS];
        buckets[0] = 90;
        buckets[5] = 10;
        assert_eq!(percentile_from_buckets(&buckets, 0.50), 100);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 3200);
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.99), 0);
    }
}
