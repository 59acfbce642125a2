//! Prometheus text exposition
//!
//! Renders coordinator metrics for `GET /metrics` (served by `http_api`).

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// One metric family split by a single label
fn write_labeled(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    label: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{{label}=\"{value}\"}} {count}");
    }
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {count}");
}

/// Format metrics in Prometheus text exposition format
///
/// Reads the lifetime histogram, so scrapes stay cumulative and leave the
/// periodic log window alone.
pub fn format_prometheus_metrics(metrics: &Metrics) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_join_metrics(&mut output, &summary);
    write_queue_metrics(&mut output, &summary);
    write_distance_metrics(&mut output, &summary);
    write_location_metrics(&mut output, &summary);
    write_transport_metrics(&mut output, &summary);

    output
}

fn write_join_metrics(output: &mut String, summary: &MetricsSummary) {
    write_labeled(
        output,
        "showgate_joins_total",
        "Accepted joins by assigned role",
        MetricType::Counter,
        "role",
        &[("host", summary.joins_host), ("performer", summary.joins_performer)],
    );
    write_metric(
        output,
        "showgate_joins_degraded_total",
        "Joins admitted without a proximity check",
        MetricType::Counter,
        summary.joins_degraded,
    );
    write_metric(
        output,
        "showgate_joins_idempotent_total",
        "Joins by participants who were already members",
        MetricType::Counter,
        summary.joins_idempotent,
    );
    write_labeled(
        output,
        "showgate_joins_rejected_total",
        "Rejected joins by reason",
        MetricType::Counter,
        "reason",
        &[
            ("session_not_found", summary.rejected_not_found),
            ("session_inactive", summary.rejected_inactive),
            ("out_of_range", summary.rejected_out_of_range),
            ("invalid", summary.rejected_invalid),
        ],
    );

    write_histogram(
        output,
        "showgate_join_latency_us",
        "Join decision latency in microseconds",
        &summary.join_lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.join_lat_sum_us,
    );
    write_metric(
        output,
        "showgate_join_latency_p99_us",
        "99th percentile join decision latency",
        MetricType::Gauge,
        summary.join_lat_p99_us,
    );
    write_metric(
        output,
        "showgate_join_latency_max_us",
        "Maximum join decision latency",
        MetricType::Gauge,
        summary.join_lat_max_us,
    );
}

fn write_queue_metrics(output: &mut String, summary: &MetricsSummary) {
    write_labeled(
        output,
        "showgate_queue_operations_total",
        "Queue and stage operations",
        MetricType::Counter,
        "op",
        &[
            ("enqueue", summary.enqueues_total),
            ("dequeue", summary.dequeues_total),
            ("set_current_performer", summary.performer_changes_total),
        ],
    );
    write_metric(output, "showgate_leaves_total", "Participants who left", MetricType::Counter, summary.leaves_total);
    write_metric(
        output,
        "showgate_sessions_ended_total",
        "Sessions ended by host departure",
        MetricType::Counter,
        summary.sessions_ended_total,
    );
    write_metric(
        output,
        "showgate_chat_messages_total",
        "Chat messages appended",
        MetricType::Counter,
        summary.chat_messages_total,
    );
    write_metric(
        output,
        "showgate_invariant_violations_total",
        "Operations rolled back after failing the session invariant check",
        MetricType::Counter,
        summary.invariant_violations_total,
    );
    write_metric(
        output,
        "showgate_active_sessions",
        "Currently active sessions",
        MetricType::Gauge,
        summary.active_sessions,
    );
}

fn write_distance_metrics(output: &mut String, summary: &MetricsSummary) {
    write_labeled(
        output,
        "showgate_distance_total",
        "Distance computations by path",
        MetricType::Counter,
        "path",
        &[
            ("remote", summary.distance_remote_total),
            ("fallback", summary.distance_fallback_total),
            ("local", summary.distance_local_total),
        ],
    );
}

fn write_location_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "showgate_location_attempts_total",
        "Location acquisition attempts",
        MetricType::Counter,
        summary.location_attempts_total,
    );
    write_metric(
        output,
        "showgate_location_retries_total",
        "Location acquisition retries after a transient failure",
        MetricType::Counter,
        summary.location_retries_total,
    );
    write_metric(
        output,
        "showgate_location_failures_total",
        "Location acquisitions that failed terminally",
        MetricType::Counter,
        summary.location_failures_total,
    );
}

fn write_transport_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "showgate_broadcast_sent_total",
        "State deltas handed to the broadcaster",
        MetricType::Counter,
        summary.broadcast_sent_total,
    );
    write_metric(
        output,
        "showgate_broadcast_dropped_total",
        "State deltas dropped due to channel full",
        MetricType::Counter,
        summary.broadcast_dropped_total,
    );
    write_metric(
        output,
        "showgate_http_requests_total",
        "HTTP requests served",
        MetricType::Counter,
        summary.http_requests_total,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::AdmissionError;
    use crate::domain::types::Role;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_join(Role::Host, false, false, 150);
        metrics.record_join(Role::Performer, true, false, 250);
        metrics.record_join_rejected(
            &AdmissionError::OutOfRange { distance_meters: 100.0, radius_meters: 30.0 },
            90,
        );
        metrics.record_distance_fallback();
        metrics.set_active_sessions(3);

        let output = format_prometheus_metrics(&metrics);

        assert!(output.contains("showgate_joins_total{role=\"host\"} 1"));
        assert!(output.contains("showgate_joins_total{role=\"performer\"} 1"));
        assert!(output.contains("showgate_joins_degraded_total 1"));
        assert!(output.contains("showgate_joins_rejected_total{reason=\"out_of_range\"} 1"));
        assert!(output.contains("showgate_join_latency_us_bucket{le=\"+Inf\"} 3"));
        assert!(output.contains("showgate_distance_total{path=\"fallback\"} 1"));
        assert!(output.contains("showgate_active_sessions 3"));
        assert!(output.contains("showgate_join_latency_us_sum 490"));
    }

    #[test]
    fn test_scrapes_are_cumulative() {
        let metrics = Metrics::new();
        metrics.record_join(Role::Host, false, false, 150);
        metrics.record_join(Role::Performer, false, false, 5000);

        let first = format_prometheus_metrics(&metrics);
        // The periodic log reporter drains its own window in between
        metrics.report();
        let second = format_prometheus_metrics(&metrics);

        assert_eq!(first, second);
        assert!(second.contains("showgate_join_latency_us_bucket{le=\"200\"} 1"));
        assert!(second.contains("showgate_join_latency_us_bucket{le=\"+Inf\"} 2"));
        assert!(second.contains("showgate_join_latency_us_count 2"));

        metrics.record_join(Role::Performer, false, false, 90);
        let third = format_prometheus_metrics(&metrics);
        assert!(third.contains("showgate_join_latency_us_bucket{le=\"+Inf\"} 3"));
        assert!(third.contains("showgate_join_latency_us_sum 5240"));
    }
}
