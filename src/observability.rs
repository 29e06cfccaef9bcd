use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

// ── Business metrics ────────────────────────────────────────────

/// Counter: bookings by outcome. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "deskhub_bookings_total";

/// Counter: booking status transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "deskhub_booking_transitions_total";

/// Counter: payment attempts by terminal status. Labels: method, status, currency.
pub const PAYMENTS_TOTAL: &str = "deskhub_payments_total";

/// Counter: individual gateway calls. Labels: op, result.
pub const GATEWAY_ATTEMPTS_TOTAL: &str = "deskhub_gateway_attempts_total";

/// Histogram: gateway call latency in seconds. Labels: op.
pub const GATEWAY_LATENCY_SECONDS: &str = "deskhub_gateway_latency_seconds";

/// Counter: ingested sensor readings. Labels: sensor_type.
pub const IOT_READINGS_TOTAL: &str = "deskhub_iot_readings_total";

/// Counter: webhook deliveries rejected for a bad signature. Labels: source.
pub const WEBHOOK_SIGNATURE_FAILURES_TOTAL: &str = "deskhub_webhook_signature_failures_total";

/// Counter: verification verdicts. Labels: status.
pub const VERIFICATIONS_TOTAL: &str = "deskhub_verifications_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "deskhub_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "deskhub_wal_flush_batch_size";

/// Counter: HTTP requests. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "deskhub_http_requests_total";

/// Where components report counters and histograms. Handed to each component
/// at construction; nothing reaches for a global.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]);
    fn record(&self, name: &'static str, value: f64, labels: &[(&'static str, &str)]);
}

pub type Metrics = Arc<dyn MetricsSink>;

/// Forwards to the `metrics` facade (and from there to Prometheus).
pub struct PrometheusSink;

fn to_labels(labels: &[(&'static str, &str)]) -> Vec<metrics::Label> {
    labels
        .iter()
        .map(|(k, v)| metrics::Label::new(*k, v.to_string()))
        .collect()
}

impl MetricsSink for PrometheusSink {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        metrics::counter!(name, to_labels(labels)).increment(1);
    }

    fn record(&self, name: &'static str, value: f64, labels: &[(&'static str, &str)]) {
        metrics::histogram!(name, to_labels(labels)).record(value);
    }
}

pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}
    fn record(&self, _name: &'static str, _value: f64, _labels: &[(&'static str, &str)]) {}
}

/// Keeps every increment in memory. Handy for asserting on emitted metrics.
#[derive(Default)]
pub struct RecordingSink {
    counters: Mutex<Vec<(&'static str, Vec<(&'static str, String)>)>>,
}

impl RecordingSink {
    pub fn count(&self, name: &str, label: (&str, &str)) -> usize {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters
            .iter()
            .filter(|(n, labels)| {
                *n == name && labels.iter().any(|(k, v)| *k == label.0 && v == label.1)
            })
            .count()
    }
}

impl MetricsSink for RecordingSink {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        let owned = labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name, owned));
    }

    fn record(&self, _name: &'static str, _value: f64, _labels: &[(&'static str, &str)]) {}
}

pub fn noop() -> Metrics {
    Arc::new(NoopSink)
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_counts_by_label() {
        let sink = RecordingSink::default();
        sink.increment(BOOKINGS_TOTAL, &[("outcome", "created")]);
        sink.increment(BOOKINGS_TOTAL, &[("outcome", "created")]);
        sink.increment(BOOKINGS_TOTAL, &[("outcome", "conflict")]);
        assert_eq!(sink.count(BOOKINGS_TOTAL, ("outcome", "created")), 2);
        assert_eq!(sink.count(BOOKINGS_TOTAL, ("outcome", "conflict")), 1);
        assert_eq!(sink.count(PAYMENTS_TOTAL, ("outcome", "created")), 0);
    }
}
