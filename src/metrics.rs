//! Prometheus metrics for submissions and job monitoring.
//!
//! Metrics are registered once with [`init_metrics`]. Until then every
//! `record_*` function is a no-op, so library users who never initialize
//! metrics pay nothing for them.

use std::sync::OnceLock;

use prometheus::{Counter, CounterVec, Encoder, Opts, Registry, TextEncoder};

/// Global Prometheus registry for all shard-launch metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Job submissions, labeled by result (submitted, failed, invalid).
pub static SUBMISSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Status queries issued by completion monitors.
pub static STATUS_QUERIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Failed status/log queries that were skipped, labeled by query kind.
pub static TRANSIENT_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Log bytes delivered to watchers.
pub static LOG_BYTES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Finished watches, labeled by outcome.
pub static OUTCOMES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is harmless; later calls keep the metrics
/// registered by the first.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric cannot be created or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let submissions_total = CounterVec::new(
        Opts::new("shard_launch_submissions_total", "Job submissions by result"),
        &["result"],
    )?;
    let status_queries_total = Counter::new(
        "shard_launch_status_queries_total",
        "Status queries issued by completion monitors",
    )?;
    let transient_errors_total = CounterVec::new(
        Opts::new(
            "shard_launch_transient_errors_total",
            "Backend queries that failed and were retried on the next tick",
        ),
        &["query"],
    )?;
    let log_bytes_total = Counter::new(
        "shard_launch_log_bytes_total",
        "Log bytes delivered to watchers",
    )?;
    let outcomes_total = CounterVec::new(
        Opts::new("shard_launch_outcomes_total", "Finished watches by outcome"),
        &["outcome"],
    )?;

    registry.register(Box::new(submissions_total.clone()))?;
    registry.register(Box::new(status_queries_total.clone()))?;
    registry.register(Box::new(transient_errors_total.clone()))?;
    registry.register(Box::new(log_bytes_total.clone()))?;
    registry.register(Box::new(outcomes_total.clone()))?;

    // Another thread may have won the race; its metrics stay in place.
    let _ = SUBMISSIONS_TOTAL.set(submissions_total);
    let _ = STATUS_QUERIES_TOTAL.set(status_queries_total);
    let _ = TRANSIENT_ERRORS_TOTAL.set(transient_errors_total);
    let _ = LOG_BYTES_TOTAL.set(log_bytes_total);
    let _ = OUTCOMES_TOTAL.set(outcomes_total);
    let _ = REGISTRY.set(registry);

    Ok(())
}

/// Export all metrics in the Prometheus text format.
///
/// Returns an empty string if metrics were never initialized.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_submission(result: &str) {
    if let Some(counter) = SUBMISSIONS_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

pub fn record_status_query() {
    if let Some(counter) = STATUS_QUERIES_TOTAL.get() {
        counter.inc();
    }
}

pub fn record_transient_error(query: &str) {
    if let Some(counter) = TRANSIENT_ERRORS_TOTAL.get() {
        counter.with_label_values(&[query]).inc();
    }
}

pub fn record_log_bytes(bytes: u64) {
    if let Some(counter) = LOG_BYTES_TOTAL.get() {
        counter.inc_by(bytes as f64);
    }
}

pub fn record_outcome(outcome: &str) {
    if let Some(counter) = OUTCOMES_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_export() {
        init_metrics().expect("metrics should initialize");
        init_metrics().expect("second init is a no-op");

        record_submission("submitted");
        record_status_query();
        record_transient_error("logs");
        record_log_bytes(128);
        record_outcome("success");

        let text = export_metrics();
        assert!(text.contains("shard_launch_submissions_total"));
        assert!(text.contains("result=\"submitted\""));
        assert!(text.contains("shard_launch_log_bytes_total"));
        assert!(text.contains("outcome=\"success\""));
    }
}
