//! Prometheus metrics for the stock reconciliation pipeline.
//!
//! Recorders are zero-sized structs so call sites stay one line. Without an
//! installed exporter the `metrics` macros are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use stocksync_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://0.0.0.0:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter serving `/metrics` over HTTP.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Install the global recorder and start the HTTP listener.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or a recorder is
    /// already installed by someone else.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        if self.started {
            return Ok(());
        }

        register_metrics();

        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        self.started = true;
        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }

    /// Address the exporter listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether [`start`](Self::start) succeeded.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }
}

fn register_metrics() {
    describe_counter!(
        "producer_events_published_total",
        "Events acknowledged by the broker"
    );
    describe_counter!(
        "producer_events_dropped_total",
        "Events dropped because no producer connection was available or the send failed"
    );
    describe_histogram!(
        "producer_publish_duration_seconds",
        "Time from send to flushed acknowledgement"
    );

    describe_counter!(
        "consumer_messages_total",
        "Messages delivered to the sales consumer"
    );
    describe_counter!(
        "consumer_messages_malformed_total",
        "Messages skipped because the envelope could not be decoded"
    );
    describe_counter!(
        "consumer_messages_rolled_back_total",
        "Messages whose stock adjustment was rolled back"
    );
    describe_counter!(
        "consumer_messages_duplicate_total",
        "Messages skipped because the sale was already applied"
    );
    describe_counter!(
        "consumer_receive_errors_total",
        "Transport errors while waiting for messages"
    );
    describe_counter!(
        "consumer_commit_errors_total",
        "Offsets that could not be committed after handling"
    );

    describe_counter!("stock_items_applied_total", "Line items applied to stock");
    describe_counter!(
        "stock_items_skipped_total",
        "Line items skipped (malformed or unknown product)"
    );

    describe_counter!("retry_attempts_total", "Attempts made by retry loops");
    describe_counter!("retry_successes_total", "Operations that succeeded after a retry");
    describe_counter!("retry_exhausted_total", "Retry loops that spent their budget");
}

/// Producer-side metrics recorder.
pub struct ProducerMetrics;

impl ProducerMetrics {
    /// Record an acknowledged publish.
    pub fn record_publish(topic: &str, duration: Duration) {
        counter!("producer_events_published_total", "topic" => topic.to_string()).increment(1);
        histogram!("producer_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a dropped event.
    pub fn record_dropped(topic: &str) {
        counter!("producer_events_dropped_total", "topic" => topic.to_string()).increment(1);
    }
}

/// Consumer-side metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a delivered message.
    pub fn record_consumed() {
        counter!("consumer_messages_total").increment(1);
    }

    /// Record an undecodable message.
    pub fn record_malformed() {
        counter!("consumer_messages_malformed_total").increment(1);
    }

    /// Record a rolled back message.
    pub fn record_rolled_back() {
        counter!("consumer_messages_rolled_back_total").increment(1);
    }

    /// Record a replayed sale.
    pub fn record_duplicate() {
        counter!("consumer_messages_duplicate_total").increment(1);
    }

    /// Record a transport error.
    pub fn record_receive_error() {
        counter!("consumer_receive_errors_total").increment(1);
    }

    /// Record a failed offset commit.
    pub fn record_commit_error() {
        counter!("consumer_commit_errors_total").increment(1);
    }
}

/// Stock adjustment metrics recorder.
pub struct StockMetrics;

impl StockMetrics {
    /// Record committed line items.
    pub fn record_applied(count: usize) {
        counter!("stock_items_applied_total").increment(count as u64);
    }

    /// Record skipped line items.
    pub fn record_skipped(count: usize) {
        counter!("stock_items_skipped_total").increment(count as u64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record an attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a success after at least one retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record an exhausted budget.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_server_starts_unstarted() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(!server.is_started());
        assert_eq!(server.addr(), addr);
    }

    #[test]
    fn recorders_are_noops_without_exporter() {
        ProducerMetrics::record_publish("topic_ventas", Duration::from_millis(5));
        ProducerMetrics::record_dropped("topic_ventas");
        ConsumerMetrics::record_consumed();
        StockMetrics::record_applied(3);
        RetryMetrics::record_exhausted();
    }
}
