//! Metrics support for the server

use iroh_metrics::core::{Core, Counter, Metric};
use struct_iterable::Iterable;

/// Metrics for nodeatlas
#[derive(Debug, Clone, Iterable)]
#[allow(missing_docs)]
pub struct Metrics {
    pub sync_runs: Counter,
    pub sync_failures: Counter,
    pub sync_nodes_cached: Counter,
    pub sources_discovered: Counter,
    pub tickets_queued: Counter,
    pub tickets_confirmed: Counter,
    pub tickets_expired: Counter,
    pub emails_sent: Counter,
    pub emails_failed: Counter,
    pub nodes_registered: Counter,
    pub nodes_updated: Counter,
    pub http_requests: Counter,
    pub http_requests_success: Counter,
    pub http_requests_error: Counter,
    pub http_requests_duration_ms: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            sync_runs: Counter::new("Number of child map fetches"),
            sync_failures: Counter::new("Number of child map fetches that failed"),
            sync_nodes_cached: Counter::new("Nodes cached from child maps"),
            sources_discovered: Counter::new("Source maps seen for the first time"),
            tickets_queued: Counter::new("Registrations queued for email verification"),
            tickets_confirmed: Counter::new("Registrations confirmed via their token"),
            tickets_expired: Counter::new("Registrations discarded after expiry"),
            emails_sent: Counter::new("Verification emails delivered"),
            emails_failed: Counter::new("Verification emails that failed to send"),
            nodes_registered: Counter::new("Nodes added to the local directory"),
            nodes_updated: Counter::new("Local nodes updated by their owner"),
            http_requests: Counter::new("Number of HTTP requests"),
            http_requests_success: Counter::new("Number of HTTP requests with a 2xx status code"),
            http_requests_error: Counter::new("Number of HTTP requests with a non-2xx status code"),
            http_requests_duration_ms: Counter::new("Total duration of all HTTP requests"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "nodeatlas"
    }
}

/// Init the metrics collection core.
pub fn init_metrics() {
    Core::init(|reg, metrics| {
        metrics.insert(Metrics::new(reg));
    });
}
