//! Metrics support for the server

use std::sync::Arc;

use iroh_metrics::{Counter, MetricsGroup, MetricsGroupSet};

/// Metrics for the document HTTP API
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "docs")]
pub struct Metrics {
    /// Number of HTTP requests
    pub http_requests: Counter,
    /// Number of HTTP requests with a 2xx status code
    pub http_requests_success: Counter,
    /// Number of HTTP requests with a non-2xx status code
    pub http_requests_error: Counter,
    /// Total duration of all HTTP requests
    pub http_requests_duration_ms: Counter,

    /// Documents created
    pub docs_created: Counter,
    /// Documents written by bulk upserts
    pub docs_upserted: Counter,
    /// Documents fetched
    pub docs_fetched: Counter,
    /// Documents fetched and sent as stored gzip envelopes
    pub docs_fetched_raw: Counter,
    /// Documents replaced
    pub docs_replaced: Counter,
    /// Delete requests, including those for missing documents
    pub docs_deleted: Counter,
    /// Search requests
    pub searches: Counter,
    /// Fetches and replaces of documents that do not exist
    #[metrics(help = "Requests that targeted a missing document.")]
    pub not_found: Counter,
    /// Requests rejected for a missing or wrong secret
    pub forbidden: Counter,
}

/// All metrics tracked by the server.
#[derive(Debug, Default, Clone, MetricsGroupSet)]
#[metrics(name = "docstore")]
pub struct ServerMetrics {
    /// Metrics for the document API.
    pub docs: Arc<Metrics>,
}
