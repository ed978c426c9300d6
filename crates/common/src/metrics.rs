//! Prometheus request metrics for the gateway data plane.

use anyhow::{Context, Result};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};
use std::time::Duration;

/// Metrics collector for the request lifecycle.
pub struct RequestMetrics {
    /// Request duration histogram by API
    request_duration: HistogramVec,
    /// Request count by API, method and status class
    request_count: IntCounterVec,
    /// Requests terminated before upstream dispatch, by reason
    blocked_count: IntCounterVec,
    /// Circuit breaker transitions by API and event
    breaker_events: IntCounterVec,
    /// Response cache events (hit/miss/store)
    cache_events: IntCounterVec,
    /// Quota trigger events by threshold
    quota_triggers: IntCounterVec,
    /// Currently active requests
    active_requests: IntGauge,
}

impl RequestMetrics {
    /// Create the collector and register with the default Prometheus registry.
    pub fn new() -> Result<Self> {
        let request_duration = register_histogram_vec!(
            "gantry_request_duration_seconds",
            "Request duration by API",
            &["api_id"]
        )
        .context("Failed to register request_duration metric")?;

        let request_count = register_int_counter_vec!(
            "gantry_requests_total",
            "Total requests by API, method and status",
            &["api_id", "method", "status"]
        )
        .context("Failed to register request_count metric")?;

        let blocked_count = register_int_counter_vec!(
            "gantry_blocked_requests_total",
            "Requests terminated by the pipeline, by reason",
            &["reason"]
        )
        .context("Failed to register blocked_count metric")?;

        let breaker_events = register_int_counter_vec!(
            "gantry_breaker_events_total",
            "Circuit breaker transitions",
            &["api_id", "event"]
        )
        .context("Failed to register breaker_events metric")?;

        let cache_events = register_int_counter_vec!(
            "gantry_cache_events_total",
            "Response cache events",
            &["event"]
        )
        .context("Failed to register cache_events metric")?;

        let quota_triggers = register_int_counter_vec!(
            "gantry_quota_triggers_total",
            "Quota threshold triggers",
            &["api_id", "threshold"]
        )
        .context("Failed to register quota_triggers metric")?;

        let active_requests = register_int_gauge!(
            "gantry_active_requests",
            "Currently active requests"
        )
        .context("Failed to register active_requests metric")?;

        Ok(Self {
            request_duration,
            request_count,
            blocked_count,
            breaker_events,
            cache_events,
            quota_triggers,
            active_requests,
        })
    }

    pub fn record_request(&self, api_id: &str, method: &str, status: u16, duration: Duration) {
        self.request_duration
            .with_label_values(&[api_id])
            .observe(duration.as_secs_f64());
        self.request_count
            .with_label_values(&[api_id, method, &status.to_string()])
            .inc();
    }

    pub fn record_blocked(&self, reason: &str) {
        self.blocked_count.with_label_values(&[reason]).inc();
    }

    pub fn record_breaker_event(&self, api_id: &str, event: &str) {
        self.breaker_events
            .with_label_values(&[api_id, event])
            .inc();
    }

    pub fn record_cache_event(&self, event: &str) {
        self.cache_events.with_label_values(&[event]).inc();
    }

    pub fn record_quota_trigger(&self, api_id: &str, threshold: f64) {
        self.quota_triggers
            .with_label_values(&[api_id, &format!("{}", threshold)])
            .inc();
    }

    pub fn inc_active(&self) {
        self.active_requests.inc();
    }

    pub fn dec_active(&self) {
        self.active_requests.dec();
    }
}
