use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

use crate::session::SessionStatus;

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    active_sessions: IntGauge,
    sessions_total: IntCounterVec,
    upstream_errors_total: IntCounterVec,
    fragments_forwarded_total: IntCounter,
}

/// Keeps the active-session gauge raised until dropped. Owned, so it can
/// travel into the task that drives a streamed body.
pub struct ActiveSessionGuard {
    gauge: IntGauge,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!("relay_http_requests_total", "Total HTTP requests processed by the relay"),
            &["path", "method", "status"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relay_http_request_duration_seconds",
                "Time until response headers were produced, in seconds",
            ),
            &["path", "method"],
        )
        .expect("valid request_duration_seconds metric");

        let active_sessions = IntGauge::new(
            "relay_active_sessions",
            "Relay sessions currently forwarding fragments",
        )
        .expect("valid active_sessions metric");

        let sessions_total = IntCounterVec::new(
            opts!("relay_sessions_total", "Relay sessions by terminal status"),
            &["status"],
        )
        .expect("valid sessions_total metric");

        let upstream_errors_total = IntCounterVec::new(
            opts!("relay_upstream_errors_total", "Upstream failures by classification"),
            &["kind"],
        )
        .expect("valid upstream_errors_total metric");

        let fragments_forwarded_total = IntCounter::new(
            "relay_fragments_forwarded_total",
            "Fragments delivered to downstream clients",
        )
        .expect("valid fragments_forwarded_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");
        registry
            .register(Box::new(sessions_total.clone()))
            .expect("register sessions_total");
        registry
            .register(Box::new(upstream_errors_total.clone()))
            .expect("register upstream_errors_total");
        registry
            .register(Box::new(fragments_forwarded_total.clone()))
            .expect("register fragments_forwarded_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            active_sessions,
            sessions_total,
            upstream_errors_total,
            fragments_forwarded_total,
        }
    }

    pub fn active_session_guard(&self) -> ActiveSessionGuard {
        self.active_sessions.inc();
        ActiveSessionGuard {
            gauge: self.active_sessions.clone(),
        }
    }

    pub fn observe_request(&self, path: &str, method: &str, status: u16, duration: Duration) {
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_session(&self, status: SessionStatus, fragments: usize) {
        self.sessions_total
            .with_label_values(&[status.as_str()])
            .inc();
        self.fragments_forwarded_total.inc_by(fragments as u64);
    }

    pub fn observe_upstream_error(&self, kind: &str) {
        self.upstream_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
