use std::{sync::Arc, time::Duration};

use crate::{errors::AppError, metrics::AppMetrics, upstream::UpstreamProvider};

/// Process-wide state, built once at startup and read-only afterwards.
#[derive(Clone)]
pub struct AppState {
    upstream: Option<Arc<dyn UpstreamProvider>>,
    pub idle_timeout: Duration,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new(upstream: Option<Arc<dyn UpstreamProvider>>, idle_timeout: Duration) -> Self {
        Self {
            upstream,
            idle_timeout,
            metrics: Arc::new(AppMetrics::new()),
        }
    }

    pub fn with_upstream<P>(upstream: Arc<P>, idle_timeout: Duration) -> Self
    where
        P: UpstreamProvider + 'static,
    {
        let upstream: Arc<dyn UpstreamProvider> = upstream;
        Self::new(Some(upstream), idle_timeout)
    }

    pub fn unconfigured(idle_timeout: Duration) -> Self {
        Self::new(None, idle_timeout)
    }

    pub fn upstream(&self) -> Result<&Arc<dyn UpstreamProvider>, AppError> {
        self.upstream.as_ref().ok_or(AppError::NotConfigured)
    }
}
