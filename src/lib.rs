pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod session;
pub mod state;
pub mod upstream;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use config::{ConfigError, RelayConfig, UpstreamConfig};
use tracing::{info, warn};
use upstream::{mock::MockProvider, openai::OpenAiProvider, UpstreamProvider};

pub fn build_state(config: &RelayConfig) -> Result<state::AppState, ConfigError> {
    let upstream: Option<Arc<dyn UpstreamProvider>> = match &config.upstream {
        UpstreamConfig::OpenAi(settings) => Some(Arc::new(OpenAiProvider::new(settings)?)),
        UpstreamConfig::Mock => Some(Arc::new(MockProvider::named("mock-echo"))),
        UpstreamConfig::Missing => None,
    };

    match &upstream {
        Some(upstream) => info!(
            upstream = upstream.name(),
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "upstream provider configured"
        ),
        None => warn!("no upstream credential configured; requests will report not_configured"),
    }

    Ok(state::AppState::new(upstream, config.idle_timeout))
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route(
            handlers::CHAT_PATH,
            get(handlers::chat_status).post(handlers::complete_chat),
        )
        .route(handlers::STREAM_PATH, post(handlers::stream_chat))
        .with_state(state)
}
