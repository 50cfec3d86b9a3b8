use std::{convert::Infallible, time::Instant};

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderValue,
    },
    response::{IntoResponse, Response},
    Json,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::{
    errors::AppError,
    models::{ChatReply, GenerationRequest, PromptPayload, StatusReport},
    session::{RelaySession, SessionStream},
    state::AppState,
};

pub const STREAM_PATH: &str = "/api/chat/stream";
pub const CHAT_PATH: &str = "/api/chat";

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => {
            warn!(error = %error, "metrics render failed");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "metrics render failed",
            )
                .into_response()
        }
    }
}

pub async fn chat_status(State(state): State<AppState>) -> Json<StatusReport> {
    let upstream = state.upstream().ok().map(|upstream| upstream.name().to_owned());
    Json(StatusReport {
        up: true,
        configured: upstream.is_some(),
        upstream,
    })
}

pub async fn stream_chat(
    State(state): State<AppState>,
    payload: Result<Json<PromptPayload>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let response = match relay_stream(&state, payload).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        STREAM_PATH,
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

pub async fn complete_chat(
    State(state): State<AppState>,
    payload: Result<Json<PromptPayload>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let response = match collect_reply(&state, payload).await {
        Ok(reply) => reply.into_response(),
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        CHAT_PATH,
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn relay_stream(
    state: &AppState,
    payload: Result<Json<PromptPayload>, JsonRejection>,
) -> Result<Response, AppError> {
    let request = parse_payload(payload)?;
    let session = open_session(state, request).await?;

    let SessionStream {
        session_id,
        mut fragments,
        outcome,
        cancel: _,
    } = session.spawn();

    // Settles metrics and hands a failure to the body, even if the client
    // drops the body before the session ends.
    let (failure_tx, failure_rx) = oneshot::channel::<AppError>();
    let metrics = state.metrics.clone();
    let guard = metrics.active_session_guard();
    tokio::spawn(async move {
        let _guard = guard;
        match outcome.await {
            Ok(outcome) => {
                metrics.observe_session(outcome.status, outcome.fragments_forwarded);
                if let Some(failure) = outcome.failure {
                    metrics.observe_upstream_error(failure.kind());
                    let _ = failure_tx.send(failure);
                }
            }
            Err(error) => {
                warn!(session_id = %session_id, error = %error, "relay session task aborted");
                let _ = failure_tx.send(AppError::UpstreamFault(
                    "relay session ended unexpectedly".to_owned(),
                ));
            }
        }
    });

    let body = async_stream::stream! {
        while let Some(fragment) = fragments.recv().await {
            yield Ok::<String, Infallible>(fragment.into_string());
        }
        if let Ok(failure) = failure_rx.await {
            yield Ok::<String, Infallible>(failure.in_band_marker());
        }
    };

    let mut response = (
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id.to_string()) {
        response.headers_mut().insert("x-relay-session", value);
    }
    Ok(response)
}

async fn collect_reply(
    state: &AppState,
    payload: Result<Json<PromptPayload>, JsonRejection>,
) -> Result<Json<ChatReply>, AppError> {
    let request = parse_payload(payload)?.with_chat_defaults();
    let session = open_session(state, request).await?;
    let _guard = state.metrics.active_session_guard();

    let mut stream = session.spawn();
    let mut reply = String::new();
    while let Some(fragment) = stream.fragments.recv().await {
        reply.push_str(fragment.as_str());
    }

    let outcome = stream.outcome.await.map_err(|error| {
        AppError::UpstreamFault(format!("relay session ended unexpectedly: {error}"))
    })?;
    state
        .metrics
        .observe_session(outcome.status, outcome.fragments_forwarded);
    if let Some(failure) = outcome.failure {
        state.metrics.observe_upstream_error(failure.kind());
        return Err(failure);
    }

    Ok(Json(ChatReply::new(reply)))
}

fn parse_payload(
    payload: Result<Json<PromptPayload>, JsonRejection>,
) -> Result<GenerationRequest, AppError> {
    let Json(payload) =
        payload.map_err(|rejection| AppError::InvalidRequest(rejection.body_text()))?;
    payload
        .into_generation_request()
        .map_err(AppError::InvalidRequest)
}

async fn open_session(
    state: &AppState,
    request: GenerationRequest,
) -> Result<RelaySession, AppError> {
    let upstream = state.upstream()?;
    info!(
        request_id = %request.request_id,
        upstream = upstream.name(),
        prompt_chars = request.prompt.chars().count(),
        "relay request accepted"
    );

    RelaySession::open(upstream.as_ref(), request, state.idle_timeout)
        .await
        .inspect_err(|error| state.metrics.observe_upstream_error(error.kind()))
}
