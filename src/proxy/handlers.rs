//! HTTP request handlers.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Extension, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::continuation::{relay, Conversation};
use super::encode::{collect_response, sse_body};
use super::server::{AppState, RequestId};
use super::types::{ChatCompletionRequest, ModelList};
use crate::error::Error;

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    payload: std::result::Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let start = std::time::Instant::now();
    let Json(request) = payload.map_err(|rejection| {
        tracing::warn!(request_id = %request_id.0, error = %rejection, "Rejected malformed request body");
        Error::from(rejection)
    })?;
    let is_streaming = request.is_streaming();

    tracing::info!(
        request_id = %request_id.0,
        model = %request.model,
        messages = request.messages.len(),
        stream = is_streaming,
        "Received chat completion request"
    );

    if request.messages.is_empty() {
        tracing::warn!(request_id = %request_id.0, "Rejected request without messages");
        return Err(Error::NoMessages);
    }

    let route = state.router.select(&request.model).map_err(|e| {
        tracing::warn!(request_id = %request_id.0, model = %request.model, "Rejected unsupported model");
        e
    })?;

    let model = request.model;
    let events = relay(
        state.transport.clone(),
        route,
        model.clone(),
        Conversation::new(request.messages),
        state.policy.clone(),
    );

    if is_streaming {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(sse_body(events, model)))
            .map_err(|e| Error::Internal(e.to_string()));
    }

    let response = collect_response(events, &model).await.map_err(|e| {
        tracing::error!(request_id = %request_id.0, error = %e, "Relay failed");
        e
    })?;

    tracing::info!(
        request_id = %request_id.0,
        latency_ms = start.elapsed().as_millis() as u64,
        content_len = response.choices[0].message.content.len(),
        finish_reason = ?response.choices[0].finish_reason,
        "Completed chat completion request"
    );

    Ok(Json(response).into_response())
}

/// Handle GET /v1/models - static model catalog, no upstream call
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ModelList::from_ids(&state.config.catalog.models))
}

/// Handle GET /
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
