use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};

use super::{ok_json_response, sse_ok_response};
use crate::error::RelayError;
use crate::protocol::{
    ChatCompletionRequest, ChatCompletionResponse, ResponseChoice, UpstreamRequest, Usage,
    COMPLETION_OBJECT,
};
use crate::state::AppState;
use crate::stream::{aggregate_stream, transcode_stream, AggregatedMessage, ChunkEmitter};
use crate::util::{elapsed_ms, unix_now_secs};

/// `POST /v1/chat/completions`.
pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    match handler_inner(&state, &headers, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handler_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, RelayError> {
    state.authenticate(headers)?;
    let request = parse_request(body)?;

    let directory = state.directory();
    let route = directory
        .resolve(&request.model)
        .ok_or_else(|| RelayError::ModelNotFound(request.model.clone()))?;

    let upstream_body = serde_json::to_vec(&UpstreamRequest::new(
        &request,
        &route.provider,
        &route.name,
    ))
    .map_err(|err| RelayError::Internal(format!("Failed to encode upstream request: {err}")))?;

    let request_seq = state.next_request_seq();
    let request_id = state.request_uuid(request_seq);
    debug!(
        request_seq,
        model = %request.model,
        provider = %route.provider,
        upstream_model = %route.name,
        stream = request.stream,
        "forwarding chat completion"
    );

    let started = Instant::now();
    let response = state
        .transport
        .post_stream(
            &state.config.upstream.chat_url(),
            &state.config.upstream.api_key,
            upstream_body,
        )
        .await?;

    if request.stream {
        let emitter = ChunkEmitter::new(request.model, unix_now_secs(), request_id);
        let body = Body::from_stream(transcode_stream(response.bytes_stream(), emitter));
        return Ok(sse_ok_response(body));
    }

    let AggregatedMessage {
        message,
        finish_reason,
    } = aggregate_stream(response.bytes_stream()).await?;
    info!(
        model = %request.model,
        mode = "buffered",
        finish_reason = %finish_reason,
        elapsed_ms = elapsed_ms(started.elapsed()),
        "completion aggregated"
    );

    let completion = ChatCompletionResponse {
        id: format!("chatcmpl-{}", request_id.simple()),
        object: COMPLETION_OBJECT.to_string(),
        created: unix_now_secs(),
        model: request.model,
        choices: vec![ResponseChoice {
            index: 0,
            message,
            finish_reason,
        }],
        usage: Usage::default(),
    };
    let body = serde_json::to_vec(&completion)
        .map_err(|err| RelayError::Internal(format!("Failed to encode response: {err}")))?;
    Ok(ok_json_response(body.into()))
}

fn parse_request(body: &[u8]) -> Result<ChatCompletionRequest, RelayError> {
    let request: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|err| RelayError::InvalidRequest(format!("Malformed request body: {err}")))?;
    if request.model.trim().is_empty() {
        return Err(RelayError::InvalidRequest("model is required".into()));
    }
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest(
            "messages must not be empty".into(),
        ));
    }
    Ok(request)
}
