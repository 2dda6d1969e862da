use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use super::ok_json_response;
use crate::state::AppState;

/// List the directory's models in `OpenAI` format.
#[must_use]
pub async fn handler(State(state): State<Arc<AppState>>, headers: &HeaderMap) -> Response {
    if let Err(err) = state.authenticate(headers) {
        return err.into_response();
    }
    state.maybe_refresh_directory().await;

    ok_json_response(state.directory().models_response_body())
}
