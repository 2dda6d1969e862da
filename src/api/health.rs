use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    let upstream_host = url::Url::parse(&config.upstream.base_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned));
    Json(json!({
        "status": "chat-relay is running",
        "upstream_host": upstream_host,
        "models_count": state.directory().len(),
        "client_keys_count": config.client_authentication.allowed_keys.len(),
    }))
}
