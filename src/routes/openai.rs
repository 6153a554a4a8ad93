use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::Response,
};
use serde_json::Value;
use std::sync::Arc;

use crate::AppState;
use crate::pipeline::{self, GatewayRequest};
use crate::store::Platform;

/// POST /v1/chat/completions — OpenAI surface served by OpenAI accounts.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let auth = match pipeline::authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.to_client_response(),
    };

    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("gpt-4o")
        .to_string();
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let session_hash = pipeline::session_hash_for(&headers, &body);

    pipeline::handle(
        state,
        auth,
        GatewayRequest {
            family: Platform::Openai,
            force_platform: None,
            model,
            body,
            stream,
            session_hash,
        },
    )
    .await
}
