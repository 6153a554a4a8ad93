use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::sync::Arc;

use crate::AppState;
use crate::pipeline::{self, GatewayRequest};
use crate::store::Platform;

/// POST /v1/messages — Claude-Messages surface, served by Anthropic accounts
/// (or, via /antigravity, translated onto Gemini-protocol accounts).
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    messages_inner(state, headers, body, None).await
}

/// POST /antigravity/v1/messages — same surface, platform pinned.
pub async fn messages_antigravity(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    messages_inner(state, headers, body, Some(Platform::Antigravity)).await
}

async fn messages_inner(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Value,
    force_platform: Option<Platform>,
) -> Response {
    let auth = match pipeline::authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.to_client_response(),
    };

    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("claude-sonnet-4-5")
        .to_string();
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let session_hash = pipeline::session_hash_for(&headers, &body);

    pipeline::handle(
        state,
        auth,
        GatewayRequest {
            family: Platform::Anthropic,
            force_platform,
            model,
            body,
            stream,
            session_hash,
        },
    )
    .await
}

/// POST /v1/messages/count_tokens — non-streaming passthrough to an
/// Anthropic account, outside the metering path.
pub async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let auth = match pipeline::authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.to_client_response(),
    };
    if let Err(e) = state.gate.check(&auth.user, auth.group.as_ref()).await {
        return e.to_client_response();
    }

    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("claude-sonnet-4-5")
        .to_string();
    let schedule = crate::scheduler::ScheduleRequest {
        family: Some(Platform::Anthropic),
        group_id: auth.api_key.group_id.clone(),
        requested_model: Some(model),
        ..Default::default()
    };
    let account = match state.scheduler.select(&schedule).await {
        Ok(account) => account,
        Err(e) => return e.to_client_response(),
    };
    let client = match state.clients.for_proxy(account.proxy_id.as_deref()).await {
        Ok(client) => client,
        Err(e) => return e.to_client_response(),
    };
    let token = match state.token_cache.get_access_token(&account).await {
        Ok(token) => token,
        Err(e) => return e.to_client_response(),
    };

    let response =
        match crate::upstream::claude::count_tokens(&client, &account, &token, &body).await {
            Ok(response) => response,
            Err(e) => return e.to_client_response(),
        };
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let (mapped, kind, message) = crate::error::map_upstream_error(status, None);
        return crate::error::GatewayError::Upstream {
            status: mapped,
            kind,
            message: message.to_string(),
        }
        .to_client_response();
    }

    match response.json::<Value>().await {
        Ok(body) => Json(body).into_response(),
        Err(e) => crate::error::GatewayError::Parse(format!("count_tokens response: {e}"))
            .to_client_response(),
    }
}
