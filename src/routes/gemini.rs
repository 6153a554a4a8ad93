use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
};
use serde_json::Value;
use std::sync::Arc;

use crate::AppState;
use crate::error::GatewayError;
use crate::pipeline::{self, GatewayRequest};
use crate::store::Platform;

/// Verbs accepted on /v1beta/models/{model}:{verb}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeminiVerb {
    Generate,
    StreamGenerate,
    CountTokens,
}

/// Split "gemini-2.5-pro:streamGenerateContent" into model + verb.
pub fn parse_model_action(path: &str) -> Result<(String, GeminiVerb), GatewayError> {
    let (model, verb) = path
        .split_once(':')
        .ok_or_else(|| GatewayError::InvalidRequest(format!("missing action in '{path}'")))?;
    let verb = match verb {
        "generateContent" => GeminiVerb::Generate,
        "streamGenerateContent" => GeminiVerb::StreamGenerate,
        "countTokens" => GeminiVerb::CountTokens,
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "unsupported action '{other}'"
            )));
        }
    };
    if model.is_empty() {
        return Err(GatewayError::InvalidRequest("missing model".to_string()));
    }
    Ok((model.to_string(), verb))
}

/// POST /v1beta/models/{model}:{verb} — native Gemini surface.
pub async fn model_action(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, model_action, headers, body, None).await
}

/// POST /antigravity/v1beta/models/{model}:{verb} — platform pinned.
pub async fn model_action_antigravity(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, model_action, headers, body, Some(Platform::Antigravity)).await
}

async fn dispatch(
    state: Arc<AppState>,
    model_action: String,
    headers: HeaderMap,
    body: Value,
    force_platform: Option<Platform>,
) -> Response {
    let (model, verb) = match parse_model_action(&model_action) {
        Ok(parsed) => parsed,
        Err(e) => return e.to_client_response(),
    };

    let auth = match pipeline::authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.to_client_response(),
    };

    if verb == GeminiVerb::CountTokens {
        return count_tokens(state, auth, model, body, force_platform).await;
    }

    let stream = verb == GeminiVerb::StreamGenerate;
    let session_hash = pipeline::session_hash_for(&headers, &body);

    pipeline::handle(
        state,
        auth,
        GatewayRequest {
            family: Platform::Gemini,
            force_platform,
            model,
            body,
            stream,
            session_hash,
        },
    )
    .await
}

/// countTokens is forwarded outside the metering path.
async fn count_tokens(
    state: Arc<AppState>,
    auth: pipeline::AuthContext,
    model: String,
    body: Value,
    force_platform: Option<Platform>,
) -> Response {
    use axum::response::IntoResponse;

    if let Err(e) = state.gate.check(&auth.user, auth.group.as_ref()).await {
        return e.to_client_response();
    }

    let schedule = crate::scheduler::ScheduleRequest {
        family: Some(Platform::Gemini),
        force_platform,
        group_id: auth.api_key.group_id.clone(),
        requested_model: Some(model.clone()),
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

    let url = format!(
        "{}/v1beta/models/{model}:countTokens",
        crate::constants::GEMINI_API_BASE
    );
    let builder = match account.account_type {
        crate::store::AccountType::ApiKey => client.post(&url).header("x-goog-api-key", token),
        _ => client.post(&url).header("authorization", format!("Bearer {token}")),
    };
    let response = match builder.json(&body).send().await {
        Ok(response) => response,
        Err(e) => return GatewayError::Network(e).to_client_response(),
    };
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let (mapped, kind, message) = crate::error::map_upstream_error(status, None);
        return GatewayError::Upstream {
            status: mapped,
            kind,
            message: message.to_string(),
        }
        .to_client_response();
    }
    match response.json::<Value>().await {
        Ok(body) => Json(body).into_response(),
        Err(e) => GatewayError::Parse(format!("countTokens response: {e}")).to_client_response(),
    }
}
