//! Per-request orchestration: billing gate → account selection → slot
//! acquire → upstream forward → rate-limit handling → failover → metering.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    body::Body,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::{FailoverError, GatewayError, map_upstream_error};
use crate::ratelimit::RateLimitAction;
use crate::scheduler::{HolderToken, ScheduleRequest, SlotBroker};
use crate::store::{Account, AccountStore, ApiKey, Group, Platform, UsageRecord, User};
use crate::transforms::{
    claude_sse_passthrough, claude_to_gemini_request, gemini_sse_passthrough,
    gemini_sse_to_claude_sse, gemini_to_claude_response, openai_sse_passthrough,
};
use crate::upstream::{
    self, ForwardResult, Usage, is_failover_status, read_outcome, success_outcome,
    upstream_request_id,
};

/// Authenticated caller identity for one request.
pub struct AuthContext {
    pub user: User,
    pub api_key: ApiKey,
    pub group: Option<Group>,
}

/// Resolve the bearer API key into a user + optional group binding.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, GatewayError> {
    let key = headers
        .get("x-api-key")
        .or_else(|| headers.get("x-goog-api-key"))
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .ok_or(GatewayError::InvalidApiKey)?;

    let api_key = state
        .api_keys
        .validate(key)
        .await?
        .ok_or(GatewayError::InvalidApiKey)?;

    let user = state
        .users
        .get(&api_key.user_id)
        .await?
        .ok_or(GatewayError::UserNotFound)?;
    if !user.is_active() {
        return Err(GatewayError::UserNotFound);
    }

    let group = match &api_key.group_id {
        Some(group_id) => state.groups.get(group_id).await?,
        None => None,
    };

    let _ = state.api_keys.touch_last_used(&api_key.id).await;
    Ok(AuthContext { user, api_key, group })
}

/// One inbound gateway request, already parsed by its route.
pub struct GatewayRequest {
    /// Canonical platform of the route family.
    pub family: Platform,
    pub force_platform: Option<Platform>,
    pub model: String,
    pub body: Value,
    pub stream: bool,
    pub session_hash: String,
}

/// Idempotent releaser for the slots held by one request.
#[derive(Clone)]
struct SlotGuard {
    broker: Arc<SlotBroker>,
    entries: Vec<(String, HolderToken)>,
}

impl SlotGuard {
    async fn release(&self) {
        for (account_id, token) in &self.entries {
            self.broker.release(account_id, *token).await;
        }
    }
}

/// Drive the request through the full pipeline, retrying alternate accounts
/// on failover-worthy upstream failures.
pub async fn handle(state: Arc<AppState>, auth: AuthContext, req: GatewayRequest) -> Response {
    if let Err(e) = state.gate.check(&auth.user, auth.group.as_ref()).await {
        return e.to_client_response();
    }

    let mut excluded: HashSet<String> = HashSet::new();
    let max_rounds = state.config.scheduling.max_failover_attempts + 1;
    let mut last_failover: Option<FailoverError> = None;

    for round in 0..max_rounds {
        let schedule = ScheduleRequest {
            family: Some(req.family),
            force_platform: req.force_platform,
            group_id: auth.api_key.group_id.clone(),
            session_hash: req.session_hash.clone(),
            requested_model: Some(req.model.clone()),
            excluded: excluded.clone(),
        };
        let account = match state.scheduler.select(&schedule).await {
            Ok(account) => account,
            Err(e) => {
                // Selection ran dry: surface the last upstream failure if we
                // had one, otherwise the typed no-accounts error.
                return match last_failover {
                    Some(f) => GatewayError::Failover(f).to_client_response(),
                    None => e.to_client_response(),
                };
            }
        };

        let mut entries = Vec::new();
        if auth.user.concurrency > 0 {
            match state
                .broker
                .acquire(&format!("user:{}", auth.user.id), auth.user.concurrency)
                .await
            {
                Ok((token, _)) => entries.push((format!("user:{}", auth.user.id), token)),
                Err(e) => return e.to_client_response(),
            }
        }
        match state.broker.acquire(&account.id, account.concurrency).await {
            Ok((token, waited)) => {
                debug!(account_id = %account.id, waited, "account slot acquired");
                entries.push((account.id.clone(), token));
            }
            Err(e) => {
                let guard = SlotGuard { broker: state.broker.clone(), entries };
                guard.release().await;
                return e.to_client_response();
            }
        }
        let guard = SlotGuard {
            broker: state.broker.clone(),
            entries,
        };

        match dispatch(state.clone(), &auth, &req, &account, guard.clone()).await {
            Ok(response) => return response,
            Err(DispatchError::Failover(failover)) => {
                guard.release().await;
                warn!(round, account_id = %account.id, "failing over: {failover}");
                excluded.insert(account.id.clone());
                last_failover = Some(failover);
            }
            Err(DispatchError::Fatal(e)) => {
                guard.release().await;
                return e.to_client_response();
            }
        }
    }

    match last_failover {
        Some(f) => GatewayError::Failover(f).to_client_response(),
        None => GatewayError::NoAvailableAccounts {
            model: Some(req.model.clone()),
        }
        .to_client_response(),
    }
}

enum DispatchError {
    /// Try another account.
    Failover(FailoverError),
    /// Return to the client as-is.
    Fatal(GatewayError),
}

async fn dispatch(
    state: Arc<AppState>,
    auth: &AuthContext,
    req: &GatewayRequest,
    account: &Account,
    guard: SlotGuard,
) -> Result<Response, DispatchError> {
    let client = state
        .clients
        .for_proxy(account.proxy_id.as_deref())
        .await
        .map_err(DispatchError::Fatal)?;

    let token = match state.token_cache.get_access_token(account).await {
        Ok(token) => token,
        Err(e) => {
            // Credential trouble on this account: let another one serve.
            return Err(DispatchError::Failover(FailoverError {
                account_id: account.id.clone(),
                status: 0,
                reason: format!("credential unavailable: {e}"),
            }));
        }
    };

    let started = Instant::now();
    let send_result = match (req.family, account.platform) {
        (Platform::Anthropic, Platform::Anthropic) => {
            upstream::claude::forward(&client, account, &token, &req.body, req.stream).await
        }
        (Platform::Anthropic, Platform::Gemini | Platform::Antigravity) => {
            let gemini_body = claude_to_gemini_request(&req.body);
            // Translated requests always stream upstream; non-stream clients
            // get a locally aggregated message.
            upstream::gemini::forward(&client, account, &token, &req.model, &gemini_body, true)
                .await
        }
        (Platform::Gemini, Platform::Gemini | Platform::Antigravity) => {
            let upgrade = upstream::gemini::should_upgrade_stream(account, req.stream);
            upstream::gemini::forward(
                &client,
                account,
                &token,
                &req.model,
                &req.body,
                req.stream || upgrade,
            )
            .await
        }
        (Platform::Openai, Platform::Openai) => {
            upstream::openai::forward(&client, account, &token, &req.body, req.stream).await
        }
        _ => {
            return Err(DispatchError::Fatal(GatewayError::InvalidRequest(format!(
                "account platform {} cannot serve this route",
                account.platform.as_str()
            ))));
        }
    };

    let response = match send_result {
        Ok(response) => response,
        Err(e) => {
            return Err(DispatchError::Failover(FailoverError {
                account_id: account.id.clone(),
                status: 0,
                reason: e.to_string(),
            }));
        }
    };

    if !response.status().is_success() {
        return Err(handle_upstream_failure(&state, account, response).await);
    }

    let _ = state
        .engine
        .handle_success(account, &success_outcome(&response))
        .await;
    let request_id = upstream_request_id(&response);

    let meter_base = MeterContext {
        state: state.clone(),
        account_id: account.id.clone(),
        user_id: auth.user.id.clone(),
        api_key_id: auth.api_key.id.clone(),
        group: auth.group.clone(),
        model: req.model.clone(),
    };

    match (req.family, account.platform) {
        (Platform::Anthropic, Platform::Gemini | Platform::Antigravity) => {
            translated_response(req, response, request_id, meter_base, guard, started).await
        }
        _ if req.stream => {
            streamed_response(req, account, response, request_id, meter_base, guard, started)
        }
        (Platform::Gemini, _) if upstream::gemini::should_upgrade_stream(account, req.stream) => {
            upgraded_gemini_response(response, request_id, meter_base, guard, started).await
        }
        _ => plain_response(response, request_id, meter_base, guard, started).await,
    }
}

/// Feed the failure to the rate-limit engine, schedule deferred recovery,
/// and classify for failover.
async fn handle_upstream_failure(
    state: &Arc<AppState>,
    account: &Account,
    response: reqwest::Response,
) -> DispatchError {
    let outcome = read_outcome(response).await;
    let status = outcome.status;

    let action = match state.engine.handle_upstream_error(account, &outcome).await {
        Ok(action) => action,
        Err(e) => {
            warn!(account_id = %account.id, "rate-limit engine failed: {e}");
            RateLimitAction::Skip
        }
    };
    schedule_recovery(state, &account.id, &action);

    let failover_worthy =
        is_failover_status(status) || matches!(action, RateLimitAction::TempUnschedulable { .. });
    if failover_worthy {
        DispatchError::Failover(FailoverError {
            account_id: account.id.clone(),
            status,
            reason: format!("upstream returned {status}"),
        })
    } else {
        let google_status = serde_json::from_str::<Value>(&outcome.body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("status"))
                    .and_then(|s| s.as_str())
                    .map(str::to_string)
            });
        let (mapped_status, kind, message) = map_upstream_error(status, google_status.as_deref());
        DispatchError::Fatal(GatewayError::Upstream {
            status: mapped_status,
            kind,
            message: message.to_string(),
        })
    }
}

/// Re-activate the account once its skip window elapses. Clears are
/// conditional UPDATEs, so at-least-once firing is safe.
fn schedule_recovery(state: &Arc<AppState>, account_id: &str, action: &RateLimitAction) {
    let accounts = AccountStore::new();
    let id = account_id.to_string();
    match action {
        RateLimitAction::RateLimited { reset_at } => {
            state.deferred.schedule_at(*reset_at + 1, async move {
                let _ = accounts.clear_rate_limit(&id).await;
            });
        }
        RateLimitAction::Overloaded { until } => {
            state.deferred.schedule_at(*until + 1, async move {
                let _ = accounts.clear_overloaded(&id).await;
            });
        }
        RateLimitAction::TempUnschedulable { until } => {
            let redis = state.redis.clone();
            state.deferred.schedule_at(*until + 1, async move {
                let _ = accounts.clear_temp_unschedulable(&id).await;
                redis.clear_temp_unsched(&id).await;
            });
        }
        RateLimitAction::Skip | RateLimitAction::Disabled => {}
    }
}

// ---------------------------------------------------------------------------
// Response construction + metering
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct MeterContext {
    state: Arc<AppState>,
    account_id: String,
    user_id: String,
    api_key_id: String,
    group: Option<Group>,
    model: String,
}

impl MeterContext {
    /// Record usage and debit the user's entitlement. Standard groups scale
    /// cost by their rate multiplier.
    async fn record(&self, result: ForwardResult) {
        let pricing = crate::store::models::get_pricing(&self.model).await;
        let cost_micro = pricing.cost_microdollars(
            result.usage.input_tokens,
            result.usage.output_tokens,
            result.usage.cache_read_input_tokens,
            result.usage.cache_creation_input_tokens,
        );

        let multiplier = self
            .group
            .as_ref()
            .map(|g| if g.rate_multiplier > 0.0 { g.rate_multiplier } else { 1.0 })
            .unwrap_or(1.0);
        let cost_usd = cost_micro as f64 / 1_000_000.0 * multiplier;

        let record = UsageRecord {
            account_id: self.account_id.clone(),
            user_id: self.user_id.clone(),
            api_key_id: self.api_key_id.clone(),
            model: self.model.clone(),
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
            cache_read_tokens: result.usage.cache_read_input_tokens,
            cache_write_tokens: result.usage.cache_creation_input_tokens,
            cost_microdollars: (cost_micro as f64 * multiplier) as i64,
            stream: result.stream,
            duration_ms: result.duration_ms,
            first_token_ms: result.first_token_ms,
        };
        if let Err(e) = self.state.usage_log.insert(&record).await {
            warn!("failed to insert usage record: {e}");
        }

        match &self.group {
            Some(group) if group.is_subscription() => {
                match self
                    .state
                    .billing
                    .get_subscription(&self.user_id, &group.id)
                    .await
                {
                    Ok(Some(sub)) => {
                        self.state
                            .billing
                            .queue_subscription_usage(&sub.id, &self.user_id, &group.id, cost_usd)
                            .await;
                    }
                    Ok(None) => warn!(
                        "no subscription found while metering user {} group {}",
                        self.user_id, group.id
                    ),
                    Err(e) => warn!("subscription lookup failed while metering: {e}"),
                }
            }
            _ => {
                if cost_usd > 0.0 {
                    self.state
                        .billing
                        .queue_deduct_balance(&self.user_id, cost_usd)
                        .await;
                }
            }
        }

        let _ = self.state.accounts.touch_last_used(&self.account_id).await;
    }
}

fn sse_headers(builder: axum::http::response::Builder, request_id: &str) -> axum::http::response::Builder {
    let builder = builder
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no");
    if request_id.is_empty() {
        builder
    } else {
        builder.header("x-request-id", request_id)
    }
}

fn spawn_meter(
    meter: MeterContext,
    guard: SlotGuard,
    rx: oneshot::Receiver<(Usage, Option<i64>)>,
    model: String,
    started: Instant,
    request_id: String,
) {
    tokio::spawn(async move {
        let (usage, first_token_ms) = rx.await.unwrap_or_default();
        meter
            .record(ForwardResult {
                request_id,
                usage,
                model,
                stream: true,
                duration_ms: started.elapsed().as_millis() as i64,
                first_token_ms,
            })
            .await;
        guard.release().await;
    });
}

/// Claude-Messages request served by a Gemini-family account: the upstream
/// response is always an SSE stream here.
async fn translated_response(
    req: &GatewayRequest,
    response: reqwest::Response,
    request_id: String,
    meter: MeterContext,
    guard: SlotGuard,
    started: Instant,
) -> Result<Response, DispatchError> {
    if req.stream {
        let (tx, rx) = oneshot::channel();
        let stream = gemini_sse_to_claude_sse(response.bytes_stream(), req.model.clone(), tx);
        spawn_meter(meter, guard, rx, req.model.clone(), started, request_id.clone());
        return Ok(sse_headers(Response::builder().status(StatusCode::OK), &request_id)
            .body(Body::from_stream(stream))
            .unwrap());
    }

    // Non-streaming client: aggregate the upstream stream locally, then
    // shape it as a Claude message.
    let mut translator = crate::transforms::GeminiStreamTranslator::new(&req.model);
    consume_sse(response, |frame| {
        translator.on_frame(frame);
    })
    .await
    .map_err(DispatchError::Fatal)?;
    translator.finish();

    let message = gemini_to_claude_response(&translator.aggregated_gemini_response(), &req.model);
    let usage = translator.usage();
    meter
        .record(ForwardResult {
            request_id: request_id.clone(),
            usage,
            model: req.model.clone(),
            stream: false,
            duration_ms: started.elapsed().as_millis() as i64,
            first_token_ms: None,
        })
        .await;
    guard.release().await;

    Ok(json_with_request_id(message, &request_id))
}

/// Native streaming passthrough for each family.
fn streamed_response(
    req: &GatewayRequest,
    account: &Account,
    response: reqwest::Response,
    request_id: String,
    meter: MeterContext,
    guard: SlotGuard,
    started: Instant,
) -> Result<Response, DispatchError> {
    let (tx, rx) = oneshot::channel();
    let body = response.bytes_stream();
    type SseStream =
        std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<bytes::Bytes, std::io::Error>> + Send>>;
    let stream: SseStream = match account.platform {
        Platform::Gemini | Platform::Antigravity => Box::pin(gemini_sse_passthrough(body, tx)),
        Platform::Openai => Box::pin(openai_sse_passthrough(body, tx)),
        Platform::Anthropic => Box::pin(claude_sse_passthrough(body, tx)),
    };
    spawn_meter(meter, guard, rx, req.model.clone(), started, request_id.clone());

    Ok(sse_headers(Response::builder().status(StatusCode::OK), &request_id)
        .body(Body::from_stream(stream))
        .unwrap())
}

/// Gemini non-stream request upgraded to upstream streaming: aggregate back
/// into a generateContent response.
async fn upgraded_gemini_response(
    response: reqwest::Response,
    request_id: String,
    meter: MeterContext,
    guard: SlotGuard,
    started: Instant,
) -> Result<Response, DispatchError> {
    let model = meter.model.clone();
    let mut translator = crate::transforms::GeminiStreamTranslator::new(&model);
    consume_sse(response, |frame| {
        translator.on_frame(frame);
    })
    .await
    .map_err(DispatchError::Fatal)?;
    translator.finish();

    let body = translator.aggregated_gemini_response();
    let usage = translator.usage();
    meter
        .record(ForwardResult {
            request_id: request_id.clone(),
            usage,
            model,
            stream: false,
            duration_ms: started.elapsed().as_millis() as i64,
            first_token_ms: None,
        })
        .await;
    guard.release().await;

    Ok(json_with_request_id(body, &request_id))
}

/// Plain JSON passthrough (non-stream Claude / OpenAI / api-key Gemini).
async fn plain_response(
    response: reqwest::Response,
    request_id: String,
    meter: MeterContext,
    guard: SlotGuard,
    started: Instant,
) -> Result<Response, DispatchError> {
    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            guard.release().await;
            return Err(DispatchError::Fatal(GatewayError::Parse(format!(
                "upstream response: {e}"
            ))));
        }
    };

    let body = crate::upstream::gemini::unwrap_code_assist(body);
    let usage = extract_plain_usage(&body);
    meter
        .record(ForwardResult {
            request_id: request_id.clone(),
            usage,
            model: meter.model.clone(),
            stream: false,
            duration_ms: started.elapsed().as_millis() as i64,
            first_token_ms: None,
        })
        .await;
    guard.release().await;

    Ok(json_with_request_id(body, &request_id))
}

/// Usage from any family's non-streaming response body.
fn extract_plain_usage(body: &Value) -> Usage {
    if let Some(usage) = body.get("usage") {
        // Claude and OpenAI shapes share the object name.
        if usage.get("input_tokens").is_some() {
            return Usage::from_claude_json(usage);
        }
        return Usage {
            input_tokens: usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
            output_tokens: usage
                .get("completion_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            ..Default::default()
        };
    }
    if let Some(meta) = body.get("usageMetadata") {
        return Usage {
            input_tokens: meta.get("promptTokenCount").and_then(|v| v.as_i64()).unwrap_or(0),
            output_tokens: meta
                .get("candidatesTokenCount")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            ..Default::default()
        };
    }
    Usage::default()
}

fn json_with_request_id(body: Value, request_id: &str) -> Response {
    let mut response = Json(body).into_response();
    if !request_id.is_empty()
        && let Ok(value) = request_id.parse()
    {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Drain an SSE response, invoking `on_frame` per data frame.
async fn consume_sse(
    response: reqwest::Response,
    mut on_frame: impl FnMut(&Value),
) -> Result<(), GatewayError> {
    use futures_util::StreamExt;

    let mut body = response.bytes_stream();
    let mut buffer = String::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        buffer.push_str(text);
        while let Some(newline_pos) = buffer.find('\n') {
            let line = buffer[..newline_pos].trim().to_string();
            buffer = buffer[newline_pos + 1..].to_string();
            if let Some(data) = line.strip_prefix("data: ")
                && data != "[DONE]"
                && let Ok(frame) = serde_json::from_str::<Value>(data)
            {
                on_frame(&frame);
            }
        }
    }
    Ok(())
}

/// Session hash for affinity: an explicit session header, else a digest of
/// the caller-provided user identifier.
pub fn session_hash_for(headers: &HeaderMap, body: &Value) -> String {
    if let Some(session) = headers.get("x-session-id").and_then(|v| v.to_str().ok()) {
        return session.to_string();
    }
    let user_id = body
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|u| u.as_str())
        .unwrap_or("");
    if user_id.is_empty() {
        return String::new();
    }
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(user_id.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_usage_extraction_across_families() {
        let claude = json!({"usage": {"input_tokens": 5, "output_tokens": 2}});
        assert_eq!(extract_plain_usage(&claude).input_tokens, 5);

        let openai = json!({"usage": {"prompt_tokens": 7, "completion_tokens": 3}});
        let usage = extract_plain_usage(&openai);
        assert_eq!((usage.input_tokens, usage.output_tokens), (7, 3));

        let gemini = json!({"usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 9}});
        assert_eq!(extract_plain_usage(&gemini).output_tokens, 9);

        assert_eq!(extract_plain_usage(&json!({})), Usage::default());
    }

    #[test]
    fn session_hash_prefers_header_then_digests_user_id() {
        let mut headers = HeaderMap::new();
        let body = json!({"metadata": {"user_id": "session-abc"}});

        let from_body = session_hash_for(&headers, &body);
        assert_eq!(from_body.len(), 16);
        // Deterministic.
        assert_eq!(from_body, session_hash_for(&headers, &body));

        headers.insert("x-session-id", "explicit".parse().unwrap());
        assert_eq!(session_hash_for(&headers, &body), "explicit");

        assert_eq!(session_hash_for(&HeaderMap::new(), &json!({})), "");
    }
}
