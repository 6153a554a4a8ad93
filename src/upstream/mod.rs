//! Upstream forwarders: per-family request building, retry/backoff with
//! jitter, failover classification, and outcome extraction.

pub mod claude;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::constants::ERROR_BODY_LIMIT;
use crate::error::GatewayError;
use crate::ratelimit::UpstreamOutcome;
use crate::store::{Proxy, ProxyStore};

/// Token usage aggregated from one upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
    }

    /// Claude-style usage object: `{input_tokens, output_tokens, ...}`.
    pub fn from_claude_json(value: &serde_json::Value) -> Usage {
        let get = |key: &str| value.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
        Usage {
            input_tokens: get("input_tokens"),
            output_tokens: get("output_tokens"),
            cache_read_input_tokens: get("cache_read_input_tokens"),
            cache_creation_input_tokens: get("cache_creation_input_tokens"),
        }
    }
}

/// What one forwarded request produced, for metering.
#[derive(Debug, Clone, Default)]
pub struct ForwardResult {
    pub request_id: String,
    pub usage: Usage,
    pub model: String,
    pub stream: bool,
    pub duration_ms: i64,
    pub first_token_ms: Option<i64>,
}

/// Statuses that make the scheduler retry with a different account.
pub fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 529) || (500..600).contains(&status)
}

/// Exponential backoff `1s, 2s, 4s, 8s, 16s` with ±20% jitter.
pub fn retry_backoff(attempt: u32) -> Duration {
    let base = (1u64 << attempt.min(4)) as f64;
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_secs_f64(base * jitter)
}

/// Maximum attempts per account before giving up on it.
pub const MAX_ATTEMPTS: u32 = 5;

/// Build an `UpstreamOutcome` from a failed response, capping the body at
/// 64 KiB.
pub async fn read_outcome(response: reqwest::Response) -> UpstreamOutcome {
    let status = response.status().as_u16();
    let unified_reset = response
        .headers()
        .get(crate::constants::RATELIMIT_RESET_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    let window_status = response
        .headers()
        .get(crate::constants::RATELIMIT_5H_STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    let mut cap = body.len().min(ERROR_BODY_LIMIT);
    while !body.is_char_boundary(cap) {
        cap -= 1;
    }
    UpstreamOutcome {
        status,
        unified_reset,
        window_status,
        body: body[..cap].to_string(),
    }
}

/// Success-side outcome (headers only) for the rate-limit engine's window
/// advance.
pub fn success_outcome(response: &reqwest::Response) -> UpstreamOutcome {
    UpstreamOutcome {
        status: response.status().as_u16(),
        unified_reset: response
            .headers()
            .get(crate::constants::RATELIMIT_RESET_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok()),
        window_status: response
            .headers()
            .get(crate::constants::RATELIMIT_5H_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: String::new(),
    }
}

/// Request id from the upstream response headers.
pub fn upstream_request_id(response: &reqwest::Response) -> String {
    for header in ["x-request-id", "x-goog-request-id"] {
        if let Some(id) = response.headers().get(header).and_then(|v| v.to_str().ok()) {
            return id.to_string();
        }
    }
    String::new()
}

/// Per-proxy HTTP clients with pooled connections. Accounts without a proxy
/// share the default client.
pub struct UpstreamClients {
    proxies: ProxyStore,
    clients: Mutex<HashMap<String, Client>>,
    default_client: Client,
}

impl UpstreamClients {
    pub fn new(default_client: Client) -> Self {
        Self {
            proxies: ProxyStore::new(),
            clients: Mutex::new(HashMap::new()),
            default_client,
        }
    }

    pub async fn for_proxy(&self, proxy_id: Option<&str>) -> Result<Client, GatewayError> {
        let Some(proxy_id) = proxy_id else {
            return Ok(self.default_client.clone());
        };

        {
            let clients = self.clients.lock().await;
            if let Some(client) = clients.get(proxy_id) {
                return Ok(client.clone());
            }
        }

        let Some(proxy) = self.proxies.get(proxy_id).await? else {
            tracing::warn!("proxy {proxy_id} not found; using direct client");
            return Ok(self.default_client.clone());
        };
        let client = build_proxy_client(&proxy)?;
        self.clients
            .lock()
            .await
            .insert(proxy_id.to_string(), client.clone());
        Ok(client)
    }
}

fn build_proxy_client(proxy: &Proxy) -> Result<Client, GatewayError> {
    let upstream_proxy = ReqwestProxy::all(proxy.url())
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid proxy url: {e}")))?;
    Client::builder()
        .proxy(upstream_proxy)
        .timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .build()
        .map_err(|e| GatewayError::Database(format!("failed to build proxy client: {e}")))
}
