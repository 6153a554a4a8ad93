//! Per-platform OAuth token refresh.
//!
//! A refresher is a capability `{can_refresh, needs_refresh, refresh}`;
//! platform instances are registered in a priority list and dispatched by
//! first match. The driver walks active accounts on a ticker and refreshes
//! those entering the pre-expiry window.

pub mod antigravity;
pub mod claude;
pub mod gemini;
pub mod openai;
pub mod token_cache;

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{GeminiOAuthConfig, TokenRefreshConfig};
use crate::error::GatewayError;
use crate::store::{Account, AccountStore, Credentials};

pub use token_cache::AccessTokenCache;

/// Refresh attempts inside one `refresh()` call.
const REFRESH_ATTEMPTS: u32 = 4;

/// Backoff cap between attempts.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// OAuth failures that no retry will fix.
const NON_RETRYABLE: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "access_denied",
];

/// Margin subtracted from upstream `expires_in` when storing `expires_at`.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// Floor: a successful refresh always yields at least this much validity.
const EXPIRY_FLOOR_SECS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Store `expires_at = now + expires_in − 300s`, floored at `now + 30s` so a
/// short `expires_in` can never produce a past timestamp.
pub fn apply_expiry(creds: &mut Credentials, expires_in: i64) {
    let now = Utc::now().timestamp();
    let at = (now + expires_in - EXPIRY_MARGIN_SECS).max(now + EXPIRY_FLOOR_SECS);
    creds.set("expires_at", at.to_string());
}

pub(crate) enum TokenRequestBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// POST a token request with exponential backoff (1s, 2s, 4s, capped 30s).
/// Errors carrying a non-retryable OAuth code short-circuit the loop.
pub(crate) async fn execute_token_refresh(
    client: &Client,
    url: &str,
    body: TokenRequestBody,
) -> Result<TokenResponse, GatewayError> {
    let mut delay = Duration::from_secs(1);
    let mut last_err = String::new();

    for attempt in 1..=REFRESH_ATTEMPTS {
        let request = client.post(url);
        let request = match &body {
            TokenRequestBody::Json(v) => request.json(v),
            TokenRequestBody::Form(fields) => request.form(fields),
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                return response
                    .json::<TokenResponse>()
                    .await
                    .map_err(|e| GatewayError::OAuth(format!("bad token response: {e}")));
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                if NON_RETRYABLE.iter().any(|code| text.contains(code)) {
                    return Err(GatewayError::OAuth(format!(
                        "token refresh rejected ({status}): {text}"
                    )));
                }
                last_err = format!("token refresh failed ({status}): {text}");
            }
            Err(e) => {
                last_err = format!("token refresh transport error: {e}");
            }
        }

        if attempt < REFRESH_ATTEMPTS {
            warn!("{last_err}; retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(BACKOFF_CAP);
        }
    }

    Err(GatewayError::OAuth(last_err))
}

/// Default `needs_refresh`: the stored expiry is inside the window.
pub(crate) fn expires_within(account: &Account, window: Duration) -> bool {
    match account.credentials.get_time("expires_at") {
        Some(at) => at - Utc::now() < chrono::Duration::from_std(window).unwrap_or_default(),
        // No expiry recorded: treat as due so the first refresh stamps one.
        None => !account.credentials.get_string("refresh_token").is_empty(),
    }
}

/// Platform refreshers behind one dispatchable type.
pub enum Refresher {
    Claude(claude::ClaudeRefresher),
    Openai(openai::OpenaiRefresher),
    Gemini(gemini::GeminiRefresher),
    Antigravity(antigravity::AntigravityRefresher),
}

impl Refresher {
    pub fn name(&self) -> &'static str {
        match self {
            Refresher::Claude(_) => "claude",
            Refresher::Openai(_) => "openai",
            Refresher::Gemini(_) => "gemini",
            Refresher::Antigravity(_) => "antigravity",
        }
    }

    pub fn can_refresh(&self, account: &Account) -> bool {
        match self {
            Refresher::Claude(r) => r.can_refresh(account),
            Refresher::Openai(r) => r.can_refresh(account),
            Refresher::Gemini(r) => r.can_refresh(account),
            Refresher::Antigravity(r) => r.can_refresh(account),
        }
    }

    pub fn needs_refresh(&self, account: &Account, window: Duration) -> bool {
        match self {
            Refresher::Claude(r) => r.needs_refresh(account, window),
            Refresher::Openai(r) => r.needs_refresh(account, window),
            Refresher::Gemini(r) => r.needs_refresh(account, window),
            Refresher::Antigravity(r) => r.needs_refresh(account, window),
        }
    }

    /// Mint fresh credentials for the account. The returned bag is a full
    /// replacement (refreshers merge into a copy of the current bag).
    pub async fn refresh(&self, account: &Account) -> Result<Credentials, GatewayError> {
        match self {
            Refresher::Claude(r) => r.refresh(account).await,
            Refresher::Openai(r) => r.refresh(account).await,
            Refresher::Gemini(r) => r.refresh(account).await,
            Refresher::Antigravity(r) => r.refresh(account).await,
        }
    }
}

/// Build the refresher priority list. Antigravity precedes Gemini so its
/// accounts never fall through to the generic Google handling.
pub fn build_refreshers(client: Client, gemini: GeminiOAuthConfig) -> Vec<Refresher> {
    vec![
        Refresher::Claude(claude::ClaudeRefresher::new(client.clone())),
        Refresher::Openai(openai::OpenaiRefresher::new(client.clone())),
        Refresher::Antigravity(antigravity::AntigravityRefresher::new(
            client.clone(),
            gemini.clone(),
        )),
        Refresher::Gemini(gemini::GeminiRefresher::new(client, gemini)),
    ]
}

/// Periodic driver: refreshes tokens entering the pre-expiry window.
pub struct RefreshDriver {
    accounts: AccountStore,
    refreshers: Vec<Refresher>,
    config: TokenRefreshConfig,
}

impl RefreshDriver {
    pub fn new(
        accounts: AccountStore,
        refreshers: Vec<Refresher>,
        config: TokenRefreshConfig,
    ) -> Self {
        Self {
            accounts,
            refreshers,
            config,
        }
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("token refresh driver disabled");
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.check_interval_minutes.max(1) * 60,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("token refresh driver stopped");
    }

    async fn tick(&self) {
        let accounts = match self.accounts.list_active().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("refresh driver failed to list accounts: {e}");
                return;
            }
        };

        let window = Duration::from_secs(self.config.refresh_before_expiry_hours * 3600);
        for account in accounts {
            let Some(refresher) = self.refreshers.iter().find(|r| r.can_refresh(&account)) else {
                continue;
            };
            if !refresher.needs_refresh(&account, window) {
                continue;
            }
            self.refresh_account(refresher, &account).await;
        }
    }

    /// Drive one account's refresh with the configured retry budget. The
    /// account goes to `status = error` only after every retry is spent.
    async fn refresh_account(&self, refresher: &Refresher, account: &Account) {
        let mut delay = Duration::from_secs(self.config.retry_backoff_seconds.max(1));
        let mut last_err = String::new();

        for attempt in 1..=self.config.max_retries.max(1) {
            match refresher.refresh(account).await {
                Ok(credentials) => {
                    if let Err(e) = self
                        .accounts
                        .update_credentials(&account.id, &credentials)
                        .await
                    {
                        error!(account_id = %account.id, "failed to persist refreshed credentials: {e}");
                    } else {
                        info!(
                            account_id = %account.id,
                            refresher = refresher.name(),
                            "token refreshed"
                        );
                    }
                    return;
                }
                Err(e) => {
                    last_err = e.to_string();
                    warn!(
                        account_id = %account.id,
                        attempt,
                        "token refresh attempt failed: {last_err}"
                    );
                    if attempt < self.config.max_retries.max(1) {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(BACKOFF_CAP);
                    }
                }
            }
        }

        error!(account_id = %account.id, "token refresh exhausted retries; marking account errored");
        if let Err(e) = self.accounts.set_error(&account.id, &last_err).await {
            error!(account_id = %account.id, "failed to mark account errored: {e}");
        }
    }
}
