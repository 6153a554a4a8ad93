use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::Client;
use serde_json::Value;
use uuid::Uuid;

use crate::config::GeminiOAuthConfig;
use crate::constants::GOOGLE_TOKEN_URL;
use crate::error::GatewayError;
use crate::oauth::{TokenRequestBody, apply_expiry, execute_token_refresh, expires_within};
use crate::store::{Account, AccountType, Credentials, Platform};

/// Antigravity upstream hands out ~55-minute tokens; the refresh window is
/// pinned to 15 minutes regardless of configuration.
const PINNED_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Best-effort email extraction from an id_token's JWT payload. The token is
/// not verified — only decoded for display metadata.
pub fn email_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("email")?.as_str().map(str::to_string)
}

pub struct AntigravityRefresher {
    client: Client,
    config: GeminiOAuthConfig,
}

impl AntigravityRefresher {
    pub fn new(client: Client, config: GeminiOAuthConfig) -> Self {
        Self { client, config }
    }

    pub fn can_refresh(&self, account: &Account) -> bool {
        account.platform == Platform::Antigravity
            && account.account_type == AccountType::OAuth
            && !account.credentials.get_string("refresh_token").is_empty()
    }

    pub fn needs_refresh(&self, account: &Account, _window: Duration) -> bool {
        expires_within(account, PINNED_WINDOW)
    }

    pub async fn refresh(&self, account: &Account) -> Result<Credentials, GatewayError> {
        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            (
                "refresh_token".to_string(),
                account.credentials.get_string("refresh_token"),
            ),
            ("client_id".to_string(), self.config.client_id.clone()),
            ("client_secret".to_string(), self.config.client_secret.clone()),
        ];

        let token =
            execute_token_refresh(&self.client, GOOGLE_TOKEN_URL, TokenRequestBody::Form(form))
                .await?;

        let mut creds = account.credentials.clone();
        creds.set("access_token", token.access_token);
        if let Some(refresh) = token.refresh_token {
            creds.set("refresh_token", refresh);
        }
        apply_expiry(&mut creds, token.expires_in);

        if creds.get_string("project_id").is_empty() {
            creds.set("project_id", Uuid::new_v4().to_string());
        }
        if creds.get_string("email").is_empty()
            && let Some(email) = token.id_token.as_deref().and_then(email_from_id_token)
        {
            creds.set("email", email);
        }

        Ok(creds)
    }
}
