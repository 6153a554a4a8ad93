use std::time::Duration;

use reqwest::Client;
use serde_json::json;

use crate::constants::{ANTHROPIC_CLIENT_ID, ANTHROPIC_TOKEN_URL};
use crate::error::GatewayError;
use crate::oauth::{TokenRequestBody, apply_expiry, execute_token_refresh, expires_within};
use crate::store::{Account, AccountType, Credentials, Platform};

pub struct ClaudeRefresher {
    client: Client,
}

impl ClaudeRefresher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn can_refresh(&self, account: &Account) -> bool {
        account.platform == Platform::Anthropic
            && account.account_type == AccountType::OAuth
            && !account.credentials.get_string("refresh_token").is_empty()
    }

    pub fn needs_refresh(&self, account: &Account, window: Duration) -> bool {
        expires_within(account, window)
    }

    pub async fn refresh(&self, account: &Account) -> Result<Credentials, GatewayError> {
        let refresh_token = account.credentials.get_string("refresh_token");
        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": ANTHROPIC_CLIENT_ID,
        });

        let token = execute_token_refresh(
            &self.client,
            ANTHROPIC_TOKEN_URL,
            TokenRequestBody::Json(body),
        )
        .await?;

        let mut creds = account.credentials.clone();
        creds.set("access_token", token.access_token);
        if let Some(refresh) = token.refresh_token {
            creds.set("refresh_token", refresh);
        }
        apply_expiry(&mut creds, token.expires_in);
        Ok(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_matches_anthropic_oauth_with_refresh_token() {
        let refresher = ClaudeRefresher::new(Client::new());

        let mut account = Account::new(Platform::Anthropic, AccountType::OAuth, "c");
        assert!(!refresher.can_refresh(&account));

        account.credentials = Credentials::from_json(r#"{"refresh_token": "r"}"#);
        assert!(refresher.can_refresh(&account));

        account.account_type = AccountType::ApiKey;
        assert!(!refresher.can_refresh(&account));

        let mut gemini = Account::new(Platform::Gemini, AccountType::OAuth, "g");
        gemini.credentials = Credentials::from_json(r#"{"refresh_token": "r"}"#);
        assert!(!refresher.can_refresh(&gemini));
    }
}
