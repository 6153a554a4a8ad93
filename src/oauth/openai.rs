use std::time::Duration;

use reqwest::Client;

use crate::constants::OPENAI_TOKEN_URL;
use crate::error::GatewayError;
use crate::oauth::{TokenRequestBody, apply_expiry, execute_token_refresh, expires_within};
use crate::store::{Account, AccountType, Credentials, Platform};

pub struct OpenaiRefresher {
    client: Client,
}

impl OpenaiRefresher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn can_refresh(&self, account: &Account) -> bool {
        account.platform == Platform::Openai
            && account.account_type == AccountType::OAuth
            && !account.credentials.get_string("refresh_token").is_empty()
    }

    pub fn needs_refresh(&self, account: &Account, window: Duration) -> bool {
        expires_within(account, window)
    }

    pub async fn refresh(&self, account: &Account) -> Result<Credentials, GatewayError> {
        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            (
                "refresh_token".to_string(),
                account.credentials.get_string("refresh_token"),
            ),
            (
                "client_id".to_string(),
                account.credentials.get_string("client_id"),
            ),
        ];

        let token =
            execute_token_refresh(&self.client, OPENAI_TOKEN_URL, TokenRequestBody::Form(form))
                .await?;

        let mut creds = account.credentials.clone();
        creds.set("access_token", token.access_token);
        if let Some(refresh) = token.refresh_token {
            creds.set("refresh_token", refresh);
        }
        creds.set(
            "token_type",
            token.token_type.unwrap_or_else(|| "Bearer".to_string()),
        );
        apply_expiry(&mut creds, token.expires_in);
        Ok(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_matches_openai_oauth() {
        let refresher = OpenaiRefresher::new(Client::new());
        let mut account = Account::new(Platform::Openai, AccountType::OAuth, "o");
        account.credentials = Credentials::from_json(r#"{"refresh_token": "r"}"#);
        assert!(refresher.can_refresh(&account));

        account.account_type = AccountType::ApiKey;
        assert!(!refresher.can_refresh(&account));
    }
}
