use reqwest::Client;
use serde_json::Value;

use crate::constants::{OPENAI_API_BASE, USER_AGENT};
use crate::error::GatewayError;
use crate::store::Account;
use crate::upstream::claude::send_with_retry;

fn chat_url(account: &Account) -> String {
    let base = account.credentials.get_string("base_url");
    let base = if base.is_empty() {
        OPENAI_API_BASE.to_string()
    } else {
        base
    };
    format!("{}/v1/chat/completions", base.trim_end_matches('/'))
}

/// Forward an OpenAI chat-completions body.
pub async fn forward(
    client: &Client,
    account: &Account,
    token: &str,
    body: &Value,
    stream: bool,
) -> Result<reqwest::Response, GatewayError> {
    let accept = if stream { "text/event-stream" } else { "application/json" };
    let builder = client
        .post(chat_url(account))
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .header("user-agent", USER_AGENT)
        .header("accept", accept)
        .json(body);
    send_with_retry(builder, false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AccountType, Credentials, Platform};

    #[test]
    fn default_base_url_applies() {
        let mut account = Account::new(Platform::Openai, AccountType::ApiKey, "k");
        assert_eq!(chat_url(&account), "https://api.openai.com/v1/chat/completions");

        account.credentials = Credentials::from_json(r#"{"base_url": "https://oai.example.com"}"#);
        assert_eq!(chat_url(&account), "https://oai.example.com/v1/chat/completions");
    }
}
