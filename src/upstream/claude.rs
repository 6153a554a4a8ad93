use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::warn;

use crate::constants::{
    ANTHROPIC_API_URL, ANTHROPIC_COUNT_TOKENS_URL, ANTHROPIC_VERSION, OAUTH_BETA_HEADER, USER_AGENT,
};
use crate::error::GatewayError;
use crate::store::{Account, AccountType};
use crate::upstream::{MAX_ATTEMPTS, retry_backoff};

/// Whether this attempt's status should be retried on the same account.
/// 403 retries are opt-in (Code-Assist provisioning) and never apply when
/// the response demands a scope we cannot acquire.
pub(crate) fn should_retry_status(status: u16, retry_403: bool, www_authenticate: Option<&str>) -> bool {
    match status {
        429 | 529 => true,
        403 => retry_403 && !www_authenticate.is_some_and(|v| v.contains("insufficient_scope")),
        s if (500..600).contains(&s) => true,
        _ => false,
    }
}

/// Send with up to five attempts and jittered exponential backoff. Transport
/// errors and retryable statuses retry; everything else returns the response
/// for the caller to classify.
pub(crate) async fn send_with_retry(
    builder: RequestBuilder,
    retry_403: bool,
) -> Result<reqwest::Response, GatewayError> {
    let mut last_response: Option<reqwest::Response> = None;

    for attempt in 0..MAX_ATTEMPTS {
        let Some(this_attempt) = builder.try_clone() else {
            // Streaming request bodies cannot be cloned; single shot.
            return Ok(builder.send().await?);
        };

        match this_attempt.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    return Ok(response);
                }
                let www_authenticate = response
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                if !should_retry_status(status, retry_403, www_authenticate.as_deref()) {
                    return Ok(response);
                }
                last_response = Some(response);
            }
            Err(e) => {
                if attempt + 1 == MAX_ATTEMPTS {
                    return Err(GatewayError::Network(e));
                }
                warn!("upstream transport error (attempt {}): {e}", attempt + 1);
            }
        }

        if attempt + 1 < MAX_ATTEMPTS {
            tokio::time::sleep(retry_backoff(attempt)).await;
        }
    }

    last_response.ok_or_else(|| GatewayError::Timeout("upstream retries exhausted".to_string()))
}

/// Messages endpoint for the account, honoring a credential `base_url`.
fn messages_url(account: &Account, count_tokens: bool) -> String {
    let base = account.credentials.get_string("base_url");
    if base.is_empty() {
        if count_tokens {
            ANTHROPIC_COUNT_TOKENS_URL.to_string()
        } else {
            ANTHROPIC_API_URL.to_string()
        }
    } else {
        let trimmed = base.trim_end_matches('/');
        if count_tokens {
            format!("{trimmed}/v1/messages/count_tokens")
        } else {
            format!("{trimmed}/v1/messages")
        }
    }
}

fn build_request(
    client: &Client,
    account: &Account,
    token: &str,
    url: &str,
    stream: bool,
) -> RequestBuilder {
    let accept = if stream { "text/event-stream" } else { "application/json" };
    let builder = client
        .post(url)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("content-type", "application/json")
        .header("user-agent", USER_AGENT)
        .header("accept", accept);

    match account.account_type {
        AccountType::ApiKey => builder.header("x-api-key", token),
        _ => builder
            .header("authorization", format!("Bearer {token}"))
            .header("anthropic-beta", OAUTH_BETA_HEADER),
    }
}

/// Forward a Claude-Messages body to an Anthropic account.
pub async fn forward(
    client: &Client,
    account: &Account,
    token: &str,
    body: &Value,
    stream: bool,
) -> Result<reqwest::Response, GatewayError> {
    let url = messages_url(account, false);
    let builder = build_request(client, account, token, &url, stream).json(body);
    send_with_retry(builder, false).await
}

/// Forward a count_tokens body (never streaming).
pub async fn count_tokens(
    client: &Client,
    account: &Account,
    token: &str,
    body: &Value,
) -> Result<reqwest::Response, GatewayError> {
    let url = messages_url(account, true);
    let builder = build_request(client, account, token, &url, false).json(body);
    send_with_retry(builder, false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Credentials, Platform};

    #[test]
    fn retry_policy_statuses() {
        assert!(should_retry_status(429, false, None));
        assert!(should_retry_status(529, false, None));
        assert!(should_retry_status(500, false, None));
        assert!(should_retry_status(503, false, None));
        assert!(!should_retry_status(401, false, None));
        assert!(!should_retry_status(400, false, None));

        // 403 retries only when opted in, and never for insufficient_scope.
        assert!(!should_retry_status(403, false, None));
        assert!(should_retry_status(403, true, None));
        assert!(!should_retry_status(
            403,
            true,
            Some(r#"Bearer error="insufficient_scope""#)
        ));
    }

    #[test]
    fn base_url_override() {
        let mut account = Account::new(Platform::Anthropic, AccountType::OAuth, "u");
        assert_eq!(messages_url(&account, false), ANTHROPIC_API_URL);
        assert_eq!(messages_url(&account, true), ANTHROPIC_COUNT_TOKENS_URL);

        account.credentials =
            Credentials::from_json(r#"{"base_url": "https://relay.example.com/"}"#);
        assert_eq!(
            messages_url(&account, false),
            "https://relay.example.com/v1/messages"
        );
        assert_eq!(
            messages_url(&account, true),
            "https://relay.example.com/v1/messages/count_tokens"
        );
    }
}
