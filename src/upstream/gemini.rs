use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};

use crate::constants::{CODE_ASSIST_API_BASE, GEMINI_API_BASE, USER_AGENT};
use crate::error::GatewayError;
use crate::store::{Account, AccountType};
use crate::upstream::claude::send_with_retry;

/// Where a Gemini-family request will be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeminiRoute {
    /// generativelanguage API with an api key.
    ApiKey,
    /// generativelanguage API with an OAuth bearer (ai_studio / google_one).
    OauthStudio,
    /// cloudcode Code-Assist API (OAuth code_assist and Antigravity).
    CodeAssist,
}

pub fn route_for(account: &Account) -> GeminiRoute {
    match account.account_type {
        AccountType::ApiKey => GeminiRoute::ApiKey,
        _ => {
            if account.platform == crate::store::Platform::Antigravity {
                return GeminiRoute::CodeAssist;
            }
            match account.gemini_oauth_type().as_str() {
                "ai_studio" | "google_one" => GeminiRoute::OauthStudio,
                _ => GeminiRoute::CodeAssist,
            }
        }
    }
}

/// Non-streaming Code-Assist `generateContent` is upgraded to upstream
/// streaming and aggregated locally (the non-stream endpoint sometimes
/// returns empty content).
pub fn should_upgrade_stream(account: &Account, stream: bool) -> bool {
    !stream && route_for(account) == GeminiRoute::CodeAssist
}

fn studio_url(account: &Account, model: &str, stream: bool) -> String {
    let base = account.credentials.get_string("base_url");
    let base = if base.is_empty() {
        GEMINI_API_BASE.to_string()
    } else {
        base
    };
    let verb = if stream {
        "streamGenerateContent?alt=sse"
    } else {
        "generateContent"
    };
    format!("{}/v1beta/models/{model}:{verb}", base.trim_end_matches('/'))
}

fn code_assist_url(stream: bool) -> String {
    let verb = if stream {
        "streamGenerateContent?alt=sse"
    } else {
        "generateContent"
    };
    format!("{CODE_ASSIST_API_BASE}/v1internal:{verb}")
}

fn base_builder(client: &Client, url: &str, stream: bool) -> RequestBuilder {
    let accept = if stream { "text/event-stream" } else { "application/json" };
    client
        .post(url)
        .header("content-type", "application/json")
        .header("user-agent", USER_AGENT)
        .header("accept", accept)
}

/// Forward a Gemini generateContent body. `stream` is the UPSTREAM streaming
/// mode — callers performing a stream upgrade pass `stream = true` and
/// aggregate. Returns the response; Code-Assist responses arrive wrapped in
/// `{"response": …}`.
pub async fn forward(
    client: &Client,
    account: &Account,
    token: &str,
    model: &str,
    body: &Value,
    stream: bool,
) -> Result<reqwest::Response, GatewayError> {
    match route_for(account) {
        GeminiRoute::ApiKey => {
            let builder = base_builder(client, &studio_url(account, model, stream), stream)
                .header("x-goog-api-key", token)
                .json(body);
            send_with_retry(builder, false).await
        }
        GeminiRoute::OauthStudio => {
            let builder = base_builder(client, &studio_url(account, model, stream), stream)
                .header("authorization", format!("Bearer {token}"))
                .json(body);
            send_with_retry(builder, false).await
        }
        GeminiRoute::CodeAssist => {
            let project = account.credentials.get_string("project_id");
            let wrapped = json!({
                "model": model,
                "project": project,
                "request": body,
            });
            let builder = base_builder(client, &code_assist_url(stream), stream)
                .header("authorization", format!("Bearer {token}"))
                .json(&wrapped);
            // 403s can be transient while Code-Assist provisions the project.
            send_with_retry(builder, true).await
        }
    }
}

/// Unwrap a non-streaming Code-Assist response body.
pub fn unwrap_code_assist(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("response") => {
            map.remove("response").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Credentials, Platform};

    #[test]
    fn routing_by_account_shape() {
        let mut account = Account::new(Platform::Gemini, AccountType::ApiKey, "k");
        assert_eq!(route_for(&account), GeminiRoute::ApiKey);

        account = Account::new(Platform::Gemini, AccountType::OAuth, "o");
        assert_eq!(route_for(&account), GeminiRoute::CodeAssist);

        account.credentials = Credentials::from_json(r#"{"oauth_type": "ai_studio"}"#);
        assert_eq!(route_for(&account), GeminiRoute::OauthStudio);

        account.credentials = Credentials::from_json(r#"{"oauth_type": "google_one"}"#);
        assert_eq!(route_for(&account), GeminiRoute::OauthStudio);

        let antigravity = Account::new(Platform::Antigravity, AccountType::OAuth, "a");
        assert_eq!(route_for(&antigravity), GeminiRoute::CodeAssist);
    }

    #[test]
    fn stream_upgrade_only_for_code_assist_non_stream() {
        let code_assist = Account::new(Platform::Gemini, AccountType::OAuth, "ca");
        assert!(should_upgrade_stream(&code_assist, false));
        assert!(!should_upgrade_stream(&code_assist, true));

        let api_key = Account::new(Platform::Gemini, AccountType::ApiKey, "k");
        assert!(!should_upgrade_stream(&api_key, false));
    }

    #[test]
    fn urls_per_route() {
        let mut account = Account::new(Platform::Gemini, AccountType::ApiKey, "k");
        assert_eq!(
            studio_url(&account, "gemini-2.5-pro", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent"
        );
        assert_eq!(
            studio_url(&account, "gemini-2.5-pro", true),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        account.credentials = Credentials::from_json(r#"{"base_url": "https://alt.example.com/"}"#);
        assert!(studio_url(&account, "m", false).starts_with("https://alt.example.com/v1beta"));

        assert_eq!(
            code_assist_url(true),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn code_assist_unwrap() {
        let wrapped = json!({"response": {"candidates": []}});
        assert_eq!(unwrap_code_assist(wrapped), json!({"candidates": []}));
        let raw = json!({"candidates": [1]});
        assert_eq!(unwrap_code_assist(raw.clone()), raw);
    }
}
