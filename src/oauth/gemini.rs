use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::GeminiOAuthConfig;
use crate::constants::{
    CLOUD_RESOURCE_MANAGER_URL, CODE_ASSIST_API_BASE, DRIVE_ABOUT_URL, GOOGLE_TOKEN_URL,
};
use crate::error::GatewayError;
use crate::oauth::{TokenRequestBody, apply_expiry, execute_token_refresh, expires_within};
use crate::store::{Account, AccountType, Credentials, Platform};

/// Tier cache lifetime (Google-One inference).
const TIER_CACHE_SECS: i64 = 24 * 3600;

const TIB: i64 = 1024 * 1024 * 1024 * 1024;
const GIB: i64 = 1024 * 1024 * 1024;

/// Infer a Google-One tier from the Drive storage quota limit.
pub fn tier_from_storage_limit(limit_bytes: i64) -> &'static str {
    if limit_bytes > 100 * TIB {
        "google_ai_ultra"
    } else if limit_bytes >= 2 * TIB {
        "google_ai_pro"
    } else if limit_bytes >= 15 * GIB {
        "google_one_free"
    } else {
        "unknown"
    }
}

/// Pick a project id from a Cloud Resource Manager listing, preferring ids
/// that look like companion projects.
pub fn pick_project_id(projects: &[String]) -> Option<String> {
    projects
        .iter()
        .find(|id| id.contains("cloud-ai-companion"))
        .or_else(|| projects.iter().find(|id| id.contains("default")))
        .or_else(|| projects.first())
        .cloned()
}

pub struct GeminiRefresher {
    client: Client,
    config: GeminiOAuthConfig,
}

impl GeminiRefresher {
    pub fn new(client: Client, config: GeminiOAuthConfig) -> Self {
        Self { client, config }
    }

    pub fn can_refresh(&self, account: &Account) -> bool {
        account.platform == Platform::Gemini
            && account.account_type == AccountType::OAuth
            && !account.credentials.get_string("refresh_token").is_empty()
    }

    pub fn needs_refresh(&self, account: &Account, window: Duration) -> bool {
        expires_within(account, window)
    }

    pub async fn refresh(&self, account: &Account) -> Result<Credentials, GatewayError> {
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            (
                "refresh_token".to_string(),
                account.credentials.get_string("refresh_token"),
            ),
            ("client_id".to_string(), self.config.client_id.clone()),
            ("client_secret".to_string(), self.config.client_secret.clone()),
        ];
        if !self.config.scopes.is_empty() {
            form.push(("scope".to_string(), self.config.scopes.clone()));
        }

        let token =
            execute_token_refresh(&self.client, GOOGLE_TOKEN_URL, TokenRequestBody::Form(form))
                .await?;

        let mut creds = account.credentials.clone();
        creds.set("access_token", token.access_token.clone());
        if let Some(refresh) = token.refresh_token {
            creds.set("refresh_token", refresh);
        }
        apply_expiry(&mut creds, token.expires_in);

        // Post-refresh housekeeping: project detection + tier inference.
        if creds.get_string("project_id").is_empty()
            && account.extra.get_bool("auto_detect_project_id")
            && let Some(project_id) = self.detect_project_id(&token.access_token).await
        {
            info!(account_id = %account.id, project_id, "auto-detected project id");
            creds.set("project_id", project_id);
        }

        if account.gemini_oauth_type() == "google_one" {
            self.refresh_tier_if_stale(&mut creds, &token.access_token)
                .await;
        }

        Ok(creds)
    }

    /// Try LoadCodeAssist for a companion project; on failure fall back to a
    /// Cloud Resource Manager project listing.
    async fn detect_project_id(&self, access_token: &str) -> Option<String> {
        match self.load_code_assist(access_token).await {
            Ok(Some(project_id)) => return Some(project_id),
            Ok(None) => debug!("loadCodeAssist returned no companion project"),
            Err(e) => warn!("loadCodeAssist failed: {e}"),
        }

        match self.list_projects(access_token).await {
            Ok(projects) => pick_project_id(&projects),
            Err(e) => {
                warn!("project listing failed: {e}");
                None
            }
        }
    }

    async fn load_code_assist(&self, access_token: &str) -> Result<Option<String>, GatewayError> {
        let response = self
            .client
            .post(format!("{CODE_ASSIST_API_BASE}/v1internal:loadCodeAssist"))
            .bearer_auth(access_token)
            .json(&json!({"metadata": {"pluginType": "GEMINI"}}))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::OAuth(format!(
                "loadCodeAssist returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Parse(format!("loadCodeAssist body: {e}")))?;
        Ok(body
            .get("cloudaicompanionProject")
            .and_then(|p| p.as_str())
            .map(str::to_string))
    }

    async fn list_projects(&self, access_token: &str) -> Result<Vec<String>, GatewayError> {
        let response = self
            .client
            .get(CLOUD_RESOURCE_MANAGER_URL)
            .bearer_auth(access_token)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::OAuth(format!(
                "project listing returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Parse(format!("project listing body: {e}")))?;
        Ok(body
            .get("projects")
            .and_then(|p| p.as_array())
            .map(|projects| {
                projects
                    .iter()
                    .filter_map(|p| p.get("projectId").and_then(|id| id.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Re-infer the Google-One tier from Drive storage when the cached value
    /// is older than 24h.
    async fn refresh_tier_if_stale(&self, creds: &mut Credentials, access_token: &str) {
        let now = Utc::now().timestamp();
        let checked_at = creds
            .get_time("tier_checked_at")
            .map(|t| t.timestamp())
            .unwrap_or(0);
        if now - checked_at < TIER_CACHE_SECS && !creds.get_string("tier_id").is_empty() {
            return;
        }

        match self.drive_storage_limit(access_token).await {
            Ok(limit) => {
                let tier = tier_from_storage_limit(limit);
                debug!(limit, tier, "inferred google-one tier");
                creds.set("tier_id", tier);
                creds.set("tier_checked_at", now.to_string());
            }
            Err(e) => warn!("tier inference failed: {e}"),
        }
    }

    async fn drive_storage_limit(&self, access_token: &str) -> Result<i64, GatewayError> {
        let response = self
            .client
            .get(DRIVE_ABOUT_URL)
            .bearer_auth(access_token)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::OAuth(format!(
                "drive about returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Parse(format!("drive about body: {e}")))?;
        Ok(body
            .get("storageQuota")
            .and_then(|q| q.get("limit"))
            .and_then(|l| l.as_str())
            .and_then(|l| l.parse().ok())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_thresholds() {
        assert_eq!(tier_from_storage_limit(200 * TIB), "google_ai_ultra");
        assert_eq!(tier_from_storage_limit(100 * TIB), "google_ai_pro"); // not strictly greater
        assert_eq!(tier_from_storage_limit(2 * TIB), "google_ai_pro");
        assert_eq!(tier_from_storage_limit(15 * GIB), "google_one_free");
        assert_eq!(tier_from_storage_limit(GIB), "unknown");
    }

    #[test]
    fn project_pick_prefers_companion_then_default() {
        let projects = vec![
            "my-app".to_string(),
            "default-1234".to_string(),
            "cloud-ai-companion-xyz".to_string(),
        ];
        assert_eq!(pick_project_id(&projects).unwrap(), "cloud-ai-companion-xyz");

        let projects = vec!["my-app".to_string(), "default-1234".to_string()];
        assert_eq!(pick_project_id(&projects).unwrap(), "default-1234");

        let projects = vec!["my-app".to_string()];
        assert_eq!(pick_project_id(&projects).unwrap(), "my-app");

        assert!(pick_project_id(&[]).is_none());
    }
}
