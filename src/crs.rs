//! One-shot bulk import of externally managed (CRS) accounts.

use std::path::Path;
use std::sync::Arc;

use chrono::DateTime;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::oauth::Refresher;
use crate::store::{
    Account, AccountStatus, AccountStore, AccountType, Credentials, Platform, ProxyStore,
};

#[derive(Debug, Deserialize)]
pub struct CrsProxy {
    pub protocol: String,
    pub host: String,
    pub port: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_true() -> bool {
    true
}

/// One exported account, as produced by the external CRS.
#[derive(Debug, Deserialize)]
pub struct CrsAccount {
    pub id: String,
    pub platform: String,
    #[serde(rename = "type", default)]
    pub account_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub credentials: Map<String, Value>,
    #[serde(default)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// ISO timestamp; normalized to a unix-seconds string.
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub concurrency: Option<i64>,
    #[serde(default)]
    pub proxy: Option<CrsProxy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportAction {
    Created,
    Updated,
    Skipped,
    Failed,
}

#[derive(Debug)]
pub struct ImportItem {
    pub crs_id: String,
    pub action: ImportAction,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub items: Vec<ImportItem>,
}

impl ImportSummary {
    fn push(&mut self, crs_id: &str, action: ImportAction, error: Option<String>) {
        match action {
            ImportAction::Created => self.created += 1,
            ImportAction::Updated => self.updated += 1,
            ImportAction::Skipped => self.skipped += 1,
            ImportAction::Failed => self.failed += 1,
        }
        self.items.push(ImportItem {
            crs_id: crs_id.to_string(),
            action,
            error,
        });
    }
}

/// Strip a trailing `/v1` (the exporter records full API bases) and
/// normalize through a real URL parse where possible.
pub fn sanitize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    let stripped = trimmed.strip_suffix("/v1").unwrap_or(trimmed);
    match url::Url::parse(stripped) {
        Ok(parsed) => parsed.to_string().trim_end_matches('/').to_string(),
        Err(_) => stripped.to_string(),
    }
}

/// ISO timestamp → unix-seconds string; already-numeric strings pass
/// through.
pub fn normalize_expires_at(raw: &str) -> Option<String> {
    if raw.parse::<i64>().is_ok() {
        return Some(raw.to_string());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp().to_string())
}

pub struct CrsSync {
    accounts: AccountStore,
    proxies: ProxyStore,
    refreshers: Arc<Vec<Refresher>>,
}

impl CrsSync {
    pub fn new(accounts: AccountStore, proxies: ProxyStore, refreshers: Arc<Vec<Refresher>>) -> Self {
        Self {
            accounts,
            proxies,
            refreshers,
        }
    }

    pub async fn import_file(&self, path: &Path) -> Result<ImportSummary, GatewayError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::InvalidRequest(format!("cannot read {path:?}: {e}")))?;
        let batch: Vec<CrsAccount> = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Parse(format!("invalid import file: {e}")))?;
        Ok(self.import(batch).await)
    }

    pub async fn import(&self, batch: Vec<CrsAccount>) -> ImportSummary {
        let mut summary = ImportSummary::default();
        for entry in batch {
            let crs_id = entry.id.clone();
            match self.import_one(entry).await {
                Ok((action, error)) => summary.push(&crs_id, action, error),
                Err(e) => summary.push(&crs_id, ImportAction::Failed, Some(e.to_string())),
            }
        }
        info!(
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "account import finished"
        );
        summary
    }

    async fn import_one(
        &self,
        entry: CrsAccount,
    ) -> Result<(ImportAction, Option<String>), GatewayError> {
        let Some(platform) = Platform::parse(&entry.platform) else {
            return Ok((ImportAction::Skipped, Some(format!("unknown platform '{}'", entry.platform))));
        };
        let account_type = if entry.account_type.is_empty() {
            AccountType::OAuth
        } else {
            match AccountType::parse(&entry.account_type) {
                Some(t) => t,
                None => {
                    return Ok((
                        ImportAction::Skipped,
                        Some(format!("unknown type '{}'", entry.account_type)),
                    ));
                }
            }
        };

        let mut credentials = Credentials::from_json(
            &serde_json::to_string(&Value::Object(entry.credentials)).unwrap_or_default(),
        );
        if let Some(base_url) = &entry.base_url {
            credentials.set("base_url", sanitize_base_url(base_url));
        } else {
            let stored = credentials.get_string("base_url");
            if !stored.is_empty() {
                credentials.set("base_url", sanitize_base_url(&stored));
            }
        }
        let raw_expiry = entry
            .expires_at
            .clone()
            .or_else(|| {
                let stored = credentials.get_string("expires_at");
                if stored.is_empty() { None } else { Some(stored) }
            });
        if let Some(raw) = raw_expiry
            && let Some(normalized) = normalize_expires_at(&raw)
        {
            credentials.set("expires_at", normalized);
        }

        let status = if entry.is_active && entry.status != "error" {
            AccountStatus::Active
        } else {
            AccountStatus::Inactive
        };

        let proxy_id = match &entry.proxy {
            Some(proxy) => Some(
                self.proxies
                    .find_or_create(
                        &proxy.protocol,
                        &proxy.host,
                        proxy.port,
                        &proxy.username,
                        &proxy.password,
                    )
                    .await?
                    .id,
            ),
            None => None,
        };

        let incoming_extra = Credentials::from_json(
            &serde_json::to_string(&Value::Object(entry.extra)).unwrap_or_default(),
        );

        let (account, action) = match self.accounts.get_by_crs_id(&entry.id).await? {
            Some(mut existing) => {
                existing.platform = platform;
                existing.account_type = account_type;
                if !entry.name.is_empty() {
                    existing.name = entry.name.clone();
                }
                existing.credentials = credentials;
                // New extra keys overwrite old ones; everything else stays.
                existing.extra.merge(&incoming_extra);
                existing.proxy_id = proxy_id;
                existing.status = status;
                self.accounts.update_from_crs(&existing).await?;
                (existing, ImportAction::Updated)
            }
            None => {
                let mut account = Account::new(platform, account_type, &entry.name);
                account.credentials = credentials;
                account.extra = incoming_extra;
                account.proxy_id = proxy_id;
                account.status = status;
                account.crs_account_id = Some(entry.id.clone());
                if let Some(priority) = entry.priority {
                    account.priority = priority;
                }
                if let Some(concurrency) = entry.concurrency {
                    account.concurrency = concurrency;
                }
                self.accounts.create(&account).await?;
                (account, ImportAction::Created)
            }
        };

        // OAuth accounts get a synchronous refresh probe so broken refresh
        // tokens surface at import time rather than at first request.
        let mut probe_error = None;
        if account_type == AccountType::OAuth && status == AccountStatus::Active {
            match self.refreshers.iter().find(|r| r.can_refresh(&account)) {
                Some(refresher) => match refresher.refresh(&account).await {
                    Ok(creds) => {
                        self.accounts.update_credentials(&account.id, &creds).await?;
                    }
                    Err(e) => {
                        warn!(crs_id = %entry.id, "refresh probe failed: {e}");
                        self.accounts.set_error(&account.id, &e.to_string()).await?;
                        probe_error = Some(e.to_string());
                    }
                },
                None => probe_error = Some("no refresher matches account".to_string()),
            }
        }

        Ok((action, probe_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_url_sanitizing() {
        assert_eq!(sanitize_base_url("https://api.example.com/v1"), "https://api.example.com");
        assert_eq!(sanitize_base_url("https://api.example.com/v1/"), "https://api.example.com");
        assert_eq!(sanitize_base_url("https://api.example.com"), "https://api.example.com");
        assert_eq!(
            sanitize_base_url("https://api.example.com/custom"),
            "https://api.example.com/custom"
        );
    }

    #[test]
    fn expiry_normalization() {
        assert_eq!(
            normalize_expires_at("2025-01-01T00:00:00Z").as_deref(),
            Some("1735689600")
        );
        assert_eq!(normalize_expires_at("1735689600").as_deref(), Some("1735689600"));
        assert_eq!(normalize_expires_at("not a date"), None);
    }

    fn sync() -> CrsSync {
        CrsSync::new(AccountStore::new(), ProxyStore::new(), Arc::new(Vec::new()))
    }

    fn entry(id: &str) -> CrsAccount {
        serde_json::from_value(json!({
            "id": id,
            "platform": "anthropic",
            "type": "apikey",
            "name": "imported",
            "credentials": {"api_key": "sk-x"},
            "base_url": "https://relay.example.com/v1",
            "is_active": true,
            "status": "ok"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn import_creates_then_updates_by_crs_id() {
        crate::db::init_memory().await.unwrap();
        let sync = sync();
        let id = uuid::Uuid::new_v4().to_string();

        let summary = sync.import(vec![entry(&id)]).await;
        assert_eq!(summary.created, 1);

        let account = AccountStore::new().get_by_crs_id(&id).await.unwrap().unwrap();
        assert_eq!(account.credentials.get_string("base_url"), "https://relay.example.com");

        // Second import with new extra keys updates in place.
        let mut second = entry(&id);
        second.extra = serde_json::from_value(json!({"note": "fresh"})).unwrap();
        let summary = sync.import(vec![second]).await;
        assert_eq!(summary.updated, 1);
        let account = AccountStore::new().get_by_crs_id(&id).await.unwrap().unwrap();
        assert_eq!(account.extra.get_string("note"), "fresh");
    }

    #[tokio::test]
    async fn inactive_and_errored_exports_become_inactive() {
        crate::db::init_memory().await.unwrap();
        let sync = sync();
        let id = uuid::Uuid::new_v4().to_string();
        let mut e = entry(&id);
        e.status = "error".to_string();
        sync.import(vec![e]).await;
        let account = AccountStore::new().get_by_crs_id(&id).await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Inactive);
    }

    #[tokio::test]
    async fn unknown_platform_is_skipped() {
        crate::db::init_memory().await.unwrap();
        let sync = sync();
        let mut e = entry(&uuid::Uuid::new_v4().to_string());
        e.platform = "mystery".to_string();
        let summary = sync.import(vec![e]).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.created, 0);
    }

    #[tokio::test]
    async fn proxy_is_reconciled_by_tuple() {
        crate::db::init_memory().await.unwrap();
        let sync = sync();
        let host = uuid::Uuid::new_v4().to_string();
        let make = |id: &str| {
            let mut e = entry(id);
            e.proxy = Some(CrsProxy {
                protocol: "socks5".into(),
                host: host.clone(),
                port: 1080,
                username: String::new(),
                password: String::new(),
            });
            e
        };
        let a = uuid::Uuid::new_v4().to_string();
        let b = uuid::Uuid::new_v4().to_string();
        sync.import(vec![make(&a), make(&b)]).await;

        let store = AccountStore::new();
        let first = store.get_by_crs_id(&a).await.unwrap().unwrap();
        let second = store.get_by_crs_id(&b).await.unwrap().unwrap();
        assert_eq!(first.proxy_id, second.proxy_id);
        assert!(first.proxy_id.is_some());
    }
}
