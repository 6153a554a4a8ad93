//! Hot-path access-token reads: Redis cache in front of the credential bag,
//! with a distributed lock serializing refreshes across replicas.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::oauth::Refresher;
use crate::redis::RedisStore;
use crate::store::{Account, AccountStore, AccountType};

/// A token this close to expiry is refreshed instead of served.
const EXPIRY_SKEW_SECS: i64 = 300;

/// Floor on the cache TTL.
const MIN_CACHE_TTL: Duration = Duration::from_secs(60);

pub struct AccessTokenCache {
    accounts: AccountStore,
    redis: RedisStore,
    refreshers: Arc<Vec<Refresher>>,
}

impl AccessTokenCache {
    pub fn new(accounts: AccountStore, redis: RedisStore, refreshers: Arc<Vec<Refresher>>) -> Self {
        Self {
            accounts,
            redis,
            refreshers,
        }
    }

    fn cache_key(account_id: &str) -> String {
        format!("token:{account_id}")
    }

    /// TTL = max(1m, time_until_expiry − 5m).
    fn cache_ttl(expires_at: i64, now: i64) -> Duration {
        let secs = (expires_at - now - EXPIRY_SKEW_SECS).max(MIN_CACHE_TTL.as_secs() as i64);
        Duration::from_secs(secs as u64)
    }

    /// The bearer credential for one upstream call. Static key material is
    /// returned directly; OAuth tokens go through the cache + refresh lock.
    pub async fn get_access_token(&self, account: &Account) -> Result<String, GatewayError> {
        match account.account_type {
            AccountType::ApiKey => {
                let key = account.credentials.get_string("api_key");
                if key.is_empty() {
                    return Err(GatewayError::OAuth(format!(
                        "account {} has no api_key credential",
                        account.id
                    )));
                }
                return Ok(key);
            }
            AccountType::SetupToken => {
                let token = account.credentials.get_string("access_token");
                if token.is_empty() {
                    return Err(GatewayError::OAuth(format!(
                        "account {} has no access_token credential",
                        account.id
                    )));
                }
                return Ok(token);
            }
            AccountType::OAuth => {}
        }

        let cache_key = Self::cache_key(&account.id);
        if let Some(token) = self.redis.cache_get(&cache_key).await {
            return Ok(token);
        }

        let now = Utc::now().timestamp();
        if let Some(token) = usable_token(account, now) {
            let expires_at = account
                .credentials
                .get_time("expires_at")
                .map(|t| t.timestamp())
                .unwrap_or(now);
            self.redis
                .cache_set(&cache_key, &token, Self::cache_ttl(expires_at, now))
                .await;
            return Ok(token);
        }

        // Expiring or expired: serialize the refresh across replicas. The
        // refresh grant only ever runs with the lock held — providers may
        // rotate the refresh token on use, so concurrent refreshes can
        // invalidate each other.
        if !self.redis.acquire_refresh_lock(&cache_key).await {
            return self.wait_for_lock_holder(account, &cache_key).await;
        }

        let result = self.refresh_under_lock(account, &cache_key).await;
        self.redis.release_refresh_lock(&cache_key).await;
        result
    }

    /// Another replica holds the refresh lock. Wait for its refresh to land
    /// in the cache or the account row (bounded, within the lock's 30s TTL);
    /// if the holder is slow, serve the current token as-is rather than
    /// refreshing without the lock.
    async fn wait_for_lock_holder(
        &self,
        account: &Account,
        cache_key: &str,
    ) -> Result<String, GatewayError> {
        const WAIT_ATTEMPTS: u32 = 6;
        for _ in 0..WAIT_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(500)).await;

            if let Some(token) = self.redis.cache_get(cache_key).await {
                return Ok(token);
            }

            let current = self
                .accounts
                .get(&account.id)
                .await?
                .ok_or(GatewayError::AccountNotFound)?;
            let now = Utc::now().timestamp();
            if let Some(token) = usable_token(&current, now) {
                let expires_at = current
                    .credentials
                    .get_time("expires_at")
                    .map(|t| t.timestamp())
                    .unwrap_or(now);
                self.redis
                    .cache_set(cache_key, &token, Self::cache_ttl(expires_at, now))
                    .await;
                return Ok(token);
            }
        }

        let token = account.credentials.get_string("access_token");
        if token.is_empty() {
            return Err(GatewayError::OAuth(format!(
                "refresh lock contention on account {} with no usable token",
                account.id
            )));
        }
        warn!(
            account_id = %account.id,
            "refresh lock held elsewhere; serving current token near expiry"
        );
        Ok(token)
    }

    async fn refresh_under_lock(
        &self,
        account: &Account,
        cache_key: &str,
    ) -> Result<String, GatewayError> {
        // Re-read after taking the lock: the token may already be fresh.
        let current = self
            .accounts
            .get(&account.id)
            .await?
            .ok_or(GatewayError::AccountNotFound)?;
        let now = Utc::now().timestamp();
        if let Some(token) = usable_token(&current, now) {
            debug!(account_id = %account.id, "token already refreshed by another holder");
            let expires_at = current
                .credentials
                .get_time("expires_at")
                .map(|t| t.timestamp())
                .unwrap_or(now);
            self.redis
                .cache_set(cache_key, &token, Self::cache_ttl(expires_at, now))
                .await;
            return Ok(token);
        }

        let Some(refresher) = self.refreshers.iter().find(|r| r.can_refresh(&current)) else {
            // No refresher and no validity window left: serve what we have.
            let token = current.credentials.get_string("access_token");
            if token.is_empty() {
                return Err(GatewayError::OAuth(format!(
                    "no refresher matches account {}",
                    current.id
                )));
            }
            warn!(account_id = %current.id, "serving unrefreshable token past its window");
            return Ok(token);
        };

        let creds = refresher.refresh(&current).await?;
        self.accounts.update_credentials(&current.id, &creds).await?;

        let token = creds.get_string("access_token");
        let expires_at = creds
            .get_time("expires_at")
            .map(|t| t.timestamp())
            .unwrap_or(now);
        self.redis
            .cache_set(cache_key, &token, Self::cache_ttl(expires_at, now))
            .await;
        Ok(token)
    }
}

/// The stored access token, when it is still outside the expiry skew.
fn usable_token(account: &Account, now: i64) -> Option<String> {
    let token = account.credentials.get_string("access_token");
    if token.is_empty() {
        return None;
    }
    let expires_at = account.credentials.get_time("expires_at")?.timestamp();
    if expires_at - now > EXPIRY_SKEW_SECS {
        Some(token)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Credentials, Platform};

    #[test]
    fn cache_ttl_floors_at_one_minute() {
        let now = 1_000_000;
        assert_eq!(
            AccessTokenCache::cache_ttl(now + 10, now),
            Duration::from_secs(60)
        );
        assert_eq!(
            AccessTokenCache::cache_ttl(now + 3600, now),
            Duration::from_secs(3300)
        );
    }

    #[test]
    fn usable_token_respects_skew() {
        let now = Utc::now().timestamp();
        let mut account = Account::new(Platform::Anthropic, AccountType::OAuth, "t");
        let mut creds = Credentials::new();
        creds.set("access_token", "tok");
        creds.set("expires_at", (now + 3600).to_string());
        account.credentials = creds;
        assert_eq!(usable_token(&account, now).as_deref(), Some("tok"));

        let mut creds = account.credentials.clone();
        creds.set("expires_at", (now + 100).to_string());
        account.credentials = creds;
        assert_eq!(usable_token(&account, now), None);
    }

    #[tokio::test]
    async fn static_key_material_bypasses_cache() {
        crate::db::init_memory().await.unwrap();
        let cache = AccessTokenCache::new(
            AccountStore::new(),
            RedisStore::disabled(),
            Arc::new(Vec::new()),
        );

        let mut account = Account::new(Platform::Openai, AccountType::ApiKey, "k");
        account.credentials = Credentials::from_json(r#"{"api_key": "sk-test"}"#);
        assert_eq!(cache.get_access_token(&account).await.unwrap(), "sk-test");

        let mut setup = Account::new(Platform::Anthropic, AccountType::SetupToken, "s");
        setup.credentials = Credentials::from_json(r#"{"access_token": "st-test"}"#);
        assert_eq!(cache.get_access_token(&setup).await.unwrap(), "st-test");
    }

    #[tokio::test]
    async fn fresh_oauth_token_served_without_refresher() {
        crate::db::init_memory().await.unwrap();
        let store = AccountStore::new();
        let mut account = Account::new(Platform::Anthropic, AccountType::OAuth, "fresh");
        let now = Utc::now().timestamp();
        account.credentials = Credentials::from_json(&format!(
            r#"{{"access_token": "tok", "refresh_token": "r", "expires_at": "{}"}}"#,
            now + 3600
        ));
        store.create(&account).await.unwrap();

        let cache = AccessTokenCache::new(
            AccountStore::new(),
            RedisStore::disabled(),
            Arc::new(Vec::new()),
        );
        assert_eq!(cache.get_access_token(&account).await.unwrap(), "tok");
    }
}
