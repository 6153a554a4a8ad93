use subtle::ConstantTimeEq;

use crate::db::{self, get_string, opt_i64, opt_string};
use crate::error::GatewayError;
use crate::store::groups::{Group, SubscriptionType};
use crate::store::{User, now_secs};

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub key: String,
    pub group_id: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

impl ApiKey {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// User-chosen key material: 16+ chars from [A-Za-z0-9_-].
pub fn is_valid_key_format(key: &str) -> bool {
    key.len() >= 16
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Binding rule: a subscription group requires subscription coverage (checked
/// by the caller against the user's subscriptions); a standard group requires
/// the user to be allowed and the group to be non-exclusive.
pub fn can_bind_group(user: &User, group: &Group, has_subscription: bool) -> bool {
    match group.subscription_type {
        SubscriptionType::Subscription => has_subscription,
        SubscriptionType::Standard => user.is_group_allowed(&group.id) && !group.is_exclusive,
    }
}

fn row_to_key(row: &turso::Row) -> ApiKey {
    ApiKey {
        id: get_string(row, 0),
        user_id: get_string(row, 1),
        key: get_string(row, 2),
        group_id: opt_string(row, 3),
        status: get_string(row, 4),
        created_at: opt_i64(row, 5).unwrap_or(0),
        last_used_at: opt_i64(row, 6),
    }
}

const KEY_COLUMNS: &str = "id, user_id, key, group_id, status, created_at, last_used_at";

pub struct ApiKeyStore;

impl ApiKeyStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn create(&self, key: &ApiKey) -> Result<(), GatewayError> {
        if !is_valid_key_format(&key.key) {
            return Err(GatewayError::InvalidRequest(
                "API key must be at least 16 chars of [A-Za-z0-9_-]".to_string(),
            ));
        }
        let conn = db::get_conn().await?;
        conn.execute(
            &format!("INSERT INTO api_keys ({KEY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            (
                key.id.as_str(),
                key.user_id.as_str(),
                key.key.as_str(),
                key.group_id.clone(),
                key.status.as_str(),
                now_secs(),
                key.last_used_at,
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create api key: {e}")))?;
        Ok(())
    }

    /// Look up by key material using a constant-time comparison over the
    /// active keys.
    pub async fn validate(&self, key: &str) -> Result<Option<ApiKey>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE status = 'active'"),
                (),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to list api keys: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            let candidate = row_to_key(&row);
            if candidate.key.as_bytes().ct_eq(key.as_bytes()).into() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApiKey>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?"),
                [id],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to get api key: {e}")))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read api key row: {e}")))?
            .map(|row| row_to_key(&row)))
    }

    pub async fn touch_last_used(&self, id: &str) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ? WHERE id = ?",
            (now_secs(), id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to touch api key: {e}")))?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, GatewayError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute("DELETE FROM api_keys WHERE id = ?", [id])
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to delete api key: {e}")))?;
        Ok(affected > 0)
    }
}

impl Default for ApiKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Platform;
    use uuid::Uuid;

    #[test]
    fn key_format_validation() {
        assert!(is_valid_key_format("sk-1234567890abcdef"));
        assert!(is_valid_key_format("abcdefghijklmnop"));
        assert!(!is_valid_key_format("short"));
        assert!(!is_valid_key_format("has spaces in it!"));
    }

    #[test]
    fn binding_rules() {
        let mut user = User {
            id: "u".into(),
            email: "u@example.com".into(),
            role: "user".into(),
            status: "active".into(),
            balance: 0.0,
            concurrency: 0,
            allowed_groups: vec!["std".into()],
            token_version: 0,
            created_at: 0,
        };
        let standard = Group {
            id: "std".into(),
            name: "std".into(),
            platform: Platform::Anthropic,
            rate_multiplier: 1.0,
            is_exclusive: false,
            subscription_type: SubscriptionType::Standard,
            daily_limit_usd: None,
            weekly_limit_usd: None,
            monthly_limit_usd: None,
        };
        assert!(can_bind_group(&user, &standard, false));

        let mut exclusive = standard.clone();
        exclusive.is_exclusive = true;
        assert!(!can_bind_group(&user, &exclusive, false));

        user.allowed_groups.clear();
        assert!(!can_bind_group(&user, &standard, false));

        let sub = Group {
            id: "sub".into(),
            subscription_type: SubscriptionType::Subscription,
            daily_limit_usd: Some(10.0),
            ..standard.clone()
        };
        assert!(can_bind_group(&user, &sub, true));
        assert!(!can_bind_group(&user, &sub, false));
    }

    #[tokio::test]
    async fn validate_finds_active_key_only() {
        crate::db::init_memory().await.unwrap();
        let store = ApiKeyStore::new();
        let material = format!("key_{}", Uuid::new_v4().simple());
        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            user_id: "u1".into(),
            key: material.clone(),
            group_id: None,
            status: "active".into(),
            created_at: 0,
            last_used_at: None,
        };
        store.create(&key).await.unwrap();

        let found = store.validate(&material).await.unwrap().unwrap();
        assert_eq!(found.id, key.id);
        assert!(store.validate("nonexistent-key-material").await.unwrap().is_none());
    }
}
