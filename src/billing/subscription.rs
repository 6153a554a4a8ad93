//! Subscription lifecycle: assign, extend, revoke, and progress reporting.

use std::sync::Arc;

use uuid::Uuid;

use crate::billing::BillingCache;
use crate::error::GatewayError;
use crate::store::subscriptions::{MAX_EXPIRY_SECS, MAX_VALIDITY_DAYS};
use crate::store::{SubscriptionStore, UserSubscription, now_secs};

/// Aggregate result of a bulk assign.
#[derive(Debug, Default)]
pub struct BulkAssignResult {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<(String, String)>,
}

/// Clamp validity to 36500 days and the resulting expiry to year 2099.
fn clamp_expiry(from: i64, validity_days: i64) -> i64 {
    let days = validity_days.clamp(0, MAX_VALIDITY_DAYS);
    (from + days * 24 * 3600).min(MAX_EXPIRY_SECS)
}

pub struct SubscriptionManager {
    store: SubscriptionStore,
    cache: Arc<BillingCache>,
}

impl SubscriptionManager {
    pub fn new(store: SubscriptionStore, cache: Arc<BillingCache>) -> Self {
        Self { store, cache }
    }

    /// Create a subscription; duplicates are rejected.
    pub async fn assign(
        &self,
        user_id: &str,
        group_id: &str,
        validity_days: i64,
        assigned_by: &str,
        notes: &str,
    ) -> Result<UserSubscription, GatewayError> {
        let now = now_secs();
        let sub = UserSubscription {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
            status: "active".to_string(),
            starts_at: now,
            expires_at: clamp_expiry(now, validity_days),
            daily_window_start: None,
            daily_usage_usd: 0.0,
            weekly_window_start: None,
            weekly_usage_usd: 0.0,
            monthly_window_start: None,
            monthly_usage_usd: 0.0,
            assigned_by: assigned_by.to_string(),
            notes: notes.to_string(),
        };
        self.store.create(&sub).await?;
        self.cache.invalidate_subscription(user_id, group_id).await;
        Ok(sub)
    }

    /// Extend an existing subscription from `max(now, expires_at)`, or assign
    /// a new one. An expired subscription is reactivated with a note.
    pub async fn assign_or_extend(
        &self,
        user_id: &str,
        group_id: &str,
        validity_days: i64,
        assigned_by: &str,
        notes: &str,
    ) -> Result<UserSubscription, GatewayError> {
        let now = now_secs();
        let Some(existing) = self.store.get(user_id, group_id).await? else {
            return self
                .assign(user_id, group_id, validity_days, assigned_by, notes)
                .await;
        };

        let base = existing.expires_at.max(now);
        let new_expiry = clamp_expiry(base, validity_days);

        let (status, notes) = if existing.is_active(now) {
            ("active", existing.notes.clone())
        } else {
            let mut merged = existing.notes.clone();
            if !merged.is_empty() {
                merged.push('\n');
            }
            merged.push_str(&format!("reactivated by {assigned_by}: {notes}"));
            ("active", merged)
        };

        self.store
            .update_expiry(&existing.id, new_expiry, status, &notes)
            .await?;
        self.cache.invalidate_subscription(user_id, group_id).await;

        self.store
            .get(user_id, group_id)
            .await?
            .ok_or(GatewayError::SubscriptionInvalid)
    }

    pub async fn bulk_assign(
        &self,
        user_ids: &[String],
        group_id: &str,
        validity_days: i64,
        assigned_by: &str,
        notes: &str,
    ) -> BulkAssignResult {
        let mut result = BulkAssignResult::default();
        for user_id in user_ids {
            match self
                .assign_or_extend(user_id, group_id, validity_days, assigned_by, notes)
                .await
            {
                Ok(_) => result.success += 1,
                Err(e) => {
                    result.failed += 1;
                    result.errors.push((user_id.clone(), e.to_string()));
                }
            }
        }
        result
    }

    /// Delete the subscription and drop its cache entry.
    pub async fn revoke(&self, user_id: &str, group_id: &str) -> Result<(), GatewayError> {
        if !self.store.delete(user_id, group_id).await? {
            return Err(GatewayError::SubscriptionInvalid);
        }
        self.cache.invalidate_subscription(user_id, group_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::RedisStore;
    use crate::store::UserStore;
    use crate::store::subscriptions::DAILY_PERIOD_SECS;

    fn manager() -> SubscriptionManager {
        let cache = Arc::new(BillingCache::new(
            UserStore::new(),
            SubscriptionStore::new(),
            RedisStore::disabled(),
        ));
        SubscriptionManager::new(SubscriptionStore::new(), cache)
    }

    #[test]
    fn validity_days_clamped_to_cap() {
        let now = 1_700_000_000;
        let capped = clamp_expiry(now, 100_000);
        assert_eq!(capped, (now + MAX_VALIDITY_DAYS * 24 * 3600).min(MAX_EXPIRY_SECS));
        // Year-2099 cap binds for far-future bases.
        assert_eq!(clamp_expiry(MAX_EXPIRY_SECS - 10, 30), MAX_EXPIRY_SECS);
    }

    #[tokio::test]
    async fn assign_rejects_duplicates() {
        crate::db::init_memory().await.unwrap();
        let mgr = manager();
        let user = uuid::Uuid::new_v4().to_string();
        mgr.assign(&user, "g1", 30, "admin", "").await.unwrap();
        let err = mgr.assign(&user, "g1", 30, "admin", "").await.unwrap_err();
        assert_eq!(err.kind(), "SUBSCRIPTION_ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn extend_builds_on_current_expiry() {
        crate::db::init_memory().await.unwrap();
        let mgr = manager();
        let user = uuid::Uuid::new_v4().to_string();
        let sub = mgr.assign(&user, "g1", 30, "admin", "").await.unwrap();

        let extended = mgr
            .assign_or_extend(&user, "g1", 10, "admin", "")
            .await
            .unwrap();
        assert_eq!(extended.expires_at, sub.expires_at + 10 * DAILY_PERIOD_SECS);
        assert_eq!(extended.id, sub.id);
    }

    #[tokio::test]
    async fn expired_subscription_is_reactivated_with_note() {
        crate::db::init_memory().await.unwrap();
        let store = SubscriptionStore::new();
        let mgr = manager();
        let user = uuid::Uuid::new_v4().to_string();

        let sub = mgr.assign(&user, "g1", 1, "admin", "").await.unwrap();
        store
            .update_expiry(&sub.id, now_secs() - 100, "expired", "old note")
            .await
            .unwrap();

        let revived = mgr
            .assign_or_extend(&user, "g1", 7, "admin", "renewal")
            .await
            .unwrap();
        assert_eq!(revived.status, "active");
        assert!(revived.expires_at > now_secs());
        assert!(revived.notes.contains("old note"));
        assert!(revived.notes.contains("reactivated by admin: renewal"));
    }

    #[tokio::test]
    async fn bulk_assign_aggregates_results() {
        crate::db::init_memory().await.unwrap();
        let mgr = manager();
        let users: Vec<String> = (0..3).map(|_| uuid::Uuid::new_v4().to_string()).collect();
        let result = mgr.bulk_assign(&users, "g-bulk", 30, "admin", "").await;
        assert_eq!(result.success, 3);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn revoke_removes_subscription() {
        crate::db::init_memory().await.unwrap();
        let mgr = manager();
        let store = SubscriptionStore::new();
        let user = uuid::Uuid::new_v4().to_string();
        mgr.assign(&user, "g1", 30, "admin", "").await.unwrap();

        mgr.revoke(&user, "g1").await.unwrap();
        assert!(store.get(&user, "g1").await.unwrap().is_none());
        assert!(mgr.revoke(&user, "g1").await.is_err());
    }
}
