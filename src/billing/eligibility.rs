//! Pre-flight billing gate: decides whether a request may proceed to
//! scheduling, on either the prepaid balance or a subscription window.

use std::sync::Arc;

use tracing::warn;

use crate::billing::BillingCache;
use crate::error::GatewayError;
use crate::store::{Group, User, now_secs};

pub struct BillingGate {
    cache: Arc<BillingCache>,
}

impl BillingGate {
    pub fn new(cache: Arc<BillingCache>) -> Self {
        Self { cache }
    }

    /// Admit or reject the request before account selection.
    ///
    /// Subscription-bound keys check `active ∧ now < expires_at ∧ windows
    /// under limit`. Balance-mode users check `balance > 0`; cache or
    /// database failures there degrade to accept so a billing-tier outage
    /// never browns out the gateway.
    pub async fn check(&self, user: &User, group: Option<&Group>) -> Result<(), GatewayError> {
        match group {
            Some(group) if group.is_subscription() => self.check_subscription(user, group).await,
            _ => self.check_balance(user).await,
        }
    }

    async fn check_subscription(&self, user: &User, group: &Group) -> Result<(), GatewayError> {
        let sub = match self.cache.get_subscription(&user.id, &group.id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => return Err(GatewayError::SubscriptionInvalid),
            Err(e) => {
                warn!("subscription lookup failed for {}: {e}", user.id);
                return Err(GatewayError::SubscriptionInvalid);
            }
        };

        let now = now_secs();
        match sub.status.as_str() {
            "suspended" => return Err(GatewayError::SubscriptionSuspended),
            "expired" => return Err(GatewayError::SubscriptionExpired),
            "active" if now >= sub.expires_at => return Err(GatewayError::SubscriptionExpired),
            "active" => {}
            _ => return Err(GatewayError::SubscriptionInvalid),
        }

        sub.check_usage_limits(group, 0.0, now)
    }

    async fn check_balance(&self, user: &User) -> Result<(), GatewayError> {
        match self.cache.get_user_balance(&user.id).await {
            Ok(balance) if balance > 0.0 => Ok(()),
            Ok(_) => Err(GatewayError::InsufficientBalance),
            Err(GatewayError::UserNotFound) => Err(GatewayError::UserNotFound),
            Err(e) => {
                // Degrade to accept: the cache tier is soft state.
                warn!("balance lookup degraded to accept for {}: {e}", user.id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::RedisStore;
    use crate::store::subscriptions::DAILY_PERIOD_SECS;
    use crate::store::{
        Platform, SubscriptionStore, SubscriptionType, UserStore, UserSubscription,
    };
    use uuid::Uuid;

    fn gate() -> BillingGate {
        BillingGate::new(Arc::new(BillingCache::new(
            UserStore::new(),
            SubscriptionStore::new(),
            RedisStore::disabled(),
        )))
    }

    fn user(balance: f64) -> User {
        User {
            id: Uuid::new_v4().to_string(),
            email: format!("{}@example.com", Uuid::new_v4()),
            role: "user".into(),
            status: "active".into(),
            balance,
            concurrency: 0,
            allowed_groups: Vec::new(),
            token_version: 0,
            created_at: 0,
        }
    }

    fn sub_group(id: &str, daily: f64) -> Group {
        Group {
            id: id.to_string(),
            name: "sub".into(),
            platform: Platform::Anthropic,
            rate_multiplier: 1.0,
            is_exclusive: false,
            subscription_type: SubscriptionType::Subscription,
            daily_limit_usd: Some(daily),
            weekly_limit_usd: None,
            monthly_limit_usd: None,
        }
    }

    #[tokio::test]
    async fn balance_mode_requires_positive_balance() {
        crate::db::init_memory().await.unwrap();
        let users = UserStore::new();
        let rich = user(5.0);
        let broke = user(0.0);
        users.create(&rich).await.unwrap();
        users.create(&broke).await.unwrap();

        let gate = gate();
        assert!(gate.check(&rich, None).await.is_ok());
        let err = gate.check(&broke, None).await.unwrap_err();
        assert_eq!(err.kind(), "INSUFFICIENT_BALANCE");
    }

    #[tokio::test]
    async fn subscription_mode_checks_status_expiry_and_windows() {
        crate::db::init_memory().await.unwrap();
        let subs = SubscriptionStore::new();
        let u = user(0.0); // no balance needed in subscription mode
        UserStore::new().create(&u).await.unwrap();
        let group = sub_group(&Uuid::new_v4().to_string(), 10.0);

        let gate = gate();

        // No subscription at all.
        let err = gate.check(&u, Some(&group)).await.unwrap_err();
        assert_eq!(err.kind(), "SUBSCRIPTION_INVALID");

        let now = now_secs();
        let sub = UserSubscription {
            id: Uuid::new_v4().to_string(),
            user_id: u.id.clone(),
            group_id: group.id.clone(),
            status: "active".into(),
            starts_at: now,
            expires_at: now + 30 * DAILY_PERIOD_SECS,
            daily_window_start: Some(now - 60),
            daily_usage_usd: 9.5,
            weekly_window_start: None,
            weekly_usage_usd: 0.0,
            monthly_window_start: None,
            monthly_usage_usd: 0.0,
            assigned_by: String::new(),
            notes: String::new(),
        };
        subs.create(&sub).await.unwrap();

        // 9.5 of 10 used, additional 0: admitted.
        assert!(gate.check(&u, Some(&group)).await.is_ok());

        // Past the limit: rejected with the daily kind.
        subs.record_usage(&sub.id, 1.0, now).await.unwrap();
        let err = gate.check(&u, Some(&group)).await.unwrap_err();
        assert_eq!(err.kind(), "DAILY_LIMIT_EXCEEDED");

        // Suspension wins over window checks.
        subs.update_expiry(&sub.id, sub.expires_at, "suspended", "")
            .await
            .unwrap();
        let err = gate.check(&u, Some(&group)).await.unwrap_err();
        assert_eq!(err.kind(), "SUBSCRIPTION_SUSPENDED");
    }

    #[tokio::test]
    async fn lapsed_expiry_rejects_even_when_status_active() {
        crate::db::init_memory().await.unwrap();
        let subs = SubscriptionStore::new();
        let u = user(0.0);
        UserStore::new().create(&u).await.unwrap();
        let group = sub_group(&Uuid::new_v4().to_string(), 10.0);

        let now = now_secs();
        let sub = UserSubscription {
            id: Uuid::new_v4().to_string(),
            user_id: u.id.clone(),
            group_id: group.id.clone(),
            status: "active".into(),
            starts_at: now - 100,
            expires_at: now - 1,
            daily_window_start: None,
            daily_usage_usd: 0.0,
            weekly_window_start: None,
            weekly_usage_usd: 0.0,
            monthly_window_start: None,
            monthly_usage_usd: 0.0,
            assigned_by: String::new(),
            notes: String::new(),
        };
        subs.create(&sub).await.unwrap();

        let err = gate().check(&u, Some(&group)).await.unwrap_err();
        assert_eq!(err.kind(), "SUBSCRIPTION_EXPIRED");
    }
}
