//! Redeem-code application: claims a code atomically and applies its
//! entitlement to the user.

use std::sync::Arc;

use tracing::info;

use crate::billing::{BillingCache, SubscriptionManager};
use crate::error::GatewayError;
use crate::store::{RedeemCode, RedeemStore, UserStore};

pub struct RedeemService {
    codes: RedeemStore,
    users: UserStore,
    subscriptions: Arc<SubscriptionManager>,
    cache: Arc<BillingCache>,
}

impl RedeemService {
    pub fn new(
        codes: RedeemStore,
        users: UserStore,
        subscriptions: Arc<SubscriptionManager>,
        cache: Arc<BillingCache>,
    ) -> Self {
        Self {
            codes,
            users,
            subscriptions,
            cache,
        }
    }

    /// Claim `code` for `user_id` and apply its value. The claim itself is
    /// the at-most-once step; applying the entitlement afterwards is safe
    /// because the code can never be claimed again.
    pub async fn redeem(&self, user_id: &str, code: &str) -> Result<RedeemCode, GatewayError> {
        if self.users.get(user_id).await?.is_none() {
            return Err(GatewayError::UserNotFound);
        }

        let claimed = self.codes.claim(code, user_id).await?;
        match claimed.code_type.as_str() {
            "balance" => {
                self.users.credit_balance(user_id, claimed.value).await?;
                self.cache.invalidate_user(user_id).await;
            }
            // Adjustments may be negative.
            "adjustment" => {
                self.users.credit_balance(user_id, claimed.value).await?;
                self.cache.invalidate_user(user_id).await;
            }
            "concurrency" => {
                self.users
                    .add_concurrency(user_id, claimed.value as i64)
                    .await?;
            }
            "subscription" => {
                let Some(group_id) = &claimed.group_id else {
                    return Err(GatewayError::InvalidRequest(
                        "subscription code has no group".to_string(),
                    ));
                };
                self.subscriptions
                    .assign_or_extend(user_id, group_id, claimed.validity_days, "redeem", code)
                    .await?;
            }
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unknown code type '{other}'"
                )));
            }
        }

        info!(user_id, code_type = %claimed.code_type, "redeem code applied");
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::RedisStore;
    use crate::store::{SubscriptionStore, User};
    use uuid::Uuid;

    fn service() -> RedeemService {
        let cache = Arc::new(BillingCache::new(
            UserStore::new(),
            SubscriptionStore::new(),
            RedisStore::disabled(),
        ));
        let manager = Arc::new(SubscriptionManager::new(
            SubscriptionStore::new(),
            cache.clone(),
        ));
        RedeemService::new(RedeemStore::new(), UserStore::new(), manager, cache)
    }

    async fn make_user() -> User {
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: format!("{}@example.com", Uuid::new_v4()),
            role: "user".into(),
            status: "active".into(),
            balance: 1.0,
            concurrency: 2,
            allowed_groups: Vec::new(),
            token_version: 0,
            created_at: 0,
        };
        UserStore::new().create(&user).await.unwrap();
        user
    }

    fn code(code_type: &str, value: f64) -> RedeemCode {
        RedeemCode {
            code: Uuid::new_v4().to_string(),
            code_type: code_type.into(),
            value,
            status: "unused".into(),
            group_id: None,
            validity_days: 0,
            used_by: None,
            used_at: None,
        }
    }

    #[tokio::test]
    async fn balance_code_credits_once() {
        crate::db::init_memory().await.unwrap();
        let service = service();
        let user = make_user().await;
        let c = code("balance", 25.0);
        service.codes.create(&c).await.unwrap();

        service.redeem(&user.id, &c.code).await.unwrap();
        let loaded = UserStore::new().get(&user.id).await.unwrap().unwrap();
        assert!((loaded.balance - 26.0).abs() < 1e-9);

        let err = service.redeem(&user.id, &c.code).await.unwrap_err();
        assert_eq!(err.kind(), "REDEEM_CODE_USED");
        // Balance unchanged by the rejected second attempt.
        let loaded = UserStore::new().get(&user.id).await.unwrap().unwrap();
        assert!((loaded.balance - 26.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn concurrency_and_subscription_codes_apply() {
        crate::db::init_memory().await.unwrap();
        let service = service();
        let user = make_user().await;

        let c = code("concurrency", 3.0);
        service.codes.create(&c).await.unwrap();
        service.redeem(&user.id, &c.code).await.unwrap();
        let loaded = UserStore::new().get(&user.id).await.unwrap().unwrap();
        assert_eq!(loaded.concurrency, 5);

        let mut sub_code = code("subscription", 0.0);
        sub_code.group_id = Some(Uuid::new_v4().to_string());
        sub_code.validity_days = 30;
        service.codes.create(&sub_code).await.unwrap();
        service.redeem(&user.id, &sub_code.code).await.unwrap();
        let sub = SubscriptionStore::new()
            .get(&user.id, sub_code.group_id.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.status, "active");
    }

    #[tokio::test]
    async fn concurrent_redeems_have_one_winner() {
        crate::db::init_memory().await.unwrap();
        let service = Arc::new(service());
        let u1 = make_user().await;
        let u2 = make_user().await;
        let c = code("balance", 10.0);
        service.codes.create(&c).await.unwrap();

        let a = {
            let service = service.clone();
            let code = c.code.clone();
            let user = u1.id.clone();
            tokio::spawn(async move { service.redeem(&user, &code).await })
        };
        let b = {
            let service = service.clone();
            let code = c.code.clone();
            let user = u2.id.clone();
            tokio::spawn(async move { service.redeem(&user, &code).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let loser = results.iter().find(|r| r.is_err()).unwrap();
        assert_eq!(loser.as_ref().unwrap_err().kind(), "REDEEM_CODE_USED");
    }
}
