//! Repositories over the SQL database. Each store is a thin, stateless view:
//! the database is the source of truth; caches (Redis) are soft state layered
//! on top by the billing and scheduling services.

pub mod accounts;
pub mod api_keys;
pub mod credentials;
pub mod groups;
pub mod models;
pub mod proxies;
pub mod redeem;
pub mod subscriptions;
pub mod usage_log;
pub mod users;

use std::time::{SystemTime, UNIX_EPOCH};

pub use accounts::{Account, AccountStatus, AccountStore, AccountType, Platform};
pub use api_keys::{ApiKey, ApiKeyStore};
pub use credentials::Credentials;
pub use groups::{Group, GroupStore, SubscriptionType};
pub use models::ModelPricing;
pub use proxies::{Proxy, ProxyStore};
pub use redeem::{RedeemCode, RedeemStore};
pub use subscriptions::{SubscriptionStore, UserSubscription};
pub use usage_log::{UsageLogStore, UsageRecord};
pub use users::{User, UserStore};

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}
