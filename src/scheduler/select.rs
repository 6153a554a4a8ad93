//! Account selection: platform resolution, candidate filtering, session
//! affinity, and ranking.

use std::collections::HashSet;

use tracing::debug;

use crate::error::GatewayError;
use crate::ratelimit::QuotaPrecheck;
use crate::redis::RedisStore;
use crate::store::{Account, AccountStore, AccountType, Group, GroupStore, Platform, now_secs};

/// One selection request. `excluded` grows across failover rounds.
#[derive(Debug, Clone, Default)]
pub struct ScheduleRequest {
    /// Canonical platform of the route family serving this request.
    pub family: Option<Platform>,
    /// Set by the /antigravity route (and similar) to pin the platform.
    pub force_platform: Option<Platform>,
    pub group_id: Option<String>,
    pub session_hash: String,
    pub requested_model: Option<String>,
    pub excluded: HashSet<String>,
}

pub struct AccountScheduler {
    accounts: AccountStore,
    groups: GroupStore,
    redis: RedisStore,
    quota: QuotaPrecheck,
}

impl AccountScheduler {
    pub fn new(
        accounts: AccountStore,
        groups: GroupStore,
        redis: RedisStore,
        quota: QuotaPrecheck,
    ) -> Self {
        Self {
            accounts,
            groups,
            redis,
            quota,
        }
    }

    /// Pick an account for the request, or a typed "no available accounts"
    /// error.
    pub async fn select(&self, req: &ScheduleRequest) -> Result<Account, GatewayError> {
        let now = now_secs();

        let group = match &req.group_id {
            Some(id) => self.groups.get(id).await?,
            None => None,
        };

        // Platform resolution: force > group > family default. The Gemini
        // family without a forced platform also mixes in opted-in
        // Antigravity accounts.
        let mut platforms: Vec<Platform> = Vec::new();
        let mut mixed = false;
        if let Some(force) = req.force_platform {
            platforms.push(force);
        } else if let Some(group) = &group {
            platforms.push(group.platform);
        } else if let Some(family) = req.family {
            platforms.push(family);
            if family == Platform::Gemini {
                platforms.push(Platform::Antigravity);
                mixed = true;
            }
        }

        let group_members: Option<HashSet<String>> = match &group {
            Some(group) => Some(self.groups.account_ids(&group.id).await?.into_iter().collect()),
            None => None,
        };

        let mut candidates = Vec::new();
        for account in self.accounts.list_schedulable(&platforms).await? {
            if !account.is_eligible(now) {
                continue;
            }
            if req.excluded.contains(&account.id) {
                continue;
            }
            if mixed && account.platform == Platform::Antigravity && !account.mixed_scheduling() {
                continue;
            }
            if let Some(members) = &group_members
                && !members.contains(&account.id)
            {
                continue;
            }
            if let Some(model) = &req.requested_model
                && !account.is_model_supported(model)
            {
                continue;
            }
            if !self.quota.allows(&account).await {
                debug!(account_id = %account.id, "quota precheck skipped account");
                continue;
            }
            candidates.push(account);
        }

        if candidates.is_empty() {
            return Err(GatewayError::NoAvailableAccounts {
                model: req.requested_model.clone(),
            });
        }

        let family_key = req
            .force_platform
            .or(req.family)
            .map(|p| p.as_str())
            .unwrap_or("default");

        // Session affinity: reuse the previously chosen account while it is
        // still a candidate. Best-effort — concurrent first requests may race
        // and pick independently.
        if !req.session_hash.is_empty()
            && let Some(sticky) = self.redis.session_get(family_key, &req.session_hash).await
            && let Some(account) = candidates.iter().find(|a| a.id == sticky)
        {
            return Ok(account.clone());
        }

        let family = req.family.or(req.force_platform);
        candidates.sort_by_key(|a| rank_key(a, family));
        let chosen = candidates.into_iter().next().unwrap();

        if !req.session_hash.is_empty() {
            self.redis
                .session_set(family_key, &req.session_hash, &chosen.id)
                .await;
        }

        Ok(chosen)
    }
}

/// Lowest wins: (platform rank, priority, used-before flag, tie-break).
/// Never-used accounts come first; among them OAuth is preferred, otherwise
/// the least recently used account wins.
fn rank_key(account: &Account, family: Option<Platform>) -> (i64, i64, i64, i64) {
    let platform_rank = match family {
        Some(Platform::Gemini) => gemini_rank(account),
        _ => 0,
    };
    match account.last_used_at {
        None => {
            let type_rank = if account.account_type == AccountType::OAuth {
                0
            } else {
                1
            };
            (platform_rank, account.priority, 0, type_rank)
        }
        Some(at) => (platform_rank, account.priority, 1, at),
    }
}

/// Rank for the Gemini family: api-key accounts first, then OAuth without a
/// project, then AI-Studio OAuth, then Code-Assist OAuth.
fn gemini_rank(account: &Account) -> i64 {
    match account.account_type {
        AccountType::ApiKey => 0,
        AccountType::OAuth => {
            if account.credentials.get_string("project_id").is_empty() {
                1
            } else if account.gemini_oauth_type() == "ai_studio" {
                2
            } else {
                3
            }
        }
        AccountType::SetupToken => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AccountStatus, Credentials, SubscriptionType, UsageLogStore};
    use uuid::Uuid;

    fn scheduler() -> AccountScheduler {
        AccountScheduler::new(
            AccountStore::new(),
            GroupStore::new(),
            RedisStore::disabled(),
            QuotaPrecheck::new(UsageLogStore::new()),
        )
    }

    async fn make_account(platform: Platform, priority: i64, name: &str) -> Account {
        let mut account = Account::new(platform, AccountType::OAuth, name);
        account.priority = priority;
        AccountStore::new().create(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn lowest_priority_wins_then_lru() {
        crate::db::init_memory().await.unwrap();
        let sched = scheduler();
        let model = format!("model-{}", Uuid::new_v4());

        let a = make_account(Platform::Anthropic, 20, "prio-20").await;
        let b = make_account(Platform::Anthropic, 10, "prio-10").await;
        // Restrict both to a unique model so other tests' accounts are
        // filtered out of this candidate set.
        let store = AccountStore::new();
        for id in [&a.id, &b.id] {
            let extra =
                Credentials::from_json(&format!(r#"{{"supported_models": ["{model}"]}}"#));
            store.update_extra(id, &extra).await.unwrap();
        }

        let req = ScheduleRequest {
            family: Some(Platform::Anthropic),
            requested_model: Some(model.clone()),
            ..Default::default()
        };
        let chosen = sched.select(&req).await.unwrap();
        assert_eq!(chosen.id, b.id);

        // Priority still beats LRU: b stays preferred even after use.
        store.touch_last_used(&b.id).await.unwrap();
        let chosen = sched.select(&req).await.unwrap();
        assert_eq!(chosen.id, b.id);
    }

    #[tokio::test]
    async fn never_used_preferred_at_equal_priority() {
        crate::db::init_memory().await.unwrap();
        let sched = scheduler();
        let model = format!("model-{}", Uuid::new_v4());
        let store = AccountStore::new();

        let a = make_account(Platform::Anthropic, 10, "fresh-a").await;
        let b = make_account(Platform::Anthropic, 10, "fresh-b").await;
        for id in [&a.id, &b.id] {
            let extra =
                Credentials::from_json(&format!(r#"{{"supported_models": ["{model}"]}}"#));
            store.update_extra(id, &extra).await.unwrap();
        }
        store.touch_last_used(&a.id).await.unwrap();

        let req = ScheduleRequest {
            family: Some(Platform::Anthropic),
            requested_model: Some(model),
            ..Default::default()
        };
        let chosen = sched.select(&req).await.unwrap();
        assert_eq!(chosen.id, b.id);
    }

    #[tokio::test]
    async fn excluded_and_ineligible_accounts_are_skipped() {
        crate::db::init_memory().await.unwrap();
        let sched = scheduler();
        let model = format!("model-{}", Uuid::new_v4());
        let store = AccountStore::new();

        let g1 = make_account(Platform::Gemini, 10, "g1").await;
        let g2 = make_account(Platform::Gemini, 20, "g2").await;
        for id in [&g1.id, &g2.id] {
            let extra =
                Credentials::from_json(&format!(r#"{{"supported_models": ["{model}"]}}"#));
            store.update_extra(id, &extra).await.unwrap();
        }

        let mut req = ScheduleRequest {
            family: Some(Platform::Gemini),
            requested_model: Some(model.clone()),
            ..Default::default()
        };
        // Failover: g1 excluded → g2 serves.
        req.excluded.insert(g1.id.clone());
        let chosen = sched.select(&req).await.unwrap();
        assert_eq!(chosen.id, g2.id);

        // g2 rate limited too → no accounts left.
        store
            .mark_rate_limited(&g2.id, now_secs() + 600, now_secs() - 3600, "rejected")
            .await
            .unwrap();
        let err = sched.select(&req).await.unwrap_err();
        assert_eq!(err.kind(), "NO_AVAILABLE_ACCOUNTS");
        assert!(err.to_string().contains(&model));
    }

    #[tokio::test]
    async fn antigravity_joins_gemini_family_only_when_opted_in() {
        crate::db::init_memory().await.unwrap();
        let sched = scheduler();
        let model = format!("model-{}", Uuid::new_v4());
        let store = AccountStore::new();

        let mut opted = Account::new(Platform::Antigravity, AccountType::OAuth, "opted");
        opted.extra = Credentials::from_json(&format!(
            r#"{{"mixed_scheduling": true, "supported_models": ["{model}"]}}"#
        ));
        store.create(&opted).await.unwrap();

        let mut not_opted = Account::new(Platform::Antigravity, AccountType::OAuth, "not-opted");
        not_opted.extra =
            Credentials::from_json(&format!(r#"{{"supported_models": ["{model}"]}}"#));
        not_opted.priority = 1;
        store.create(&not_opted).await.unwrap();

        let req = ScheduleRequest {
            family: Some(Platform::Gemini),
            requested_model: Some(model.clone()),
            ..Default::default()
        };
        let chosen = sched.select(&req).await.unwrap();
        assert_eq!(chosen.id, opted.id);

        // Forced antigravity sees both; the opt-in flag no longer gates.
        let req = ScheduleRequest {
            force_platform: Some(Platform::Antigravity),
            requested_model: Some(model.clone()),
            ..Default::default()
        };
        let chosen = sched.select(&req).await.unwrap();
        assert_eq!(chosen.id, not_opted.id);
    }

    #[tokio::test]
    async fn group_restricts_candidates_to_bound_accounts() {
        crate::db::init_memory().await.unwrap();
        let sched = scheduler();
        let model = format!("model-{}", Uuid::new_v4());
        let store = AccountStore::new();
        let groups = GroupStore::new();

        let bound = make_account(Platform::Anthropic, 50, "bound").await;
        let unbound = make_account(Platform::Anthropic, 1, "unbound").await;
        for id in [&bound.id, &unbound.id] {
            let extra =
                Credentials::from_json(&format!(r#"{{"supported_models": ["{model}"]}}"#));
            store.update_extra(id, &extra).await.unwrap();
        }

        let group = Group {
            id: Uuid::new_v4().to_string(),
            name: "std".into(),
            platform: Platform::Anthropic,
            rate_multiplier: 1.0,
            is_exclusive: false,
            subscription_type: SubscriptionType::Standard,
            daily_limit_usd: None,
            weekly_limit_usd: None,
            monthly_limit_usd: None,
        };
        groups.create(&group).await.unwrap();
        groups.bind_account(&bound.id, &group.id).await.unwrap();

        let req = ScheduleRequest {
            group_id: Some(group.id.clone()),
            requested_model: Some(model),
            ..Default::default()
        };
        let chosen = sched.select(&req).await.unwrap();
        assert_eq!(chosen.id, bound.id);
    }

    #[tokio::test]
    async fn gemini_rank_prefers_api_keys() {
        crate::db::init_memory().await.unwrap();
        let sched = scheduler();
        let model = format!("model-{}", Uuid::new_v4());
        let store = AccountStore::new();

        let mut code_assist = Account::new(Platform::Gemini, AccountType::OAuth, "ca");
        code_assist.credentials =
            Credentials::from_json(r#"{"oauth_type": "code_assist", "project_id": "p"}"#);
        code_assist.priority = 1;
        code_assist.extra =
            Credentials::from_json(&format!(r#"{{"supported_models": ["{model}"]}}"#));
        store.create(&code_assist).await.unwrap();

        let mut api_key = Account::new(Platform::Gemini, AccountType::ApiKey, "key");
        api_key.priority = 99;
        api_key.extra = Credentials::from_json(&format!(r#"{{"supported_models": ["{model}"]}}"#));
        store.create(&api_key).await.unwrap();

        let req = ScheduleRequest {
            family: Some(Platform::Gemini),
            requested_model: Some(model),
            ..Default::default()
        };
        let chosen = sched.select(&req).await.unwrap();
        assert_eq!(chosen.id, api_key.id);
    }

    #[test]
    fn eligibility_matches_rank_inputs() {
        let mut account = Account::new(Platform::Gemini, AccountType::OAuth, "r");
        account.status = AccountStatus::Active;
        assert_eq!(gemini_rank(&account), 1); // oauth without project
        account.credentials = Credentials::from_json(r#"{"project_id": "p"}"#);
        assert_eq!(gemini_rank(&account), 3); // code_assist default
        account.credentials =
            Credentials::from_json(r#"{"project_id": "p", "oauth_type": "ai_studio"}"#);
        assert_eq!(gemini_rank(&account), 2);
    }
}
