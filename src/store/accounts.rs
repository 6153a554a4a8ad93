use serde_json::Value;

use crate::db::{self, get_i64, get_string, opt_i64, opt_string};
use crate::error::GatewayError;
use crate::store::{Credentials, now_secs};

/// Upstream platforms fronted by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Anthropic,
    Openai,
    Gemini,
    Antigravity,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::Openai => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(Platform::Anthropic),
            "openai" => Some(Platform::Openai),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    OAuth,
    SetupToken,
    ApiKey,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::OAuth => "oauth",
            AccountType::SetupToken => "setup-token",
            AccountType::ApiKey => "apikey",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "oauth" => Some(AccountType::OAuth),
            "setup-token" => Some(AccountType::SetupToken),
            "apikey" => Some(AccountType::ApiKey),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Inactive,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => AccountStatus::Active,
            "inactive" => AccountStatus::Inactive,
            _ => AccountStatus::Error,
        }
    }
}

/// One upstream credential set. Timed skip states (`rate_limit_reset_at`,
/// `overloaded_until`, `temp_unschedulable_until`) are all enforced:
/// the account is eligible only when every one of them has elapsed.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub platform: Platform,
    pub account_type: AccountType,
    pub name: String,
    pub credentials: Credentials,
    pub extra: Credentials,
    pub proxy_id: Option<String>,
    /// Max in-flight requests; 0 means unlimited.
    pub concurrency: i64,
    /// 1..100, lower preferred.
    pub priority: i64,
    pub status: AccountStatus,
    pub schedulable: bool,
    pub session_window_start: Option<i64>,
    pub session_window_end: Option<i64>,
    pub session_window_status: String,
    pub rate_limit_reset_at: Option<i64>,
    pub overloaded_until: Option<i64>,
    pub temp_unschedulable_until: Option<i64>,
    pub temp_unschedulable_reason: String,
    pub last_used_at: Option<i64>,
    pub error_message: String,
    pub crs_account_id: Option<String>,
    pub created_at: i64,
}

impl Account {
    pub fn new(platform: Platform, account_type: AccountType, name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform,
            account_type,
            name: name.to_string(),
            credentials: Credentials::new(),
            extra: Credentials::new(),
            proxy_id: None,
            concurrency: 0,
            priority: 50,
            status: AccountStatus::Active,
            schedulable: true,
            session_window_start: None,
            session_window_end: None,
            session_window_status: String::new(),
            rate_limit_reset_at: None,
            overloaded_until: None,
            temp_unschedulable_until: None,
            temp_unschedulable_reason: String::new(),
            last_used_at: None,
            error_message: String::new(),
            crs_account_id: None,
            created_at: now_secs(),
        }
    }

    /// Scheduling eligibility (invariant I1).
    pub fn is_eligible(&self, now: i64) -> bool {
        self.schedulable
            && self.status == AccountStatus::Active
            && self.rate_limit_reset_at.is_none_or(|t| t <= now)
            && self.overloaded_until.is_none_or(|t| t <= now)
            && self.temp_unschedulable_until.is_none_or(|t| t <= now)
    }

    /// Gemini OAuth subtype: code_assist (default), google_one, ai_studio.
    pub fn gemini_oauth_type(&self) -> String {
        let t = self.credentials.get_string("oauth_type");
        if t.is_empty() {
            "code_assist".to_string()
        } else {
            t
        }
    }

    /// Whether this Antigravity account opted into Gemini mixed scheduling.
    pub fn mixed_scheduling(&self) -> bool {
        self.extra.get_bool("mixed_scheduling")
    }

    /// Model allowlist from `extra.supported_models`; empty list allows all.
    pub fn is_model_supported(&self, model: &str) -> bool {
        match self.extra.get_value("supported_models") {
            Some(Value::Array(models)) if !models.is_empty() => models
                .iter()
                .any(|m| m.as_str().is_some_and(|s| s == model)),
            _ => true,
        }
    }
}

const ACCOUNT_COLUMNS: &str = "id, platform, account_type, name, credentials, extra, proxy_id, \
    concurrency, priority, status, schedulable, session_window_start, session_window_end, \
    session_window_status, rate_limit_reset_at, overloaded_until, temp_unschedulable_until, \
    temp_unschedulable_reason, last_used_at, error_message, crs_account_id, created_at";

fn row_to_account(row: &turso::Row) -> Option<Account> {
    let platform = Platform::parse(&get_string(row, 1))?;
    let account_type = AccountType::parse(&get_string(row, 2))?;
    Some(Account {
        id: get_string(row, 0),
        platform,
        account_type,
        name: get_string(row, 3),
        credentials: Credentials::from_json(&get_string(row, 4)),
        extra: Credentials::from_json(&get_string(row, 5)),
        proxy_id: opt_string(row, 6),
        concurrency: get_i64(row, 7),
        priority: get_i64(row, 8),
        status: AccountStatus::parse(&get_string(row, 9)),
        schedulable: get_i64(row, 10) != 0,
        session_window_start: opt_i64(row, 11),
        session_window_end: opt_i64(row, 12),
        session_window_status: get_string(row, 13),
        rate_limit_reset_at: opt_i64(row, 14),
        overloaded_until: opt_i64(row, 15),
        temp_unschedulable_until: opt_i64(row, 16),
        temp_unschedulable_reason: get_string(row, 17),
        last_used_at: opt_i64(row, 18),
        error_message: get_string(row, 19),
        crs_account_id: opt_string(row, 20),
        created_at: get_i64(row, 21),
    })
}

async fn collect_accounts(mut rows: turso::Rows) -> Result<Vec<Account>, GatewayError> {
    let mut accounts = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        if let Some(account) = row_to_account(&row) {
            accounts.push(account);
        }
    }
    Ok(accounts)
}

pub struct AccountStore;

impl AccountStore {
    pub fn new() -> Self {
        Self
    }

    /// Insert a new account. State columns (windows, skip timers) start at
    /// their schema defaults; mutations go through the dedicated setters.
    pub async fn create(&self, account: &Account) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "INSERT INTO accounts (id, platform, account_type, name, credentials, extra, proxy_id, concurrency, priority, status, schedulable, crs_account_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                account.id.as_str(),
                account.platform.as_str(),
                account.account_type.as_str(),
                account.name.as_str(),
                account.credentials.to_json(),
                account.extra.to_json(),
                account.proxy_id.clone(),
                account.concurrency,
                account.priority,
                account.status.as_str(),
                account.schedulable as i64,
                account.crs_account_id.clone(),
                account.created_at,
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create account: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Account>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"),
                [id],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to get account: {e}")))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read account row: {e}")))?
        else {
            return Ok(None);
        };
        Ok(row_to_account(&row))
    }

    pub async fn get_by_crs_id(&self, crs_id: &str) -> Result<Option<Account>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE crs_account_id = ?"),
                [crs_id],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to get account by crs id: {e}")))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read account row: {e}")))?
        else {
            return Ok(None);
        };
        Ok(row_to_account(&row))
    }

    pub async fn list(&self) -> Result<Vec<Account>, GatewayError> {
        let conn = db::get_conn().await?;
        let rows = conn
            .query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts"), ())
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to list accounts: {e}")))?;
        collect_accounts(rows).await
    }

    /// All active accounts — the refresh driver's working set.
    pub async fn list_active(&self) -> Result<Vec<Account>, GatewayError> {
        let conn = db::get_conn().await?;
        let rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE status = 'active'"),
                (),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to list active accounts: {e}")))?;
        collect_accounts(rows).await
    }

    /// Candidate pool for the scheduler: schedulable + active for the given
    /// platforms. Timed skip states are filtered by the caller against `now`.
    pub async fn list_schedulable(
        &self,
        platforms: &[Platform],
    ) -> Result<Vec<Account>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut out = Vec::new();
        for platform in platforms {
            let rows = conn
                .query(
                    &format!(
                        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE status = 'active' AND schedulable = 1 AND platform = ?"
                    ),
                    [platform.as_str()],
                )
                .await
                .map_err(|e| {
                    GatewayError::Database(format!("Failed to list schedulable accounts: {e}"))
                })?;
            out.append(&mut collect_accounts(rows).await?);
        }
        Ok(out)
    }

    /// Replace an account's credential bag. Token rotation never changes the
    /// account's identity.
    pub async fn update_credentials(
        &self,
        id: &str,
        credentials: &Credentials,
    ) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET credentials = ?, error_message = '' WHERE id = ?",
            (credentials.to_json(), id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to update credentials: {e}")))?;
        Ok(())
    }

    pub async fn update_extra(&self, id: &str, extra: &Credentials) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET extra = ? WHERE id = ?",
            (extra.to_json(), id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to update extra: {e}")))?;
        Ok(())
    }

    /// Mark the account errored. The message is truncated to 2048 bytes.
    pub async fn set_error(&self, id: &str, message: &str) -> Result<(), GatewayError> {
        let mut cap = message.len().min(2048);
        while !message.is_char_boundary(cap) {
            cap -= 1;
        }
        let truncated = &message[..cap];
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET status = 'error', error_message = ? WHERE id = ?",
            (truncated, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to set account error: {e}")))?;
        Ok(())
    }

    /// Disable an account after a hard auth failure (401/402/403).
    pub async fn disable(&self, id: &str, message: &str) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET schedulable = 0, status = 'error', error_message = ? WHERE id = ?",
            (message, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to disable account: {e}")))?;
        Ok(())
    }

    /// Record a 429: reset instant plus the authoritative 5h session window
    /// `[reset−5h, reset]` (invariant I2).
    pub async fn mark_rate_limited(
        &self,
        id: &str,
        reset_at: i64,
        window_start: i64,
        window_status: &str,
    ) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET rate_limit_reset_at = ?, session_window_start = ?, session_window_end = ?, session_window_status = ? WHERE id = ?",
            (reset_at, window_start, reset_at, window_status, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to mark rate limited: {e}")))?;
        Ok(())
    }

    pub async fn mark_overloaded(&self, id: &str, until: i64) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET overloaded_until = ? WHERE id = ?",
            (until, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to mark overloaded: {e}")))?;
        Ok(())
    }

    pub async fn mark_temp_unschedulable(
        &self,
        id: &str,
        until: i64,
        reason_json: &str,
    ) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET temp_unschedulable_until = ?, temp_unschedulable_reason = ? WHERE id = ?",
            (until, reason_json, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to mark temp unschedulable: {e}")))?;
        Ok(())
    }

    /// Clear rate-limit state (success header `allowed`, or deferred recovery).
    pub async fn clear_rate_limit(&self, id: &str) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET rate_limit_reset_at = NULL, session_window_status = '' WHERE id = ? AND rate_limit_reset_at IS NOT NULL",
            [id],
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to clear rate limit: {e}")))?;
        Ok(())
    }

    pub async fn clear_overloaded(&self, id: &str) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET overloaded_until = NULL WHERE id = ? AND overloaded_until IS NOT NULL",
            [id],
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to clear overloaded: {e}")))?;
        Ok(())
    }

    pub async fn clear_temp_unschedulable(&self, id: &str) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET temp_unschedulable_until = NULL, temp_unschedulable_reason = '' WHERE id = ? AND temp_unschedulable_until IS NOT NULL",
            [id],
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to clear temp unschedulable: {e}")))?;
        Ok(())
    }

    /// Open a session window without touching rate-limit state (success-path
    /// header with no open window).
    pub async fn set_session_window(
        &self,
        id: &str,
        start: i64,
        end: i64,
        status: &str,
    ) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET session_window_start = ?, session_window_end = ?, session_window_status = ? WHERE id = ?",
            (start, end, status, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to set session window: {e}")))?;
        Ok(())
    }

    pub async fn touch_last_used(&self, id: &str) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET last_used_at = ? WHERE id = ?",
            (now_secs(), id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to touch last_used_at: {e}")))?;
        Ok(())
    }

    pub async fn update_from_crs(&self, account: &Account) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET platform = ?, account_type = ?, name = ?, credentials = ?, extra = ?, proxy_id = ?, status = ?, error_message = '' WHERE id = ?",
            (
                account.platform.as_str(),
                account.account_type.as_str(),
                account.name.as_str(),
                account.credentials.to_json(),
                account.extra.to_json(),
                account.proxy_id.clone(),
                account.status.as_str(),
                account.id.as_str(),
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to update account from sync: {e}")))?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, GatewayError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute("DELETE FROM accounts WHERE id = ?", [id])
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to delete account: {e}")))?;
        conn.execute("DELETE FROM account_groups WHERE account_id = ?", [id])
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to detach account groups: {e}")))?;
        Ok(affected > 0)
    }
}

impl Default for AccountStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_requires_every_timed_state_elapsed() {
        let now = 1_000_000;
        let mut account = Account::new(Platform::Anthropic, AccountType::OAuth, "a");
        assert!(account.is_eligible(now));

        account.rate_limit_reset_at = Some(now + 60);
        assert!(!account.is_eligible(now));
        account.rate_limit_reset_at = Some(now - 1);
        assert!(account.is_eligible(now));

        // 529 cooldown does not clear a prior rate-limit; both enforced.
        account.rate_limit_reset_at = Some(now - 1);
        account.overloaded_until = Some(now + 10);
        assert!(!account.is_eligible(now));
        account.overloaded_until = Some(now - 10);
        account.temp_unschedulable_until = Some(now + 5);
        assert!(!account.is_eligible(now));
        account.temp_unschedulable_until = None;
        assert!(account.is_eligible(now));

        account.schedulable = false;
        assert!(!account.is_eligible(now));
        account.schedulable = true;
        account.status = AccountStatus::Error;
        assert!(!account.is_eligible(now));
    }

    #[test]
    fn model_allowlist_empty_means_all() {
        let mut account = Account::new(Platform::Gemini, AccountType::OAuth, "g");
        assert!(account.is_model_supported("gemini-2.5-pro"));
        account.extra = Credentials::from_json(r#"{"supported_models": ["gemini-2.5-flash"]}"#);
        assert!(!account.is_model_supported("gemini-2.5-pro"));
        assert!(account.is_model_supported("gemini-2.5-flash"));
    }

    #[tokio::test]
    async fn round_trip_and_state_transitions() {
        crate::db::init_memory().await.unwrap();
        let store = AccountStore::new();

        let mut account = Account::new(Platform::Gemini, AccountType::OAuth, "round-trip");
        account.credentials = Credentials::from_json(
            r#"{"access_token": "t", "refresh_token": "r", "expires_at": "1735689600", "oauth_type": "code_assist"}"#,
        );
        account.priority = 10;
        store.create(&account).await.unwrap();

        let loaded = store.get(&account.id).await.unwrap().unwrap();
        assert_eq!(loaded.platform, Platform::Gemini);
        assert_eq!(loaded.credentials.get_string("access_token"), "t");
        assert_eq!(loaded.priority, 10);
        assert!(loaded.is_eligible(now_secs()));

        let reset = now_secs() + 600;
        store
            .mark_rate_limited(&account.id, reset, reset - 5 * 3600, "rejected")
            .await
            .unwrap();
        let limited = store.get(&account.id).await.unwrap().unwrap();
        assert_eq!(limited.rate_limit_reset_at, Some(reset));
        assert_eq!(limited.session_window_end, Some(reset));
        assert!(!limited.is_eligible(now_secs()));

        store.clear_rate_limit(&account.id).await.unwrap();
        let cleared = store.get(&account.id).await.unwrap().unwrap();
        assert_eq!(cleared.rate_limit_reset_at, None);
        assert!(cleared.is_eligible(now_secs()));
    }

    #[tokio::test]
    async fn set_error_truncates_message() {
        crate::db::init_memory().await.unwrap();
        let store = AccountStore::new();
        let account = Account::new(Platform::Openai, AccountType::OAuth, "err");
        store.create(&account).await.unwrap();

        let long = "x".repeat(5000);
        store.set_error(&account.id, &long).await.unwrap();
        let loaded = store.get(&account.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AccountStatus::Error);
        assert_eq!(loaded.error_message.len(), 2048);
    }

    #[tokio::test]
    async fn set_error_caps_bytes_not_chars() {
        crate::db::init_memory().await.unwrap();
        let store = AccountStore::new();
        let account = Account::new(Platform::Openai, AccountType::OAuth, "err-utf8");
        store.create(&account).await.unwrap();

        // 3000 three-byte characters; a char-count cap would store ~6 KiB.
        let long = "日".repeat(3000);
        store.set_error(&account.id, &long).await.unwrap();
        let loaded = store.get(&account.id).await.unwrap().unwrap();
        assert!(loaded.error_message.len() <= 2048);
        // Cut lands on a char boundary, so the stored text is valid and
        // made of whole characters.
        assert!(loaded.error_message.chars().all(|c| c == '日'));
    }
}
