use chrono::{Local, TimeZone, Utc};

use crate::db::{self, get_f64, get_i64, get_string, opt_i64};
use crate::error::GatewayError;
use crate::store::Group;

pub const DAILY_PERIOD_SECS: i64 = 24 * 60 * 60;
pub const WEEKLY_PERIOD_SECS: i64 = 7 * 24 * 60 * 60;
pub const MONTHLY_PERIOD_SECS: i64 = 30 * 24 * 60 * 60;

/// Hard caps: no extension beyond 36500 days, no expiry past year 2099.
pub const MAX_VALIDITY_DAYS: i64 = 36500;
pub const MAX_EXPIRY_SECS: i64 = 4102444799; // 2099-12-31T23:59:59Z

/// Bucket an instant to the start of its local day.
pub fn start_of_local_day(at_secs: i64) -> i64 {
    let utc = Utc.timestamp_opt(at_secs, 0).single().unwrap_or_default();
    let local = utc.with_timezone(&Local);
    local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).single())
        .map(|dt| dt.timestamp())
        .unwrap_or(at_secs - at_secs.rem_euclid(DAILY_PERIOD_SECS))
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UserSubscription {
    pub id: String,
    pub user_id: String,
    pub group_id: String,
    pub status: String,
    pub starts_at: i64,
    pub expires_at: i64,
    pub daily_window_start: Option<i64>,
    pub daily_usage_usd: f64,
    pub weekly_window_start: Option<i64>,
    pub weekly_usage_usd: f64,
    pub monthly_window_start: Option<i64>,
    pub monthly_usage_usd: f64,
    pub assigned_by: String,
    pub notes: String,
}

/// Which rolling window tripped a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Daily,
    Weekly,
    Monthly,
}

impl WindowKind {
    pub fn period_secs(&self) -> i64 {
        match self {
            WindowKind::Daily => DAILY_PERIOD_SECS,
            WindowKind::Weekly => WEEKLY_PERIOD_SECS,
            WindowKind::Monthly => MONTHLY_PERIOD_SECS,
        }
    }

    pub fn limit_error(&self) -> GatewayError {
        match self {
            WindowKind::Daily => GatewayError::DailyLimitExceeded,
            WindowKind::Weekly => GatewayError::WeeklyLimitExceeded,
            WindowKind::Monthly => GatewayError::MonthlyLimitExceeded,
        }
    }
}

impl UserSubscription {
    pub fn is_active(&self, now: i64) -> bool {
        self.status == "active" && now < self.expires_at
    }

    fn window(&self, kind: WindowKind) -> (Option<i64>, f64) {
        match kind {
            WindowKind::Daily => (self.daily_window_start, self.daily_usage_usd),
            WindowKind::Weekly => (self.weekly_window_start, self.weekly_usage_usd),
            WindowKind::Monthly => (self.monthly_window_start, self.monthly_usage_usd),
        }
    }

    /// A window needs a reset when its end is in the past. An unactivated
    /// window (no start) never needs one — it activates on first use.
    pub fn needs_reset(&self, kind: WindowKind, now: i64) -> bool {
        match self.window(kind).0 {
            Some(start) => start + kind.period_secs() <= now,
            None => false,
        }
    }

    /// Usage counted against the window right now (0 when a reset is due).
    pub fn effective_usage(&self, kind: WindowKind, now: i64) -> f64 {
        if self.needs_reset(kind, now) {
            0.0
        } else {
            self.window(kind).1
        }
    }

    /// First window whose usage + additional would exceed the group limit,
    /// checked daily → weekly → monthly. Monotone: a non-positive
    /// `additional` can never introduce a new violation.
    pub fn check_usage_limits(
        &self,
        group: &Group,
        additional: f64,
        now: i64,
    ) -> Result<(), GatewayError> {
        let checks = [
            (WindowKind::Daily, group.daily_limit_usd),
            (WindowKind::Weekly, group.weekly_limit_usd),
            (WindowKind::Monthly, group.monthly_limit_usd),
        ];
        for (kind, limit) in checks {
            if let Some(limit) = limit
                && self.effective_usage(kind, now) + additional > limit
            {
                return Err(kind.limit_error());
            }
        }
        Ok(())
    }
}

const SUB_COLUMNS: &str = "id, user_id, group_id, status, starts_at, expires_at, \
    daily_window_start, daily_usage_usd, weekly_window_start, weekly_usage_usd, \
    monthly_window_start, monthly_usage_usd, assigned_by, notes";

fn row_to_subscription(row: &turso::Row) -> UserSubscription {
    UserSubscription {
        id: get_string(row, 0),
        user_id: get_string(row, 1),
        group_id: get_string(row, 2),
        status: get_string(row, 3),
        starts_at: get_i64(row, 4),
        expires_at: get_i64(row, 5),
        daily_window_start: opt_i64(row, 6),
        daily_usage_usd: get_f64(row, 7),
        weekly_window_start: opt_i64(row, 8),
        weekly_usage_usd: get_f64(row, 9),
        monthly_window_start: opt_i64(row, 10),
        monthly_usage_usd: get_f64(row, 11),
        assigned_by: get_string(row, 12),
        notes: get_string(row, 13),
    }
}

pub struct SubscriptionStore;

impl SubscriptionStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn create(&self, sub: &UserSubscription) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            &format!(
                "INSERT INTO user_subscriptions ({SUB_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            (
                sub.id.as_str(),
                sub.user_id.as_str(),
                sub.group_id.as_str(),
                sub.status.as_str(),
                sub.starts_at,
                sub.expires_at,
                sub.daily_window_start,
                sub.daily_usage_usd,
                sub.weekly_window_start,
                sub.weekly_usage_usd,
                sub.monthly_window_start,
                sub.monthly_usage_usd,
                sub.assigned_by.as_str(),
                sub.notes.as_str(),
            ),
        )
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                GatewayError::SubscriptionAlreadyExists
            } else {
                GatewayError::Database(format!("Failed to create subscription: {e}"))
            }
        })?;
        Ok(())
    }

    pub async fn get(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<Option<UserSubscription>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SUB_COLUMNS} FROM user_subscriptions WHERE user_id = ? AND group_id = ?"
                ),
                (user_id, group_id),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to get subscription: {e}")))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read subscription row: {e}")))?
            .map(|row| row_to_subscription(&row)))
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<UserSubscription>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {SUB_COLUMNS} FROM user_subscriptions WHERE user_id = ?"),
                [user_id],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to list subscriptions: {e}")))?;
        let mut subs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            subs.push(row_to_subscription(&row));
        }
        Ok(subs)
    }

    pub async fn update_expiry(
        &self,
        id: &str,
        expires_at: i64,
        status: &str,
        notes: &str,
    ) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE user_subscriptions SET expires_at = ?, status = ?, notes = ? WHERE id = ?",
            (expires_at, status, notes, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to update subscription: {e}")))?;
        Ok(())
    }

    /// Apply metered cost to all three windows in one statement. Windows that
    /// are unactivated or past their end restart at the local-day start; the
    /// others accumulate, so concurrent writers commute.
    pub async fn record_usage(&self, id: &str, cost: f64, now: i64) -> Result<(), GatewayError> {
        let day_start = start_of_local_day(now);
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE user_subscriptions SET \
             daily_usage_usd = CASE WHEN daily_window_start IS NULL OR daily_window_start + ?1 <= ?4 THEN ?5 ELSE daily_usage_usd + ?5 END, \
             daily_window_start = CASE WHEN daily_window_start IS NULL OR daily_window_start + ?1 <= ?4 THEN ?6 ELSE daily_window_start END, \
             weekly_usage_usd = CASE WHEN weekly_window_start IS NULL OR weekly_window_start + ?2 <= ?4 THEN ?5 ELSE weekly_usage_usd + ?5 END, \
             weekly_window_start = CASE WHEN weekly_window_start IS NULL OR weekly_window_start + ?2 <= ?4 THEN ?6 ELSE weekly_window_start END, \
             monthly_usage_usd = CASE WHEN monthly_window_start IS NULL OR monthly_window_start + ?3 <= ?4 THEN ?5 ELSE monthly_usage_usd + ?5 END, \
             monthly_window_start = CASE WHEN monthly_window_start IS NULL OR monthly_window_start + ?3 <= ?4 THEN ?6 ELSE monthly_window_start END \
             WHERE id = ?7",
            (
                DAILY_PERIOD_SECS,
                WEEKLY_PERIOD_SECS,
                MONTHLY_PERIOD_SECS,
                now,
                cost,
                day_start,
                id,
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to record subscription usage: {e}")))?;
        Ok(())
    }

    pub async fn delete(&self, user_id: &str, group_id: &str) -> Result<bool, GatewayError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute(
                "DELETE FROM user_subscriptions WHERE user_id = ? AND group_id = ?",
                (user_id, group_id),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to delete subscription: {e}")))?;
        Ok(affected > 0)
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Platform, SubscriptionType};
    use uuid::Uuid;

    fn sub(daily_start: Option<i64>, daily_usage: f64) -> UserSubscription {
        UserSubscription {
            id: Uuid::new_v4().to_string(),
            user_id: Uuid::new_v4().to_string(),
            group_id: "g".into(),
            status: "active".into(),
            starts_at: 0,
            expires_at: i64::MAX,
            daily_window_start: daily_start,
            daily_usage_usd: daily_usage,
            weekly_window_start: None,
            weekly_usage_usd: 0.0,
            monthly_window_start: None,
            monthly_usage_usd: 0.0,
            assigned_by: String::new(),
            notes: String::new(),
        }
    }

    fn group_with_daily(limit: f64) -> Group {
        Group {
            id: "g".into(),
            name: "g".into(),
            platform: Platform::Anthropic,
            rate_multiplier: 1.0,
            is_exclusive: false,
            subscription_type: SubscriptionType::Subscription,
            daily_limit_usd: Some(limit),
            weekly_limit_usd: None,
            monthly_limit_usd: None,
        }
    }

    #[test]
    fn expired_window_counts_as_zero() {
        let now = 1_000_000_000;
        let s = sub(Some(now - 2 * DAILY_PERIOD_SECS), 9.5);
        assert!(s.needs_reset(WindowKind::Daily, now));
        assert_eq!(s.effective_usage(WindowKind::Daily, now), 0.0);
        // 9.5 of 10 spent but the window lapsed: a 2.0 request is admitted.
        assert!(s.check_usage_limits(&group_with_daily(10.0), 2.0, now).is_ok());
    }

    #[test]
    fn limit_check_is_monotone_in_additional() {
        let now = 1_000_000_000;
        let s = sub(Some(now - 60), 5.0);
        let g = group_with_daily(10.0);
        assert!(s.check_usage_limits(&g, 4.0, now).is_ok());
        assert!(s.check_usage_limits(&g, 0.0, now).is_ok());
        assert!(s.check_usage_limits(&g, -1.0, now).is_ok());
        let err = s.check_usage_limits(&g, 6.0, now).unwrap_err();
        assert_eq!(err.kind(), "DAILY_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn record_usage_resets_lapsed_window() {
        crate::db::init_memory().await.unwrap();
        let store = SubscriptionStore::new();
        let now = crate::store::now_secs();
        let mut s = sub(Some(now - 2 * DAILY_PERIOD_SECS), 9.5);
        s.group_id = Uuid::new_v4().to_string();
        store.create(&s).await.unwrap();

        store.record_usage(&s.id, 2.0, now).await.unwrap();
        let loaded = store.get(&s.user_id, &s.group_id).await.unwrap().unwrap();
        assert_eq!(loaded.daily_window_start, Some(start_of_local_day(now)));
        assert!((loaded.daily_usage_usd - 2.0).abs() < 1e-9);
        // Unactivated weekly window also starts at first use.
        assert_eq!(loaded.weekly_window_start, Some(start_of_local_day(now)));
        assert!((loaded.weekly_usage_usd - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_subscription_rejected() {
        crate::db::init_memory().await.unwrap();
        let store = SubscriptionStore::new();
        let s = sub(None, 0.0);
        store.create(&s).await.unwrap();
        let mut dup = s.clone();
        dup.id = Uuid::new_v4().to_string();
        let err = store.create(&dup).await.unwrap_err();
        assert_eq!(err.kind(), "SUBSCRIPTION_ALREADY_EXISTS");
    }
}
