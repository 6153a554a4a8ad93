use crate::db::{self, get_f64, get_i64, get_string};
use crate::error::GatewayError;
use crate::store::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    Standard,
    Subscription,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Standard => "standard",
            SubscriptionType::Subscription => "subscription",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "subscription" => SubscriptionType::Subscription,
            _ => SubscriptionType::Standard,
        }
    }
}

/// Either a standard group (rate multiplier, optional exclusivity) or a
/// subscription group (per-window USD limits). A limit of 0 or absent means
/// "no limit"; a subscription group must carry at least one limit.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub rate_multiplier: f64,
    pub is_exclusive: bool,
    pub subscription_type: SubscriptionType,
    pub daily_limit_usd: Option<f64>,
    pub weekly_limit_usd: Option<f64>,
    pub monthly_limit_usd: Option<f64>,
}

impl Group {
    pub fn is_subscription(&self) -> bool {
        self.subscription_type == SubscriptionType::Subscription
    }

    pub fn has_any_limit(&self) -> bool {
        [self.daily_limit_usd, self.weekly_limit_usd, self.monthly_limit_usd]
            .iter()
            .any(|l| l.is_some_and(|v| v > 0.0))
    }
}

fn opt_limit(row: &turso::Row, idx: usize) -> Option<f64> {
    let v = get_f64(row, idx);
    if v > 0.0 { Some(v) } else { None }
}

fn row_to_group(row: &turso::Row) -> Option<Group> {
    Some(Group {
        id: get_string(row, 0),
        name: get_string(row, 1),
        platform: Platform::parse(&get_string(row, 2))?,
        rate_multiplier: get_f64(row, 3),
        is_exclusive: get_i64(row, 4) != 0,
        subscription_type: SubscriptionType::parse(&get_string(row, 5)),
        daily_limit_usd: opt_limit(row, 6),
        weekly_limit_usd: opt_limit(row, 7),
        monthly_limit_usd: opt_limit(row, 8),
    })
}

const GROUP_COLUMNS: &str = "id, name, platform, rate_multiplier, is_exclusive, \
    subscription_type, daily_limit_usd, weekly_limit_usd, monthly_limit_usd";

pub struct GroupStore;

impl GroupStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn create(&self, group: &Group) -> Result<(), GatewayError> {
        if group.is_subscription() && !group.has_any_limit() {
            return Err(GatewayError::InvalidRequest(
                "subscription group requires at least one window limit".to_string(),
            ));
        }
        let conn = db::get_conn().await?;
        conn.execute(
            &format!("INSERT INTO groups ({GROUP_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            (
                group.id.as_str(),
                group.name.as_str(),
                group.platform.as_str(),
                group.rate_multiplier,
                group.is_exclusive as i64,
                group.subscription_type.as_str(),
                group.daily_limit_usd,
                group.weekly_limit_usd,
                group.monthly_limit_usd,
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create group: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Group>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?"),
                [id],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to get group: {e}")))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read group row: {e}")))?
        else {
            return Ok(None);
        };
        Ok(row_to_group(&row))
    }

    /// Account ids bound to this group.
    pub async fn account_ids(&self, group_id: &str) -> Result<Vec<String>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT account_id FROM account_groups WHERE group_id = ?",
                [group_id],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to list group accounts: {e}")))?;
        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            ids.push(get_string(&row, 0));
        }
        Ok(ids)
    }

    pub async fn bind_account(&self, account_id: &str, group_id: &str) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "INSERT OR IGNORE INTO account_groups (account_id, group_id) VALUES (?, ?)",
            (account_id, group_id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to bind account to group: {e}")))?;
        Ok(())
    }

    /// Delete a group, detach its account bindings, and clear api-key
    /// bindings. Returns the ids of users whose keys referenced the group so
    /// their subscription caches can be invalidated.
    pub async fn delete(&self, id: &str) -> Result<Vec<String>, GatewayError> {
        let conn = db::get_conn().await?;

        let mut rows = conn
            .query(
                "SELECT DISTINCT user_id FROM api_keys WHERE group_id = ?",
                [id],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to list affected users: {e}")))?;
        let mut affected = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            affected.push(get_string(&row, 0));
        }

        conn.execute(
            "UPDATE api_keys SET group_id = NULL WHERE group_id = ?",
            [id],
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to clear key bindings: {e}")))?;
        conn.execute("DELETE FROM account_groups WHERE group_id = ?", [id])
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to detach accounts: {e}")))?;
        conn.execute("DELETE FROM groups WHERE id = ?", [id])
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to delete group: {e}")))?;

        Ok(affected)
    }
}

impl Default for GroupStore {
    fn default() -> Self {
        Self::new()
    }
}
