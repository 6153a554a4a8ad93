use serde_json::Value;

use crate::db::{self, get_f64, get_i64, get_string, opt_i64};
use crate::error::GatewayError;
use crate::store::now_secs;

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: String,
    pub status: String,
    /// USD. May dip below zero only inside a debit race window.
    pub balance: f64,
    /// Per-user in-flight cap; 0 means unlimited.
    pub concurrency: i64,
    pub allowed_groups: Vec<String>,
    /// Bumped to invalidate outstanding bearer tokens.
    pub token_version: i64,
    pub created_at: i64,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn is_group_allowed(&self, group_id: &str) -> bool {
        self.allowed_groups.iter().any(|g| g == group_id)
    }
}

fn row_to_user(row: &turso::Row) -> User {
    let allowed_groups = serde_json::from_str::<Value>(&get_string(row, 6))
        .ok()
        .and_then(|v| {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|g| g.as_str().map(str::to_string))
                    .collect()
            })
        })
        .unwrap_or_default();
    User {
        id: get_string(row, 0),
        email: get_string(row, 1),
        role: get_string(row, 2),
        status: get_string(row, 3),
        balance: get_f64(row, 4),
        concurrency: get_i64(row, 5),
        allowed_groups,
        token_version: get_i64(row, 7),
        created_at: opt_i64(row, 8).unwrap_or(0),
    }
}

const USER_COLUMNS: &str =
    "id, email, role, status, balance, concurrency, allowed_groups, token_version, created_at";

pub struct UserStore;

impl UserStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn create(&self, user: &User) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        let allowed = serde_json::to_string(&user.allowed_groups).unwrap_or_else(|_| "[]".into());
        conn.execute(
            &format!("INSERT INTO users ({USER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            (
                user.id.as_str(),
                user.email.as_str(),
                user.role.as_str(),
                user.status.as_str(),
                user.balance,
                user.concurrency,
                allowed,
                user.token_version,
                now_secs(),
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create user: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<User>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"), [id])
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to get user: {e}")))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read user row: {e}")))?
            .map(|row| row_to_user(&row)))
    }

    /// Debit `amount` USD. The subtraction is applied in SQL so concurrent
    /// debits commute; the balance check happens at the eligibility gate, so
    /// a race window may briefly take the balance negative.
    pub async fn debit_balance(&self, id: &str, amount: f64) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE users SET balance = balance - ? WHERE id = ?",
            (amount, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to debit balance: {e}")))?;
        Ok(())
    }

    pub async fn credit_balance(&self, id: &str, amount: f64) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE users SET balance = balance + ? WHERE id = ?",
            (amount, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to credit balance: {e}")))?;
        Ok(())
    }

    pub async fn add_concurrency(&self, id: &str, slots: i64) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE users SET concurrency = concurrency + ? WHERE id = ?",
            (slots, id),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to add concurrency: {e}")))?;
        Ok(())
    }

    /// Disable a user. Admin users cannot be disabled.
    pub async fn set_status(&self, id: &str, status: &str) -> Result<(), GatewayError> {
        let Some(user) = self.get(id).await? else {
            return Err(GatewayError::UserNotFound);
        };
        if user.is_admin() && status == "disabled" {
            return Err(GatewayError::InvalidRequest(
                "admin users cannot be disabled".to_string(),
            ));
        }
        let conn = db::get_conn().await?;
        conn.execute("UPDATE users SET status = ? WHERE id = ?", (status, id))
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to set user status: {e}")))?;
        Ok(())
    }

    /// Delete a user. Admin users cannot be deleted.
    pub async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        let Some(user) = self.get(id).await? else {
            return Err(GatewayError::UserNotFound);
        };
        if user.is_admin() {
            return Err(GatewayError::InvalidRequest(
                "admin users cannot be deleted".to_string(),
            ));
        }
        let conn = db::get_conn().await?;
        conn.execute("DELETE FROM users WHERE id = ?", [id])
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to delete user: {e}")))?;
        conn.execute("DELETE FROM api_keys WHERE user_id = ?", [id])
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to delete user keys: {e}")))?;
        Ok(())
    }

    /// Invalidate outstanding bearer tokens.
    pub async fn bump_token_version(&self, id: &str) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE users SET token_version = token_version + 1 WHERE id = ?",
            [id],
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to bump token version: {e}")))?;
        Ok(())
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn new_user(role: &str) -> User {
        User {
            id: Uuid::new_v4().to_string(),
            email: format!("{}@example.com", Uuid::new_v4()),
            role: role.to_string(),
            status: "active".to_string(),
            balance: 10.0,
            concurrency: 0,
            allowed_groups: Vec::new(),
            token_version: 0,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn admin_cannot_be_deleted_or_disabled() {
        crate::db::init_memory().await.unwrap();
        let store = UserStore::new();
        let admin = new_user("admin");
        store.create(&admin).await.unwrap();

        assert!(store.delete(&admin.id).await.is_err());
        assert!(store.set_status(&admin.id, "disabled").await.is_err());

        let regular = new_user("user");
        store.create(&regular).await.unwrap();
        store.set_status(&regular.id, "disabled").await.unwrap();
        store.delete(&regular.id).await.unwrap();
        assert!(store.get(&regular.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn debit_and_credit_commute() {
        crate::db::init_memory().await.unwrap();
        let store = UserStore::new();
        let user = new_user("user");
        store.create(&user).await.unwrap();

        store.debit_balance(&user.id, 3.5).await.unwrap();
        store.credit_balance(&user.id, 1.0).await.unwrap();
        let loaded = store.get(&user.id).await.unwrap().unwrap();
        assert!((loaded.balance - 7.5).abs() < 1e-9);
    }
}
