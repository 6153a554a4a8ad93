use crate::db::{self, get_f64, get_i64, get_string, opt_i64, opt_string};
use crate::error::GatewayError;
use crate::store::now_secs;

#[derive(Debug, Clone)]
pub struct RedeemCode {
    pub code: String,
    /// balance | concurrency | subscription | adjustment
    pub code_type: String,
    pub value: f64,
    pub status: String,
    pub group_id: Option<String>,
    pub validity_days: i64,
    pub used_by: Option<String>,
    pub used_at: Option<i64>,
}

const CODE_COLUMNS: &str = "code, code_type, value, status, group_id, validity_days, used_by, used_at";

fn row_to_code(row: &turso::Row) -> RedeemCode {
    RedeemCode {
        code: get_string(row, 0),
        code_type: get_string(row, 1),
        value: get_f64(row, 2),
        status: get_string(row, 3),
        group_id: opt_string(row, 4),
        validity_days: get_i64(row, 5),
        used_by: opt_string(row, 6),
        used_at: opt_i64(row, 7),
    }
}

pub struct RedeemStore;

impl RedeemStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn create(&self, code: &RedeemCode) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            &format!("INSERT INTO redeem_codes ({CODE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
            (
                code.code.as_str(),
                code.code_type.as_str(),
                code.value,
                code.status.as_str(),
                code.group_id.clone(),
                code.validity_days,
                code.used_by.clone(),
                code.used_at,
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create redeem code: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, code: &str) -> Result<Option<RedeemCode>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {CODE_COLUMNS} FROM redeem_codes WHERE code = ?"),
                [code],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to get redeem code: {e}")))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read redeem code row: {e}")))?
            .map(|row| row_to_code(&row)))
    }

    /// Claim a code for `user_id`. The unused→used transition is atomic via
    /// the optimistic `WHERE status = 'unused'` guard: under concurrent
    /// attempts exactly one caller gets the claimed code back.
    pub async fn claim(&self, code: &str, user_id: &str) -> Result<RedeemCode, GatewayError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute(
                "UPDATE redeem_codes SET status = 'used', used_by = ?, used_at = ? WHERE code = ? AND status = 'unused'",
                (user_id, now_secs(), code),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to claim redeem code: {e}")))?;

        if affected == 0 {
            return match self.get(code).await? {
                None => Err(GatewayError::RedeemCodeNotFound),
                Some(c) if c.status == "used" => Err(GatewayError::RedeemCodeUsed),
                Some(_) => Err(GatewayError::RedeemCodeLocked),
            };
        }

        self.get(code)
            .await?
            .ok_or(GatewayError::RedeemCodeNotFound)
    }
}

impl Default for RedeemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn balance_code() -> RedeemCode {
        RedeemCode {
            code: Uuid::new_v4().to_string(),
            code_type: "balance".into(),
            value: 25.0,
            status: "unused".into(),
            group_id: None,
            validity_days: 0,
            used_by: None,
            used_at: None,
        }
    }

    #[tokio::test]
    async fn claim_is_at_most_once() {
        crate::db::init_memory().await.unwrap();
        let store = RedeemStore::new();
        let code = balance_code();
        store.create(&code).await.unwrap();

        let claimed = store.claim(&code.code, "u1").await.unwrap();
        assert_eq!(claimed.used_by.as_deref(), Some("u1"));

        let err = store.claim(&code.code, "u2").await.unwrap_err();
        assert_eq!(err.kind(), "REDEEM_CODE_USED");

        let stored = store.get(&code.code).await.unwrap().unwrap();
        assert_eq!(stored.used_by.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn concurrent_claims_settle_to_one_winner() {
        crate::db::init_memory().await.unwrap();
        let store = std::sync::Arc::new(RedeemStore::new());
        let code = balance_code();
        store.create(&code).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let code = code.code.clone();
            handles.push(tokio::spawn(async move {
                store.claim(&code, &format!("user-{i}")).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        crate::db::init_memory().await.unwrap();
        let store = RedeemStore::new();
        let err = store.claim("no-such-code", "u1").await.unwrap_err();
        assert_eq!(err.kind(), "REDEEM_CODE_NOT_FOUND");
    }
}
