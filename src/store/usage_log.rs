use crate::db::{self, get_i64};
use crate::error::GatewayError;
use crate::store::now_millis;

/// One metered request.
#[derive(Debug, Clone, Default)]
pub struct UsageRecord {
    pub account_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub cost_microdollars: i64,
    pub stream: bool,
    pub duration_ms: i64,
    pub first_token_ms: Option<i64>,
}

pub struct UsageLogStore;

impl UsageLogStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn insert(&self, record: &UsageRecord) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "INSERT INTO usage_log (account_id, user_id, api_key_id, model, input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, cost_microdollars, stream, duration_ms, first_token_ms, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                record.account_id.as_str(),
                record.user_id.as_str(),
                record.api_key_id.as_str(),
                record.model.as_str(),
                record.input_tokens,
                record.output_tokens,
                record.cache_read_tokens,
                record.cache_write_tokens,
                record.cost_microdollars,
                record.stream as i64,
                record.duration_ms,
                record.first_token_ms,
                now_millis(),
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to insert usage record: {e}")))?;
        Ok(())
    }

    /// Request count for an account in `[from_ms, to_ms)` — feeds the Gemini
    /// RPD/RPM precheck.
    pub async fn count_requests(
        &self,
        account_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<i64, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM usage_log WHERE account_id = ? AND created_at >= ? AND created_at < ?",
                (account_id, from_ms, to_ms),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to count requests: {e}")))?;
        let count = rows
            .next()
            .await
            .ok()
            .flatten()
            .map(|r| get_i64(&r, 0))
            .unwrap_or(0);
        Ok(count)
    }

    /// Per-minute rollup for the ops collector: (requests, input, output,
    /// cost) over `[from_ms, to_ms)`.
    pub async fn minute_rollup(
        &self,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<(i64, i64, i64, i64), GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0), COALESCE(SUM(cost_microdollars), 0) FROM usage_log WHERE created_at >= ? AND created_at < ?",
                (from_ms, to_ms),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to roll up usage: {e}")))?;
        let row = rows
            .next()
            .await
            .ok()
            .flatten();
        Ok(row
            .map(|r| (get_i64(&r, 0), get_i64(&r, 1), get_i64(&r, 2), get_i64(&r, 3)))
            .unwrap_or((0, 0, 0, 0)))
    }
}

impl Default for UsageLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn counts_are_window_bounded() {
        crate::db::init_memory().await.unwrap();
        let store = UsageLogStore::new();
        let account_id = Uuid::new_v4().to_string();

        for _ in 0..3 {
            store
                .insert(&UsageRecord {
                    account_id: account_id.clone(),
                    user_id: "u".into(),
                    api_key_id: "k".into(),
                    model: "gemini-2.5-pro".into(),
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let now = now_millis();
        let count = store
            .count_requests(&account_id, now - 60_000, now + 1)
            .await
            .unwrap();
        assert_eq!(count, 3);

        let stale = store
            .count_requests(&account_id, now - 120_000, now - 60_000)
            .await
            .unwrap();
        assert_eq!(stale, 0);
    }
}
