//! Leader-elected per-minute metrics rollups.
//!
//! One instance across the fleet holds the leader lock and writes a row per
//! minute aggregated from the usage log. Redis is the primary lock; when it
//! is unreachable, a database advisory lock keyed by a stable 64-bit hash of
//! the lock name takes over.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::db;
use crate::redis::RedisStore;
use crate::store::{UsageLogStore, now_millis, now_secs};

const LEADER_LOCK: &str = "ops:metrics:collector:leader";
const LEADER_TTL_SECS: u64 = 90;
const COLLECT_INTERVAL: Duration = Duration::from_secs(60);

/// Stable 64-bit hash of a lock name (first 8 bytes of its SHA-256).
pub fn advisory_lock_hash(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().unwrap())
}

pub struct MetricsCollector {
    redis: RedisStore,
    usage: UsageLogStore,
}

impl MetricsCollector {
    pub fn new(redis: RedisStore, usage: UsageLogStore) -> Self {
        Self { redis, usage }
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(COLLECT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_leader().await {
                        self.collect().await;
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn is_leader(&self) -> bool {
        match self.redis.try_leader_lock(LEADER_LOCK, LEADER_TTL_SECS).await {
            Some(leader) => leader,
            None => self
                .try_db_advisory_lock()
                .await
                .unwrap_or_else(|e| {
                    warn!("advisory lock failed: {e}");
                    false
                }),
        }
    }

    /// Advisory-lock fallback: one row per lock hash; stealable once the
    /// previous holder's TTL lapses.
    async fn try_db_advisory_lock(&self) -> Result<bool, crate::error::GatewayError> {
        let conn = db::get_conn().await?;
        let hash = advisory_lock_hash(LEADER_LOCK);
        let now = now_secs();
        let holder = self.redis.instance_id();
        let expires_at = now + LEADER_TTL_SECS as i64;

        let claimed = conn
            .execute(
                "UPDATE advisory_locks SET holder = ?, expires_at = ? WHERE name_hash = ? AND (expires_at <= ? OR holder = ?)",
                (holder, expires_at, hash, now, holder),
            )
            .await
            .map_err(|e| crate::error::GatewayError::Database(format!("advisory lock update: {e}")))?;
        if claimed > 0 {
            return Ok(true);
        }

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO advisory_locks (name_hash, holder, expires_at) VALUES (?, ?, ?)",
                (hash, holder, expires_at),
            )
            .await
            .map_err(|e| crate::error::GatewayError::Database(format!("advisory lock insert: {e}")))?;
        Ok(inserted > 0)
    }

    /// Roll the previous minute into `ops_metrics`.
    async fn collect(&self) {
        let now_ms = now_millis();
        let minute = now_ms / 60_000 - 1;
        let from_ms = minute * 60_000;
        let to_ms = from_ms + 60_000;

        let (requests, input_tokens, output_tokens, cost) =
            match self.usage.minute_rollup(from_ms, to_ms).await {
                Ok(rollup) => rollup,
                Err(e) => {
                    warn!("metrics rollup query failed: {e}");
                    return;
                }
            };

        let Ok(conn) = db::get_conn().await else {
            return;
        };
        if let Err(e) = conn
            .execute(
                "INSERT OR REPLACE INTO ops_metrics (minute, requests, input_tokens, output_tokens, cost_microdollars) VALUES (?, ?, ?, ?, ?)",
                (minute, requests, input_tokens, output_tokens, cost),
            )
            .await
        {
            warn!("metrics rollup insert failed: {e}");
        } else {
            debug!(minute, requests, "ops metrics collected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_hash_is_stable() {
        let a = advisory_lock_hash(LEADER_LOCK);
        let b = advisory_lock_hash(LEADER_LOCK);
        assert_eq!(a, b);
        assert_ne!(a, advisory_lock_hash("other:lock"));
    }

    #[tokio::test]
    async fn db_advisory_lock_is_exclusive_until_expiry() {
        crate::db::init_memory().await.unwrap();
        let first = MetricsCollector::new(RedisStore::disabled(), UsageLogStore::new());
        let second = MetricsCollector::new(RedisStore::disabled(), UsageLogStore::new());

        assert!(first.try_db_advisory_lock().await.unwrap());
        // Renewal by the same holder succeeds; another instance is refused.
        assert!(first.try_db_advisory_lock().await.unwrap());
        assert!(!second.try_db_advisory_lock().await.unwrap());
    }
}
