//! Redis collaborators: session affinity, refresh locks, temp-unschedulable
//! mirror, billing cache, leader lock.
//!
//! All operations are soft — when Redis is not configured or a command fails,
//! the caller gets the "miss"/"not acquired" result and the request path
//! continues. Redis is never the source of truth.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::{info, warn};
use uuid::Uuid;

/// TTL of session-affinity keys.
const SESSION_TTL_SECS: u64 = 3600;

/// TTL of refresh locks.
const REFRESH_LOCK_TTL_SECS: u64 = 30;

/// Compare-and-delete: release a lock only if we still hold it.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: Option<MultiplexedConnection>,
    /// Identifies this gateway instance in lock values.
    instance_id: String,
}

impl RedisStore {
    /// Connect to Redis, or construct a disabled store when no URL is given
    /// or the connection fails.
    pub async fn connect(url: Option<&str>) -> Self {
        let instance_id = Uuid::new_v4().to_string();
        let Some(url) = url else {
            info!("Redis not configured; session affinity and caches disabled");
            return Self {
                conn: None,
                instance_id,
            };
        };

        let conn = match redis::Client::open(url) {
            Ok(client) => match tokio::time::timeout(
                Duration::from_secs(5),
                client.get_multiplexed_tokio_connection(),
            )
            .await
            {
                Ok(Ok(conn)) => {
                    info!("Connected to Redis at {url}");
                    Some(conn)
                }
                Ok(Err(e)) => {
                    warn!("Redis connection failed ({e}); continuing without Redis");
                    None
                }
                Err(_) => {
                    warn!("Redis connection timed out; continuing without Redis");
                    None
                }
            },
            Err(e) => {
                warn!("Invalid Redis URL ({e}); continuing without Redis");
                None
            }
        };

        Self { conn, instance_id }
    }

    /// Disabled store for tests.
    pub fn disabled() -> Self {
        Self {
            conn: None,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn available(&self) -> bool {
        self.conn.is_some()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    // -----------------------------------------------------------------------
    // Session affinity: session:{family}:{hash} -> account id
    // -----------------------------------------------------------------------

    /// Look up the sticky account for a session and refresh its TTL on hit.
    pub async fn session_get(&self, family: &str, hash: &str) -> Option<String> {
        let mut conn = self.conn.clone()?;
        let key = format!("session:{family}:{hash}");
        match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(id)) => {
                let _: Result<(), _> = conn.expire(&key, SESSION_TTL_SECS as i64).await;
                Some(id)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Redis session_get failed: {e}");
                None
            }
        }
    }

    pub async fn session_set(&self, family: &str, hash: &str, account_id: &str) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let key = format!("session:{family}:{hash}");
        if let Err(e) = conn
            .set_ex::<_, _, ()>(&key, account_id, SESSION_TTL_SECS)
            .await
        {
            warn!("Redis session_set failed: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Refresh locks: refresh_lock:{cache_key} -> instance id
    // -----------------------------------------------------------------------

    /// Try to take the distributed refresh lock. Returns true when Redis is
    /// unavailable so a single-instance deployment still refreshes.
    pub async fn acquire_refresh_lock(&self, cache_key: &str) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            return true;
        };
        let key = format!("refresh_lock:{cache_key}");
        let res: Result<Option<String>, _> = redis::cmd("SET")
            .arg(&key)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(REFRESH_LOCK_TTL_SECS)
            .query_async(&mut conn)
            .await;
        match res {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!("Redis acquire_refresh_lock failed: {e}");
                true
            }
        }
    }

    /// Release the refresh lock if this instance still holds it.
    pub async fn release_refresh_lock(&self, cache_key: &str) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let key = format!("refresh_lock:{cache_key}");
        let res: Result<i64, _> = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(&key)
            .arg(&self.instance_id)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = res {
            warn!("Redis release_refresh_lock failed: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Temp-unschedulable mirror: temp_unsched:{account_id} -> reason JSON
    // -----------------------------------------------------------------------

    pub async fn mirror_temp_unsched(&self, account_id: &str, reason_json: &str, ttl_secs: i64) {
        if ttl_secs <= 0 {
            return;
        }
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let key = format!("temp_unsched:{account_id}");
        if let Err(e) = conn
            .set_ex::<_, _, ()>(&key, reason_json, ttl_secs as u64)
            .await
        {
            warn!("Redis mirror_temp_unsched failed: {e}");
        }
    }

    pub async fn clear_temp_unsched(&self, account_id: &str) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let key = format!("temp_unsched:{account_id}");
        let _: Result<(), _> = conn.del(&key).await;
    }

    // -----------------------------------------------------------------------
    // Generic cache (billing balance/subscription, access tokens)
    // -----------------------------------------------------------------------

    pub async fn cache_get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Redis cache_get failed for {key}: {e}");
                None
            }
        }
    }

    pub async fn cache_set(&self, key: &str, value: &str, ttl: Duration) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            warn!("Redis cache_set failed for {key}: {e}");
        }
    }

    pub async fn cache_del(&self, key: &str) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let _: Result<(), _> = conn.del(key).await;
    }

    // -----------------------------------------------------------------------
    // Leader lock (ops metrics collector)
    // -----------------------------------------------------------------------

    /// Acquire or renew a leader lock. Returns None when Redis is unavailable
    /// so the caller can fall back to the database advisory lock.
    pub async fn try_leader_lock(&self, name: &str, ttl_secs: u64) -> Option<bool> {
        let mut conn = self.conn.clone()?;
        let res: Result<Option<String>, _> = redis::cmd("SET")
            .arg(name)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await;
        match res {
            Ok(Some(_)) => Some(true),
            Ok(None) => {
                // Renew if we are already the holder.
                match conn.get::<_, Option<String>>(name).await {
                    Ok(Some(holder)) if holder == self.instance_id => {
                        let _: Result<(), _> = conn.expire(name, ttl_secs as i64).await;
                        Some(true)
                    }
                    Ok(_) => Some(false),
                    Err(e) => {
                        warn!("Redis leader lock read failed: {e}");
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Redis try_leader_lock failed: {e}");
                None
            }
        }
    }
}
