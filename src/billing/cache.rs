//! Read-through billing caches and the bounded write-back worker pool.
//!
//! Reads go Redis → database, refilling the cache on miss. Writes are queued
//! non-blockingly onto a capacity-1000 channel drained by up to ten
//! concurrent writers. When the queue is full, critical writes (balance
//! deduction, subscription usage) fall back to a synchronous write; cache
//! warming is dropped with a throttled warning.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::redis::RedisStore;
use crate::store::{SubscriptionStore, UserStore, UserSubscription, now_millis, now_secs};

/// Queue capacity.
const QUEUE_CAPACITY: usize = 1000;

/// Concurrent write-back workers.
const WORKERS: usize = 10;

/// Per-task (and sync-fallback) write timeout.
const TASK_TIMEOUT: Duration = Duration::from_secs(2);

/// Cached balance / subscription snapshot lifetime.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Minimum gap between dropped-task warnings.
const WARN_INTERVAL_MS: i64 = 5000;

#[derive(Debug)]
pub enum WriteBackTask {
    /// Cache warming: push a known balance into Redis.
    SetBalance { user_id: String, balance: f64 },
    /// Cache warming: push a subscription snapshot into Redis.
    SetSubscription {
        user_id: String,
        group_id: String,
        subscription: Box<UserSubscription>,
    },
    /// Critical: debit the authoritative balance.
    DeductBalance { user_id: String, amount: f64 },
    /// Critical: apply metered cost to the subscription windows.
    UpdateSubscriptionUsage {
        subscription_id: String,
        user_id: String,
        group_id: String,
        cost: f64,
    },
}

impl WriteBackTask {
    fn is_critical(&self) -> bool {
        matches!(
            self,
            WriteBackTask::DeductBalance { .. } | WriteBackTask::UpdateSubscriptionUsage { .. }
        )
    }
}

pub struct BillingCache {
    users: UserStore,
    subscriptions: SubscriptionStore,
    redis: RedisStore,
    tx: StdMutex<Option<mpsc::Sender<WriteBackTask>>>,
    drain: StdMutex<Option<JoinHandle<()>>>,
    last_drop_warn_ms: AtomicI64,
}

fn balance_key(user_id: &str) -> String {
    format!("billing:balance:{user_id}")
}

fn sub_key(user_id: &str, group_id: &str) -> String {
    format!("billing:sub:{user_id}:{group_id}")
}

impl BillingCache {
    pub fn new(users: UserStore, subscriptions: SubscriptionStore, redis: RedisStore) -> Self {
        let (tx, rx) = mpsc::channel::<WriteBackTask>(QUEUE_CAPACITY);

        let worker_redis = redis.clone();
        let drain = tokio::spawn(async move {
            let mut pipeline = ReceiverStream::new(rx)
                .map(|task| {
                    let redis = worker_redis.clone();
                    async move {
                        if let Err(e) = tokio::time::timeout(
                            TASK_TIMEOUT,
                            execute_task(&UserStore::new(), &SubscriptionStore::new(), &redis, task),
                        )
                        .await
                        {
                            warn!("billing write-back task timed out: {e}");
                        }
                    }
                })
                .buffer_unordered(WORKERS);
            while pipeline.next().await.is_some() {}
            info!("billing write-back pool drained");
        });

        Self {
            users,
            subscriptions,
            redis,
            tx: StdMutex::new(Some(tx)),
            drain: StdMutex::new(Some(drain)),
            last_drop_warn_ms: AtomicI64::new(0),
        }
    }

    // -----------------------------------------------------------------------
    // Read-through paths
    // -----------------------------------------------------------------------

    /// The user's balance, cache first.
    pub async fn get_user_balance(&self, user_id: &str) -> Result<f64, GatewayError> {
        if let Some(cached) = self.redis.cache_get(&balance_key(user_id)).await
            && let Ok(balance) = cached.parse::<f64>()
        {
            return Ok(balance);
        }

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or(GatewayError::UserNotFound)?;
        self.queue(WriteBackTask::SetBalance {
            user_id: user_id.to_string(),
            balance: user.balance,
        });
        Ok(user.balance)
    }

    /// The user's subscription for a group, cache first.
    pub async fn get_subscription(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<Option<UserSubscription>, GatewayError> {
        if let Some(cached) = self.redis.cache_get(&sub_key(user_id, group_id)).await
            && let Ok(sub) = serde_json::from_str::<UserSubscription>(&cached)
        {
            return Ok(Some(sub));
        }

        let sub = self.subscriptions.get(user_id, group_id).await?;
        if let Some(sub) = &sub {
            self.queue(WriteBackTask::SetSubscription {
                user_id: user_id.to_string(),
                group_id: group_id.to_string(),
                subscription: Box::new(sub.clone()),
            });
        }
        Ok(sub)
    }

    pub async fn invalidate_user(&self, user_id: &str) {
        self.redis.cache_del(&balance_key(user_id)).await;
    }

    pub async fn invalidate_subscription(&self, user_id: &str, group_id: &str) {
        self.redis.cache_del(&sub_key(user_id, group_id)).await;
    }

    // -----------------------------------------------------------------------
    // Write paths
    // -----------------------------------------------------------------------

    /// Queue a balance debit; falls back to a synchronous 2s write when the
    /// queue is full.
    pub async fn queue_deduct_balance(&self, user_id: &str, amount: f64) {
        self.queue_critical(WriteBackTask::DeductBalance {
            user_id: user_id.to_string(),
            amount,
        })
        .await;
    }

    /// Queue subscription usage; same full-queue fallback as balance debits.
    pub async fn queue_subscription_usage(
        &self,
        subscription_id: &str,
        user_id: &str,
        group_id: &str,
        cost: f64,
    ) {
        self.queue_critical(WriteBackTask::UpdateSubscriptionUsage {
            subscription_id: subscription_id.to_string(),
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
            cost,
        })
        .await;
    }

    /// Synchronous balance debit (admin paths and the sync fallback).
    pub async fn deduct_balance(&self, user_id: &str, amount: f64) -> Result<(), GatewayError> {
        self.users.debit_balance(user_id, amount).await?;
        self.invalidate_user(user_id).await;
        Ok(())
    }

    /// Non-blocking enqueue. Critical tasks that cannot be queued are written
    /// synchronously instead of dropped.
    fn queue(&self, task: WriteBackTask) {
        debug_assert!(!task.is_critical(), "critical tasks go through queue_critical");
        let tx = self.tx.lock().unwrap().clone();
        let Some(tx) = tx else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(task) {
            let now = now_millis();
            let last = self.last_drop_warn_ms.load(Ordering::Relaxed);
            if now - last >= WARN_INTERVAL_MS
                && self
                    .last_drop_warn_ms
                    .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                warn!("billing write-back queue full; dropping cache-warming task");
            }
        }
    }

    async fn queue_critical(&self, task: WriteBackTask) {
        let tx = self.tx.lock().unwrap().clone();
        let Some(tx) = tx else {
            self.execute_now(task).await;
            return;
        };
        match tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task))
            | Err(mpsc::error::TrySendError::Closed(task)) => {
                self.execute_now(task).await;
            }
        }
    }

    async fn execute_now(&self, task: WriteBackTask) {
        if let Err(e) = tokio::time::timeout(
            TASK_TIMEOUT,
            execute_task(&self.users, &self.subscriptions, &self.redis, task),
        )
        .await
        {
            warn!("synchronous billing write timed out: {e}");
        }
    }

    /// Close the queue exactly once, drain remaining tasks, and join the
    /// workers.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let drain = self.drain.lock().unwrap().take();
        if let Some(drain) = drain {
            let _ = drain.await;
        }
    }
}

async fn execute_task(
    users: &UserStore,
    subscriptions: &SubscriptionStore,
    redis: &RedisStore,
    task: WriteBackTask,
) {
    match task {
        WriteBackTask::SetBalance { user_id, balance } => {
            redis
                .cache_set(&balance_key(&user_id), &balance.to_string(), CACHE_TTL)
                .await;
        }
        WriteBackTask::SetSubscription {
            user_id,
            group_id,
            subscription,
        } => {
            if let Ok(json) = serde_json::to_string(&*subscription) {
                redis
                    .cache_set(&sub_key(&user_id, &group_id), &json, CACHE_TTL)
                    .await;
            }
        }
        WriteBackTask::DeductBalance { user_id, amount } => {
            if let Err(e) = users.debit_balance(&user_id, amount).await {
                warn!("balance debit write-back failed for {user_id}: {e}");
            }
            redis.cache_del(&balance_key(&user_id)).await;
        }
        WriteBackTask::UpdateSubscriptionUsage {
            subscription_id,
            user_id,
            group_id,
            cost,
        } => {
            if let Err(e) = subscriptions
                .record_usage(&subscription_id, cost, now_secs())
                .await
            {
                warn!("subscription usage write-back failed for {subscription_id}: {e}");
            }
            redis.cache_del(&sub_key(&user_id, &group_id)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::User;
    use uuid::Uuid;

    fn new_user(balance: f64) -> User {
        User {
            id: Uuid::new_v4().to_string(),
            email: format!("{}@example.com", Uuid::new_v4()),
            role: "user".into(),
            status: "active".into(),
            balance,
            concurrency: 0,
            allowed_groups: Vec::new(),
            token_version: 0,
            created_at: 0,
        }
    }

    fn cache() -> BillingCache {
        BillingCache::new(UserStore::new(), SubscriptionStore::new(), RedisStore::disabled())
    }

    #[tokio::test]
    async fn balance_read_falls_through_to_db() {
        crate::db::init_memory().await.unwrap();
        let users = UserStore::new();
        let user = new_user(12.5);
        users.create(&user).await.unwrap();

        let cache = cache();
        let balance = cache.get_user_balance(&user.id).await.unwrap();
        assert!((balance - 12.5).abs() < 1e-9);

        let err = cache.get_user_balance("missing-user").await.unwrap_err();
        assert_eq!(err.kind(), "USER_NOT_FOUND");
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn queued_deduction_lands_in_db() {
        crate::db::init_memory().await.unwrap();
        let users = UserStore::new();
        let user = new_user(10.0);
        users.create(&user).await.unwrap();

        let cache = cache();
        cache.queue_deduct_balance(&user.id, 4.0).await;
        // Shutdown drains the queue, so the write is applied.
        cache.shutdown().await;

        let loaded = users.get(&user.id).await.unwrap().unwrap();
        assert!((loaded.balance - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn critical_writes_survive_a_closed_queue() {
        crate::db::init_memory().await.unwrap();
        let users = UserStore::new();
        let user = new_user(10.0);
        users.create(&user).await.unwrap();

        let cache = cache();
        cache.shutdown().await;
        // Queue is gone: the deduction takes the synchronous path.
        cache.queue_deduct_balance(&user.id, 2.5).await;

        let loaded = users.get(&user.id).await.unwrap().unwrap();
        assert!((loaded.balance - 7.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        crate::db::init_memory().await.unwrap();
        let cache = cache();
        cache.shutdown().await;
        cache.shutdown().await;
    }
}
