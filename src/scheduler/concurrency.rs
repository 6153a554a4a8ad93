//! Per-account concurrency slots with FIFO waiters and TTL reclamation.
//!
//! A slot is held for the lifetime of one upstream request. Releasing hands
//! the slot directly to the oldest live waiter, so admission order is FIFO
//! and `in_flight` never exceeds the account's cap. Slots whose TTL elapses
//! without a release (crashed holder) are reclaimed by the cleanup worker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, warn};

use crate::error::GatewayError;

/// Opaque slot ownership token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderToken(u64);

struct Waiter {
    token: u64,
    admit: oneshot::Sender<()>,
}

#[derive(Default)]
struct AccountSlots {
    /// token -> last heartbeat
    holders: HashMap<u64, Instant>,
    waiters: VecDeque<Waiter>,
}

impl AccountSlots {
    /// Hand a freed slot to the oldest waiter that is still listening.
    fn wake_next(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            let token = waiter.token;
            if waiter.admit.send(()).is_ok() {
                self.holders.insert(token, Instant::now());
                return;
            }
            // Receiver gave up (timeout); try the next one.
        }
    }
}

pub struct SlotBroker {
    accounts: Mutex<HashMap<String, AccountSlots>>,
    slot_ttl: Duration,
    acquire_timeout: Duration,
    next_token: AtomicU64,
}

impl SlotBroker {
    pub fn new(slot_ttl: Duration, acquire_timeout: Duration) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            slot_ttl,
            acquire_timeout,
            next_token: AtomicU64::new(1),
        }
    }

    /// Reserve a slot on `account_id` with cap `max` (0 = unlimited).
    /// Admits immediately when under the cap; otherwise queues FIFO and waits
    /// up to the acquire timeout. Returns the holder token and how many
    /// waiters were ahead at enqueue time.
    pub async fn acquire(
        &self,
        account_id: &str,
        max: i64,
    ) -> Result<(HolderToken, usize), GatewayError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let (rx, ahead) = {
            let mut accounts = self.accounts.lock().await;
            let slots = accounts.entry(account_id.to_string()).or_default();

            if max <= 0 || (slots.holders.len() as i64) < max {
                slots.holders.insert(token, Instant::now());
                return Ok((HolderToken(token), 0));
            }

            let (tx, rx) = oneshot::channel();
            slots.waiters.push_back(Waiter { token, admit: tx });
            let ahead = slots.waiters.len();
            debug!(account_id, ahead, "queued for account slot");
            (rx, ahead)
        };

        match tokio::time::timeout(self.acquire_timeout, rx).await {
            Ok(Ok(())) => Ok((HolderToken(token), ahead)),
            _ => {
                // Timed out (or the broker dropped us): withdraw from the queue.
                let mut accounts = self.accounts.lock().await;
                if let Some(slots) = accounts.get_mut(account_id) {
                    slots.waiters.retain(|w| w.token != token);
                    // A release may have admitted us concurrently with the
                    // timeout; give that slot back.
                    if slots.holders.remove(&token).is_some() {
                        slots.wake_next();
                    }
                }
                Err(GatewayError::Timeout(format!(
                    "timed out waiting for a slot on account {account_id}"
                )))
            }
        }
    }

    /// Release a slot. Double release is a no-op: the token is spent on the
    /// first call.
    pub async fn release(&self, account_id: &str, token: HolderToken) {
        let mut accounts = self.accounts.lock().await;
        if let Some(slots) = accounts.get_mut(account_id)
            && slots.holders.remove(&token.0).is_some()
        {
            slots.wake_next();
        }
    }

    /// Refresh a holder's TTL while its request is still running.
    pub async fn heartbeat(&self, account_id: &str, token: HolderToken) {
        let mut accounts = self.accounts.lock().await;
        if let Some(slots) = accounts.get_mut(account_id)
            && let Some(at) = slots.holders.get_mut(&token.0)
        {
            *at = Instant::now();
        }
    }

    /// `(in_flight, waiting)` per account id, for dashboards and tie-breaks.
    pub async fn load_batch(&self, account_ids: &[String]) -> Vec<(String, usize, usize)> {
        let accounts = self.accounts.lock().await;
        account_ids
            .iter()
            .map(|id| {
                let (in_flight, waiting) = accounts
                    .get(id)
                    .map(|s| (s.holders.len(), s.waiters.len()))
                    .unwrap_or((0, 0));
                (id.clone(), in_flight, waiting)
            })
            .collect()
    }

    /// Reclaim slots whose TTL elapsed without a release.
    pub async fn reclaim_expired(&self) -> usize {
        let mut accounts = self.accounts.lock().await;
        let mut reclaimed = 0;
        for (account_id, slots) in accounts.iter_mut() {
            let expired: Vec<u64> = slots
                .holders
                .iter()
                .filter(|(_, at)| at.elapsed() >= self.slot_ttl)
                .map(|(token, _)| *token)
                .collect();
            for token in expired {
                warn!(account_id, token, "reclaiming expired concurrency slot");
                slots.holders.remove(&token);
                slots.wake_next();
                reclaimed += 1;
            }
        }
        accounts.retain(|_, s| !s.holders.is_empty() || !s.waiters.is_empty());
        reclaimed
    }

    /// Cleanup loop; runs until `stop` flips to true.
    pub async fn run_cleanup(&self, interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reclaim_expired().await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn broker() -> SlotBroker {
        SlotBroker::new(Duration::from_secs(600), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn acquire_release_round_trips() {
        let broker = broker();
        let (token, ahead) = broker.acquire("a", 2).await.unwrap();
        assert_eq!(ahead, 0);
        let load = broker.load_batch(&["a".to_string()]).await;
        assert_eq!(load[0].1, 1);

        broker.release("a", token).await;
        let load = broker.load_batch(&["a".to_string()]).await;
        assert_eq!(load[0].1, 0);
    }

    #[tokio::test]
    async fn double_release_is_noop() {
        let broker = broker();
        let (t1, _) = broker.acquire("a", 1).await.unwrap();
        let (t2, _) = broker.acquire("a", 2).await.unwrap();
        broker.release("a", t1).await;
        broker.release("a", t1).await;
        let load = broker.load_batch(&["a".to_string()]).await;
        assert_eq!(load[0].1, 1);
        broker.release("a", t2).await;
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_cap_and_waiters_are_fifo() {
        let broker = Arc::new(SlotBroker::new(
            Duration::from_secs(600),
            Duration::from_secs(5),
        ));
        let (t1, _) = broker.acquire("a", 1).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let broker = broker.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let (token, _) = broker.acquire("a", 1).await.unwrap();
                order.lock().await.push(i);
                let load = broker.load_batch(&["a".to_string()]).await;
                assert!(load[0].1 <= 1);
                broker.release("a", token).await;
            }));
            // Stagger enqueue so FIFO order is deterministic.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        broker.release("a", t1).await;
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn acquire_times_out_when_saturated() {
        let broker = broker();
        let (_held, _) = broker.acquire("a", 1).await.unwrap();
        let err = broker.acquire("a", 1).await.unwrap_err();
        assert_eq!(err.kind(), "TIMEOUT");
        // The timed-out waiter must not linger in the queue.
        let load = broker.load_batch(&["a".to_string()]).await;
        assert_eq!(load[0].2, 0);
    }

    #[tokio::test]
    async fn zero_cap_means_unlimited() {
        let broker = broker();
        for _ in 0..50 {
            broker.acquire("a", 0).await.unwrap();
        }
        let load = broker.load_batch(&["a".to_string()]).await;
        assert_eq!(load[0].1, 50);
    }

    #[tokio::test]
    async fn expired_slots_are_reclaimed_and_waiters_admitted() {
        let broker = Arc::new(SlotBroker::new(
            Duration::from_millis(50),
            Duration::from_secs(5),
        ));
        let (_leaked, _) = broker.acquire("a", 1).await.unwrap();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.acquire("a", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(broker.reclaim_expired().await, 1);
        let (token, _) = waiter.await.unwrap().unwrap();
        broker.release("a", token).await;
    }
}
