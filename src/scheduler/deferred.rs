//! One-shot deferred jobs: re-activating accounts whose rate-limit /
//! overload / temp-unschedulable windows have elapsed.
//!
//! Single-owner worker draining a binary heap on a coarse tick. Firing is
//! at-least-once, on or after `fire_at`; jobs must be idempotent (ours are
//! conditional UPDATEs).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::store::now_secs;

/// Default tick granularity.
const TICK: Duration = Duration::from_secs(10);

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Entry {
    fire_at: i64,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.fire_at, self.seq).cmp(&(other.fire_at, other.seq))
    }
}

#[derive(Clone)]
pub struct DeferredScheduler {
    tx: mpsc::UnboundedSender<Entry>,
}

impl DeferredScheduler {
    /// Spawn the worker with the default tick. The worker exits when `stop`
    /// flips to true or every handle is dropped.
    pub fn start(stop: watch::Receiver<bool>) -> Self {
        Self::start_with_tick(stop, TICK)
    }

    pub fn start_with_tick(mut stop: watch::Receiver<bool>, tick: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Entry>();

        tokio::spawn(async move {
            let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    entry = rx.recv() => {
                        match entry {
                            Some(entry) => heap.push(Reverse(entry)),
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        let now = now_secs();
                        while heap.peek().is_some_and(|Reverse(e)| e.fire_at <= now) {
                            let Reverse(entry) = heap.pop().unwrap();
                            debug!(fire_at = entry.fire_at, "firing deferred job");
                            entry.job.await;
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("deferred scheduler stopped");
        });

        Self { tx }
    }

    /// Schedule `job` to run on or after `fire_at` (unix seconds).
    pub fn schedule_at<F>(&self, fire_at: i64, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if self
            .tx
            .send(Entry {
                fire_at,
                seq,
                job: Box::pin(job),
            })
            .is_err()
        {
            warn!("deferred scheduler is stopped; dropping job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fires_due_jobs_and_holds_future_ones() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let scheduler =
            DeferredScheduler::start_with_tick(stop_rx, Duration::from_millis(20));

        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        scheduler.schedule_at(now_secs() - 1, async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = fired.clone();
        scheduler.schedule_at(now_secs() + 3600, async move {
            f.fetch_add(100, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_signal_halts_worker() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler =
            DeferredScheduler::start_with_tick(stop_rx, Duration::from_millis(20));
        stop_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        scheduler.schedule_at(now_secs() - 1, async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
