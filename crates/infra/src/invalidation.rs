//! Delayed second invalidation of role cache entries.
//!
//! After a user's roles change, a reader that fetched the old roles from the
//! catalog just before the commit may backfill them into the cache just after
//! the writer refreshed it. Deleting the key again once a grace delay has
//! passed bounds that stale window.
//!
//! One worker task owns a deadline queue fed over a channel. Scheduling never
//! blocks the caller. Pending work is not persisted: if the process exits
//! inside the grace window the second delete is lost and the entry TTL is the
//! backstop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use warden_core::UserId;

use crate::cache::RoleMembershipCache;
use crate::config::duration_millis;

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> InvalidationStats {
        InvalidationStats {
            scheduled: self.scheduled.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Pending {
    due: Instant,
    seq: u64,
    user: UserId,
}

/// Handle used to queue delayed invalidations.
///
/// Cloning is cheap; the worker stops once every handle is dropped and the
/// queue has drained.
#[derive(Debug, Clone)]
pub struct InvalidationScheduler {
    tx: mpsc::UnboundedSender<Pending>,
    grace: Duration,
    seq: Arc<AtomicU64>,
    counters: Arc<Counters>,
}

impl InvalidationScheduler {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(cache: RoleMembershipCache, grace: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let join = tokio::spawn(run_worker(cache, rx, counters.clone()));

        let scheduler = Self {
            tx,
            grace,
            seq: Arc::new(AtomicU64::new(0)),
            counters,
        };
        (scheduler, join)
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Delete `user`'s cache entry once the grace delay has passed.
    pub fn schedule(&self, user: UserId) {
        let pending = Pending {
            due: Instant::now() + self.grace,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            user,
        };
        if self.tx.send(pending).is_err() {
            error!(user_id = %user, consistency = "critical", "invalidation worker is gone; delayed invalidation dropped");
            return;
        }
        self.counters.scheduled.fetch_add(1, Ordering::SeqCst);
        debug!(user_id = %user, grace_ms = duration_millis(self.grace), "delayed invalidation scheduled");
    }

    pub fn stats(&self) -> InvalidationStats {
        self.counters.snapshot()
    }
}

async fn run_worker(
    cache: RoleMembershipCache,
    mut rx: mpsc::UnboundedReceiver<Pending>,
    counters: Arc<Counters>,
) {
    let mut queue: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();
    let mut open = true;

    loop {
        let next_due = queue.peek().map(|Reverse(p)| p.due);
        if !open && next_due.is_none() {
            break;
        }

        tokio::select! {
            msg = rx.recv(), if open => match msg {
                Some(pending) => queue.push(Reverse(pending)),
                None => open = false,
            },
            _ = sleep_until(next_due), if next_due.is_some() => {
                let now = Instant::now();
                while let Some(Reverse(p)) = queue.peek() {
                    if p.due > now {
                        break;
                    }
                    let user = p.user;
                    queue.pop();
                    invalidate(&cache, user, &counters).await;
                }
            }
        }
    }

    debug!("invalidation worker stopped");
}

async fn sleep_until(due: Option<Instant>) {
    if let Some(due) = due {
        tokio::time::sleep_until(due).await;
    }
}

async fn invalidate(cache: &RoleMembershipCache, user: UserId, counters: &Counters) {
    match cache.invalidate(user).await {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::SeqCst);
            info!(user_id = %user, "delayed role cache invalidation done");
        }
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            error!(
                user_id = %user,
                error = %err,
                consistency = "critical",
                "delayed role cache invalidation failed; entry lives until TTL"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemorySetCache;
    use warden_auth::RoleSet;

    fn cache() -> (Arc<InMemorySetCache>, RoleMembershipCache) {
        let backend = Arc::new(InMemorySetCache::new());
        let cache = RoleMembershipCache::new(
            backend.clone(),
            "warden",
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        (backend, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_deleted_after_grace_delay() {
        let (_backend, cache) = cache();
        let (scheduler, _join) = InvalidationScheduler::spawn(cache.clone(), Duration::from_secs(5));
        let user = UserId::new(42);

        cache.set(user, &RoleSet::Empty, None).await.unwrap();
        scheduler.schedule(user);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(cache.get(user).await.unwrap(), Some(RoleSet::Empty));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.get(user).await.unwrap(), None);
        assert_eq!(
            scheduler.stats(),
            InvalidationStats {
                scheduled: 1,
                completed: 1,
                failed: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn later_deadlines_do_not_delay_earlier_ones() {
        let (_backend, cache) = cache();
        let (scheduler, _join) = InvalidationScheduler::spawn(cache.clone(), Duration::from_secs(5));

        cache.set(UserId::new(1), &RoleSet::Empty, None).await.unwrap();
        cache.set(UserId::new(2), &RoleSet::Empty, None).await.unwrap();

        scheduler.schedule(UserId::new(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.schedule(UserId::new(2));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(cache.get(UserId::new(1)).await.unwrap(), None);
        assert_eq!(cache.get(UserId::new(2)).await.unwrap(), Some(RoleSet::Empty));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cache.get(UserId::new(2)).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_not_retried() {
        let (backend, cache) = cache();
        let (scheduler, _join) = InvalidationScheduler::spawn(cache, Duration::from_secs(1));

        backend.set_unavailable(true);
        scheduler.schedule(UserId::new(5));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(scheduler.stats().failed, 1);
        assert_eq!(scheduler.stats().completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_drains_queue_after_handles_drop() {
        let (_backend, cache) = cache();
        let (scheduler, join) = InvalidationScheduler::spawn(cache.clone(), Duration::from_secs(1));

        cache.set(UserId::new(3), &RoleSet::Empty, None).await.unwrap();
        scheduler.schedule(UserId::new(3));
        drop(scheduler);

        join.await.unwrap();
        assert_eq!(cache.get(UserId::new(3)).await.unwrap(), None);
    }
}
