//! Synchronization Throttler (C3, spec §4.3): caps concurrent full-state
//! synchronizations on one socket.

use crate::clock::SharedClock;
use crate::model::AccountId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;
use tokio::sync::oneshot;

struct ActiveEntry {
    account_id: AccountId,
    last_updated: SystemTime,
}

struct Waiter {
    account_id: AccountId,
    synchronization_id: String,
    ready: oneshot::Sender<()>,
}

struct Inner {
    active: HashMap<String, ActiveEntry>,
    queue: VecDeque<Waiter>,
    last_sync_id_by_account: HashMap<AccountId, String>,
}

/// Caps the number of synchronizations concurrently in flight on one
/// socket, queueing the rest and deduplicating per-account re-entry.
pub struct SynchronizationThrottler {
    clock: SharedClock,
    max_concurrent: usize,
    inner: Mutex<Inner>,
}

impl SynchronizationThrottler {
    pub fn new(clock: SharedClock, max_concurrent: usize) -> Self {
        Self {
            clock,
            max_concurrent,
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                queue: VecDeque::new(),
                last_sync_id_by_account: HashMap::new(),
            }),
        }
    }

    /// Returns once `synchronization_id` has been admitted (either
    /// immediately, or after waiting for a free slot). If the same
    /// account already has an outstanding sync, it is cancelled first.
    pub async fn schedule_synchronize(&self, account_id: AccountId, synchronization_id: String) {
        let rx = {
            let mut inner = self.inner.lock();

            if let Some(previous_id) = inner.last_sync_id_by_account.get(&account_id).cloned()
                && previous_id != synchronization_id
            {
                inner.active.remove(&previous_id);
                inner.queue.retain(|w| w.synchronization_id != previous_id);
            }
            inner.last_sync_id_by_account.insert(account_id.clone(), synchronization_id.clone());

            if inner.active.len() < self.max_concurrent {
                inner.active.insert(
                    synchronization_id.clone(),
                    ActiveEntry {
                        account_id: account_id.clone(),
                        last_updated: self.clock.now(),
                    },
                );
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.queue.push_back(Waiter {
                    account_id,
                    synchronization_id: synchronization_id.clone(),
                    ready: tx,
                });
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            let _ = rx.await;
            let mut inner = self.inner.lock();
            inner.active.insert(
                synchronization_id,
                ActiveEntry {
                    account_id: String::new(),
                    last_updated: self.clock.now(),
                },
            );
        }
    }

    /// Refreshes an active entry's liveness so slow producers aren't
    /// mistaken for stalled ones.
    pub fn update_synchronization_id(&self, synchronization_id: &str) {
        if let Some(entry) = self.inner.lock().active.get_mut(synchronization_id) {
            entry.last_updated = self.clock.now();
        }
    }

    pub fn remove_synchronization_id(&self, synchronization_id: &str) {
        let mut inner = self.inner.lock();
        inner.active.remove(synchronization_id);
        inner.queue.retain(|w| w.synchronization_id != synchronization_id);
        self.wake_next(&mut inner);
    }

    pub fn remove_by_account(&self, account_id: &str) {
        let mut inner = self.inner.lock();
        let matching: Vec<String> = inner
            .active
            .iter()
            .filter(|(_, e)| e.account_id == account_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in matching {
            inner.active.remove(&id);
        }
        inner.queue.retain(|w| w.account_id != account_id);
        self.wake_next(&mut inner);
    }

    pub fn on_disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.active.clear();
        while let Some(waiter) = inner.queue.pop_front() {
            let _ = waiter.ready.send(());
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Whether `synchronization_id` is currently in this socket's active
    /// set (spec §4.7: inbound events carrying an unknown id are noop'd).
    pub fn is_active(&self, synchronization_id: &str) -> bool {
        self.inner.lock().active.contains_key(synchronization_id)
    }

    fn wake_next(&self, inner: &mut Inner) {
        while inner.active.len() < self.max_concurrent {
            let Some(waiter) = inner.queue.pop_front() else { break };
            if waiter.ready.send(()).is_err() {
                // waiter gave up; don't consume a slot for it.
                continue;
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_immediately_under_capacity() {
        let throttler = SynchronizationThrottler::new(crate::clock::system_clock(), 2);
        throttler.schedule_synchronize("A".into(), "s1".into()).await;
        throttler.schedule_synchronize("B".into(), "s2".into()).await;
        assert_eq!(throttler.active_count(), 2);
    }

    #[tokio::test]
    async fn queues_beyond_capacity_and_wakes_on_release() {
        let throttler = Arc::new(SynchronizationThrottler::new(crate::clock::system_clock(), 1));
        throttler.schedule_synchronize("A".into(), "s1".into()).await;
        assert_eq!(throttler.active_count(), 1);

        let t2 = throttler.clone();
        let handle = tokio::spawn(async move {
            t2.schedule_synchronize("B".into(), "s2".into()).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        throttler.remove_synchronization_id("s1");
        handle.await.unwrap();
        assert_eq!(throttler.active_count(), 1);
    }

    #[tokio::test]
    async fn second_sync_for_same_account_cancels_first() {
        let throttler = SynchronizationThrottler::new(crate::clock::system_clock(), 5);
        throttler.schedule_synchronize("A".into(), "s1".into()).await;
        throttler.schedule_synchronize("A".into(), "s2".into()).await;
        assert_eq!(throttler.active_count(), 1);
    }
}
