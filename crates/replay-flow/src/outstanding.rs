// Outstanding-work bookkeeping behind the gate.
//
// Every chunk handed to the consumer is registered with the number of
// completion signals it still owes and the cost it holds against a shared
// pool. The pool is a semaphore sized to the max concurrent cost; permits are
// forgotten on acquire and added back when the last signal for a key arrives,
// so held cost is always `capacity - available_permits`. A batch stays staged
// until its cost is acquired; signals for staged keys are refused so no
// permits are returned that were never taken.
use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{FlowError, Result};
use crate::key::ConnectionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutstandingInfo {
    count_remaining: u32,
    cost: u32,
    committed: bool,
}

#[derive(Debug)]
pub struct OutstandingWorkTracker {
    infos: Mutex<HashMap<ConnectionKey, OutstandingInfo, RandomState>>,
    cost_gate: Semaphore,
    capacity: u32,
}

/// Registrations made for a batch whose cost has not been acquired yet.
///
/// Dropping the guard (e.g. the read future was cancelled while waiting for
/// capacity) removes the entries again; `commit` keeps them.
pub(crate) struct PendingRegistration<'a> {
    tracker: &'a OutstandingWorkTracker,
    keys: Vec<ConnectionKey>,
    total_cost: u64,
}

impl PendingRegistration<'_> {
    pub(crate) fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub(crate) fn commit(mut self) {
        let mut infos = self.tracker.infos.lock();
        for key in self.keys.drain(..) {
            if let Some(info) = infos.get_mut(&key) {
                info.committed = true;
            }
        }
    }
}

impl Drop for PendingRegistration<'_> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let mut infos = self.tracker.infos.lock();
        for key in self.keys.drain(..) {
            infos.remove(&key);
        }
        tracing::debug!(
            outstanding = infos.len(),
            "rolled back outstanding registrations for abandoned read"
        );
    }
}

impl OutstandingWorkTracker {
    pub fn new(max_concurrent_cost: u32) -> Result<Self> {
        let max = Semaphore::MAX_PERMITS.min(u32::MAX as usize) as u64;
        if max_concurrent_cost == 0 || u64::from(max_concurrent_cost) > max {
            return Err(FlowError::InvalidCapacity {
                requested: u64::from(max_concurrent_cost),
                max,
            });
        }
        Ok(Self {
            infos: Mutex::new(HashMap::with_hasher(RandomState::new())),
            cost_gate: Semaphore::new(max_concurrent_cost as usize),
            capacity: max_concurrent_cost,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn available_capacity(&self) -> u32 {
        self.cost_gate.available_permits() as u32
    }

    pub fn held_cost(&self) -> u32 {
        self.capacity.saturating_sub(self.available_capacity())
    }

    pub fn outstanding_count(&self) -> usize {
        self.infos.lock().len()
    }

    pub fn is_outstanding(&self, key: &ConnectionKey) -> bool {
        self.infos.lock().contains_key(key)
    }

    /// Signals still owed for `key`, if it is outstanding.
    pub fn remaining_signals(&self, key: &ConnectionKey) -> Option<u32> {
        self.infos.lock().get(key).map(|info| info.count_remaining)
    }

    /// Register a whole batch under one lock.
    ///
    /// Entries are `(key, expected_signals, cost)`. A chunk that expects no
    /// signals can never be released, so it is neither registered nor charged.
    /// Any duplicate (already outstanding, or repeated within the batch) fails
    /// the batch before anything is inserted.
    pub(crate) fn register_batch(
        &self,
        entries: impl IntoIterator<Item = (ConnectionKey, u32, u32)>,
    ) -> Result<PendingRegistration<'_>> {
        let mut infos = self.infos.lock();
        let mut staged: HashMap<ConnectionKey, OutstandingInfo, RandomState> =
            HashMap::with_hasher(RandomState::new());
        for (key, expected_signals, cost) in entries {
            if infos.contains_key(&key) || staged.contains_key(&key) {
                tracing::error!(key = %key, "duplicate outstanding registration");
                return Err(FlowError::DuplicateRegistration(key));
            }
            if expected_signals == 0 {
                tracing::trace!(key = %key, "chunk expects no completion signals; not tracked");
                continue;
            }
            staged.insert(
                key,
                OutstandingInfo {
                    count_remaining: expected_signals,
                    cost,
                    committed: false,
                },
            );
        }

        let total_cost = staged.values().map(|info| u64::from(info.cost)).sum::<u64>();
        if total_cost > u64::from(self.capacity) {
            return Err(FlowError::CostExceedsCapacity {
                requested: total_cost,
                capacity: self.capacity,
            });
        }

        let keys = staged.keys().cloned().collect::<Vec<_>>();
        infos.extend(staged);
        metrics::gauge!("replay_outstanding_chunks").set(infos.len() as f64);
        Ok(PendingRegistration {
            tracker: self,
            keys,
            total_cost,
        })
    }

    /// Wait until `cost` units are free and take them out of the pool.
    pub(crate) async fn acquire(&self, cost: u64) -> Result<()> {
        if cost == 0 {
            return Ok(());
        }
        let cost = u32::try_from(cost).map_err(|_| FlowError::CostExceedsCapacity {
            requested: cost,
            capacity: self.capacity,
        })?;
        tracing::debug!(
            available = self.available_capacity(),
            acquiring = cost,
            "acquiring outstanding cost"
        );
        let permits = self
            .cost_gate
            .acquire_many(cost)
            .await
            .map_err(|_| FlowError::InterruptedWait("outstanding cost gate closed"))?;
        permits.forget();
        metrics::gauge!("replay_outstanding_cost").set(f64::from(self.held_cost()));
        tracing::debug!(available = self.available_capacity(), "acquired outstanding cost");
        Ok(())
    }

    /// Record one completion signal for `key`.
    ///
    /// Returns the cost released back to the pool when this was the final
    /// signal. A key that is not outstanding is a contract violation.
    pub fn done_processing(&self, key: &ConnectionKey) -> Result<Option<u32>> {
        let released = {
            let mut infos = self.infos.lock();
            let Some(info) = infos.get_mut(key).filter(|info| info.committed) else {
                tracing::error!(key = %key, "completion signal for work that is not outstanding");
                return Err(FlowError::UnknownOutstandingKey(key.clone()));
            };
            tracing::debug!(key = %key, remaining = info.count_remaining, cost = info.cost, "done processing");
            info.count_remaining -= 1;
            if info.count_remaining > 0 {
                None
            } else {
                let cost = info.cost;
                infos.remove(key);
                metrics::gauge!("replay_outstanding_chunks").set(infos.len() as f64);
                Some(cost)
            }
        };
        if let Some(cost) = released {
            self.cost_gate.add_permits(cost as usize);
            metrics::gauge!("replay_outstanding_cost").set(f64::from(self.held_cost()));
            tracing::debug!(
                key = %key,
                released = cost,
                available = self.available_capacity(),
                "released outstanding cost"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(id: &str, index: u32) -> ConnectionKey {
        ConnectionKey::new(id, index)
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = OutstandingWorkTracker::new(0).expect_err("capacity");
        assert!(matches!(err, FlowError::InvalidCapacity { requested: 0, .. }));
    }

    #[tokio::test]
    async fn cost_is_held_until_last_signal() {
        let tracker = OutstandingWorkTracker::new(10).expect("tracker");
        let pending = tracker
            .register_batch([(key("a", 0), 2, 4), (key("b", 0), 1, 3)])
            .expect("register");
        assert_eq!(pending.total_cost(), 7);
        tracker.acquire(pending.total_cost()).await.expect("acquire");
        pending.commit();
        assert_eq!(tracker.held_cost(), 7);
        assert_eq!(tracker.available_capacity(), 3);

        assert_eq!(tracker.done_processing(&key("a", 0)).expect("a"), None);
        assert_eq!(tracker.remaining_signals(&key("a", 0)), Some(1));
        assert_eq!(tracker.held_cost(), 7);

        assert_eq!(tracker.done_processing(&key("a", 0)).expect("a"), Some(4));
        assert!(!tracker.is_outstanding(&key("a", 0)));
        assert_eq!(tracker.held_cost(), 3);

        assert_eq!(tracker.done_processing(&key("b", 0)).expect("b"), Some(3));
        assert_eq!(tracker.held_cost(), 0);
        assert_eq!(tracker.available_capacity(), 10);
        assert_eq!(tracker.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn extra_signal_after_release_is_a_contract_violation() {
        let tracker = OutstandingWorkTracker::new(4).expect("tracker");
        let pending = tracker.register_batch([(key("a", 0), 1, 2)]).expect("register");
        tracker.acquire(pending.total_cost()).await.expect("acquire");
        pending.commit();
        tracker.done_processing(&key("a", 0)).expect("first");

        let err = tracker.done_processing(&key("a", 0)).expect_err("second");
        assert!(matches!(err, FlowError::UnknownOutstandingKey(_)));
        assert_eq!(tracker.available_capacity(), 4);
    }

    #[test]
    fn unknown_key_is_a_contract_violation() {
        let tracker = OutstandingWorkTracker::new(4).expect("tracker");
        let err = tracker.done_processing(&key("ghost", 9)).expect_err("unknown");
        assert!(err.is_contract_violation());
    }

    #[test]
    fn duplicate_registration_fails_without_partial_insert() {
        let tracker = OutstandingWorkTracker::new(10).expect("tracker");
        tracker
            .register_batch([(key("a", 0), 1, 1)])
            .expect("first")
            .commit();

        let err = tracker
            .register_batch([(key("b", 0), 1, 1), (key("a", 0), 1, 1)])
            .err()
            .expect("duplicate");
        assert!(matches!(err, FlowError::DuplicateRegistration(k) if k == key("a", 0)));
        assert!(!tracker.is_outstanding(&key("b", 0)));
        assert_eq!(tracker.outstanding_count(), 1);
    }

    #[test]
    fn duplicate_within_one_batch_is_rejected() {
        let tracker = OutstandingWorkTracker::new(10).expect("tracker");
        let err = tracker
            .register_batch([(key("a", 0), 1, 1), (key("a", 0), 1, 1)])
            .err()
            .expect("duplicate");
        assert!(matches!(err, FlowError::DuplicateRegistration(_)));
        assert_eq!(tracker.outstanding_count(), 0);
    }

    #[test]
    fn batch_larger_than_capacity_is_rejected() {
        let tracker = OutstandingWorkTracker::new(5).expect("tracker");
        let err = tracker
            .register_batch([(key("a", 0), 1, 3), (key("b", 0), 1, 3)])
            .err()
            .expect("too big");
        assert!(matches!(
            err,
            FlowError::CostExceedsCapacity {
                requested: 6,
                capacity: 5
            }
        ));
        assert_eq!(tracker.outstanding_count(), 0);
    }

    #[test]
    fn chunks_expecting_no_signals_are_not_tracked() {
        let tracker = OutstandingWorkTracker::new(5).expect("tracker");
        let pending = tracker.register_batch([(key("a", 0), 0, 5)]).expect("register");
        assert_eq!(pending.total_cost(), 0);
        pending.commit();
        assert_eq!(tracker.outstanding_count(), 0);
    }

    #[test]
    fn dropped_registration_rolls_back() {
        let tracker = OutstandingWorkTracker::new(5).expect("tracker");
        let pending = tracker.register_batch([(key("a", 0), 1, 2)]).expect("register");
        assert!(tracker.is_outstanding(&key("a", 0)));
        drop(pending);
        assert!(!tracker.is_outstanding(&key("a", 0)));
    }

    #[tokio::test]
    async fn signal_for_uncharged_batch_is_refused() {
        let tracker = OutstandingWorkTracker::new(4).expect("tracker");
        let pending = tracker.register_batch([(key("a", 0), 1, 3)]).expect("register");
        assert!(tracker.is_outstanding(&key("a", 0)));

        let err = tracker.done_processing(&key("a", 0)).expect_err("not charged yet");
        assert!(matches!(err, FlowError::UnknownOutstandingKey(_)));
        assert_eq!(tracker.available_capacity(), 4);
        assert_eq!(tracker.held_cost(), 0);

        tracker.acquire(pending.total_cost()).await.expect("acquire");
        pending.commit();
        assert_eq!(tracker.held_cost(), 3);
        assert_eq!(tracker.done_processing(&key("a", 0)).expect("signal"), Some(3));
        assert_eq!(tracker.available_capacity(), 4);
    }

    #[tokio::test]
    async fn acquire_waits_for_released_cost() {
        let tracker = Arc::new(OutstandingWorkTracker::new(4).expect("tracker"));
        tracker
            .register_batch([(key("a", 0), 1, 4)])
            .expect("register")
            .commit();
        tracker.acquire(4).await.expect("acquire");

        let blocked = tokio::time::timeout(Duration::from_millis(20), tracker.acquire(1)).await;
        assert!(blocked.is_err(), "pool is exhausted");

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.acquire(2).await })
        };
        tracker.done_processing(&key("a", 0)).expect("release");
        waiter.await.expect("join").expect("acquire");
        assert_eq!(tracker.held_cost(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_signals_release_cost_exactly_once() {
        let tracker = Arc::new(OutstandingWorkTracker::new(64).expect("tracker"));
        let entries = (0..16).map(|i| (key("conn", i), 8, 4)).collect::<Vec<_>>();
        let pending = tracker.register_batch(entries).expect("register");
        tracker.acquire(pending.total_cost()).await.expect("acquire");
        pending.commit();
        assert_eq!(tracker.held_cost(), 64);

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let tracker = Arc::clone(&tracker);
            tasks.push(tokio::spawn(async move {
                let mut released = 0u32;
                for index in 0..16 {
                    if let Some(cost) = tracker
                        .done_processing(&key("conn", (index + worker) % 16))
                        .expect("signal")
                    {
                        released += cost;
                    }
                    tokio::task::yield_now().await;
                }
                released
            }));
        }
        let mut total = 0;
        for task in tasks {
            total += task.await.expect("join");
        }
        assert_eq!(total, 64);
        assert_eq!(tracker.held_cost(), 0);
        assert_eq!(tracker.outstanding_count(), 0);
    }
}
