//! Bounded counting semaphore over the global resource budget.
//!
//! Every sandboxed invocation holds a [`SlotGuard`] for its whole duration. A slot is made of
//! the CPUs the program is pinned to and the memory its limit allows, taken out of the shared
//! [`Budget`](crate::constraints::Budget). The number of simultaneously held slots is also
//! capped by `max_parallel_runs`.

use std::{
    collections::HashSet,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::bail;
use tracing::trace;

use crate::{
    cancellation::Cancellation,
    constraints::{Budget, Constraints, Slot},
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct PoolState {
    budget: Budget,
    running: usize,
    peak: usize,
}

#[derive(Debug)]
pub(crate) struct ResourcePool {
    state: Mutex<PoolState>,
    released: Condvar,
    cpus_per_program: usize,
    max_running: usize,
    total_ram: usize,
}

impl ResourcePool {
    pub(crate) fn new(constraints: &Constraints) -> Self {
        ResourcePool {
            state: Mutex::new(PoolState {
                budget: constraints.budget.clone(),
                running: 0,
                peak: 0,
            }),
            released: Condvar::new(),
            cpus_per_program: constraints.cpus_per_program,
            max_running: constraints.max_parallel_runs,
            total_ram: constraints.budget.ram,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // the state is only mutated by infallible arithmetic, so a poisoned lock is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a slot holding `ram` bytes is free, or until `cancellation` fires.
    ///
    /// Returns `Ok(None)` on cancellation.
    ///
    /// # Errors
    /// When the request can never be satisfied by this pool.
    pub(crate) fn acquire(
        &self,
        ram: usize,
        cancellation: &Cancellation,
    ) -> anyhow::Result<Option<SlotGuard<'_>>> {
        if ram > self.total_ram {
            bail!(
                "resource accounting error: {}MB requested but the budget only holds {}MB",
                ram / 1_000_000,
                self.total_ram / 1_000_000
            );
        }

        let mut state = self.lock();
        loop {
            if cancellation.is_cancelled() {
                return Ok(None);
            }
            if state.running < self.max_running {
                if let Some(slot) = state.budget.try_take(self.cpus_per_program, ram) {
                    state.running += 1;
                    state.peak = state.peak.max(state.running);
                    trace!(running = state.running, "slot acquired");
                    return Ok(Some(SlotGuard {
                        pool: self,
                        slot: Some(slot),
                    }));
                }
            }
            state = self
                .released
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, slot: Slot) {
        let mut state = self.lock();
        state.budget.add(slot);
        state.running -= 1;
        trace!(running = state.running, "slot released");
        drop(state);
        self.released.notify_all();
    }

    /// Number of slots currently held.
    pub(crate) fn running(&self) -> usize {
        self.lock().running
    }

    /// Highest number of slots held at once since creation.
    pub(crate) fn peak(&self) -> usize {
        self.lock().peak
    }
}

/// A held share of the budget, given back on drop.
#[derive(Debug)]
pub(crate) struct SlotGuard<'a> {
    pool: &'a ResourcePool,
    slot: Option<Slot>,
}

impl SlotGuard<'_> {
    pub(crate) fn cpus(&self) -> HashSet<u8> {
        self.slot
            .as_ref()
            .map(|s| s.cpus.clone())
            .unwrap_or_default()
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

#[cfg(test)]
mod resource_pool_tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use super::*;
    use crate::constraints::ConstraintsBuilder;

    fn pool(cpus: usize, parallel: usize) -> ResourcePool {
        let constraints = ConstraintsBuilder::new()
            .with_max_total_ram(1_000)
            .with_generator_ram(100)
            .with_solver_ram(100)
            .with_total_cpu_count(cpus)
            .with_max_parallel_runs(parallel)
            .build()
            .unwrap();
        ResourcePool::new(&constraints)
    }

    #[test]
    fn slots_are_bounded() {
        let pool = Arc::new(pool(4, 2));
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let current = current.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    let cancel = Cancellation::new();
                    let guard = pool.acquire(100_000_000, &cancel).unwrap().unwrap();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    assert_eq!(guard.cpus().len(), 1);
                    thread::sleep(Duration::from_millis(10));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert!(pool.peak() <= 2);
        assert_eq!(pool.running(), 0);
    }

    #[test]
    fn acquire_gives_up_on_cancellation() {
        let pool = pool(1, 1);
        let cancel = Cancellation::new();
        let _held = pool.acquire(100_000_000, &cancel).unwrap().unwrap();
        let other = Cancellation::new();
        other.cancel();
        assert!(pool.acquire(100_000_000, &other).unwrap().is_none());
    }

    #[test]
    fn oversized_request_is_an_error() {
        let pool = pool(1, 1);
        assert!(pool.acquire(2_000_000_000, &Cancellation::new()).is_err());
    }
}
