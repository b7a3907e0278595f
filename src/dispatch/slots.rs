//! Fork-slot allocation.
//!
//! Every concurrently active worker holds a small integer slot number,
//! unique while held and bounded by the configured concurrency. Checkout
//! waits when the pool is exhausted; the lowest free number is handed out
//! first; release happens exactly once, when the guard drops.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool of fork-slot numbers `1..=capacity`.
pub struct SlotPool {
    capacity: usize,
    free: Mutex<BinaryHeap<Reverse<u32>>>,
    permits: Arc<Semaphore>,
}

impl SlotPool {
    /// Create a pool with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let free = (1..=capacity as u32).map(Reverse).collect();
        Arc::new(Self {
            capacity,
            free: Mutex::new(free),
            permits: Arc::new(Semaphore::new(capacity)),
        })
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently available.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Draw the lowest free slot number, waiting if the pool is exhausted.
    pub async fn checkout(self: &Arc<Self>) -> SlotGuard {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("slot pool semaphore is never closed");

        let number = self
            .free
            .lock()
            .unwrap()
            .pop()
            .expect("slot pool invariant: a permit is held but no slot is free")
            .0;

        SlotGuard {
            number,
            pool: self.clone(),
            _permit: permit,
        }
    }
}

/// A checked-out slot, returned to the pool exactly once on drop.
pub struct SlotGuard {
    number: u32,
    pool: Arc<SlotPool>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    /// The held slot number.
    pub fn number(&self) -> u32 {
        self.number
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // The number goes back before the permit is released (field drop
        // order), so a waiter can never draw from an empty heap.
        self.pool.free.lock().unwrap().push(Reverse(self.number));
    }
}
