//! The shared work queue for pooled workers.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Thread-safe FIFO-ish pool of remaining suite identifiers.
///
/// Pooled workers pull from it until it runs dry; there are no ordering
/// guarantees across workers beyond per-pull FIFO.
pub struct WorkQueue {
    items: Mutex<VecDeque<String>>,
}

impl WorkQueue {
    /// Create a queue holding the given suites.
    pub fn new(suites: impl IntoIterator<Item = String>) -> Self {
        Self {
            items: Mutex::new(suites.into_iter().collect()),
        }
    }

    /// Pull the next suite, if any remain.
    pub fn pull(&self) -> Option<String> {
        self.items.lock().unwrap().pop_front()
    }

    /// Number of suites still queued.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Whether the queue has run dry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_order() {
        let queue = WorkQueue::new(["a", "b", "c"].map(String::from));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pull().as_deref(), Some("a"));
        assert_eq!(queue.pull().as_deref(), Some("b"));
        assert_eq!(queue.pull().as_deref(), Some("c"));
        assert_eq!(queue.pull(), None);
        assert!(queue.is_empty());
    }
}
