//! Bounded FIFO used while the data channel is not `open`. Oldest-drop on
//! overflow; flush preserves insertion order and is single-flight (the
//! caller is responsible for not invoking `drain` concurrently — the
//! transport enforces this via its own send-path mutex).

use std::collections::VecDeque;

use super::types::FALLBACK_QUEUE_CAPACITY;

#[derive(Debug, Default)]
pub struct FallbackQueue {
    items: VecDeque<serde_json::Value>,
    dropped: u64,
}

impl FallbackQueue {
    pub fn new() -> Self {
        Self {
            items: VecDeque::with_capacity(FALLBACK_QUEUE_CAPACITY),
            dropped: 0,
        }
    }

    /// Enqueue a message, dropping the oldest entry if already at capacity.
    pub fn push(&mut self, message: serde_json::Value) {
        if self.items.len() >= FALLBACK_QUEUE_CAPACITY {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Drain everything in FIFO order.
    pub fn drain_all(&mut self) -> Vec<serde_json::Value> {
        self.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preserves_insertion_order_on_drain() {
        let mut q = FallbackQueue::new();
        q.push(json!({"n": 1}));
        q.push(json!({"n": 2}));
        q.push(json!({"n": 3}));
        let drained = q.drain_all();
        assert_eq!(drained, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    }

    #[test]
    fn drops_oldest_entry_when_capacity_exceeded() {
        let mut q = FallbackQueue::new();
        for i in 0..(FALLBACK_QUEUE_CAPACITY + 5) {
            q.push(json!({"n": i}));
        }
        assert_eq!(q.len(), FALLBACK_QUEUE_CAPACITY);
        assert_eq!(q.dropped_count(), 5);
        let drained = q.drain_all();
        // the first surviving entry should be index 5, not 0
        assert_eq!(drained[0], json!({"n": 5}));
    }

    #[test]
    fn drain_empties_the_queue() {
        let mut q = FallbackQueue::new();
        q.push(json!({"n": 1}));
        let _ = q.drain_all();
        assert!(q.is_empty());
    }
}
