//! Bounded FIFO that discards its oldest element when full.
//!
//! Holds outbound broker messages while the connection is down. The buffer
//! lives in memory only; whatever it holds is lost with the process.

use std::collections::VecDeque;

/// Default capacity of the reconnect buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

/// A FIFO of fixed capacity with drop-oldest overflow.
#[derive(Debug, Clone)]
pub struct DropOldestBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> DropOldestBuffer<T> {
    /// Create a buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append an item, returning the one evicted to make room, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Take every buffered item in arrival order.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    /// Put items back at the front, ahead of anything buffered since.
    ///
    /// Used when a flush is interrupted by another disconnect. Items that no
    /// longer fit are dropped from the front, oldest first.
    pub fn requeue_front(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            if self.items.len() == self.capacity {
                self.dropped += 1;
                continue;
            }
            self.items.push_front(item);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of items discarded since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<T> Default for DropOldestBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let mut buffer = DropOldestBuffer::new(DEFAULT_BUFFER_CAPACITY);
        for n in 1..=101u32 {
            buffer.push(n);
        }

        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.dropped(), 1);
        let contents = buffer.drain();
        assert_eq!(contents.first(), Some(&2));
        assert_eq!(contents.last(), Some(&101));
        assert!(!contents.contains(&1));
        assert!(buffer.is_empty());
    }

    #[test]
    fn push_reports_eviction() {
        let mut buffer = DropOldestBuffer::new(2);
        assert_eq!(buffer.push("a"), None);
        assert_eq!(buffer.push("b"), None);
        assert_eq!(buffer.push("c"), Some("a"));
    }

    #[test]
    fn requeue_front_preserves_order() {
        let mut buffer = DropOldestBuffer::new(4);
        buffer.push(3);
        buffer.requeue_front(vec![1, 2]);
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

        // Only one slot left: the newest requeued item wins it
        buffer.requeue_front(vec![-1, 0]);
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn zero_capacity_is_raised() {
        let mut buffer = DropOldestBuffer::new(0);
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.drain(), vec![2]);
    }
}
