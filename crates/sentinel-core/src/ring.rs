//! Fixed-capacity history buffer.

use serde::Serialize;
use std::collections::VecDeque;

/// Bounded buffer that evicts the oldest element when full.
///
/// Capacity is fixed at construction; a capacity of zero is raised to one.
#[derive(Debug, Clone, Serialize)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, returning the evicted oldest item if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
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

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.items.front()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    /// Mutable access to the newest element.
    pub fn latest_mut(&mut self) -> Option<&mut T> {
        self.items.back_mut()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy of the newest `n` items, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_first() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
        assert_eq!(ring.oldest(), Some(&2));
        assert_eq!(ring.latest(), Some(&4));
    }

    #[test]
    fn test_last_n() {
        let mut ring = RingBuffer::new(5);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.last_n(2), vec![3, 4]);
        assert_eq!(ring.last_n(10), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_raised() {
        let mut ring = RingBuffer::new(0);
        assert_eq!(ring.capacity(), 1);
        ring.push('a');
        assert_eq!(ring.push('b'), Some('a'));
        assert_eq!(ring.len(), 1);
    }
}
