//! Priority Queue
//!
//! Orders waiting requests by priority, then FIFO by enqueue sequence.
//!
//! ## Usage
//!
//! ```rust
//! use tokio_upstream_orchestrator::enhanced::{Priority, PriorityQueue};
//!
//! let mut queue = PriorityQueue::new();
//! queue.push(Priority::Low, "background");
//! queue.push(Priority::Critical, "user-facing");
//!
//! assert_eq!(queue.pop(), Some((Priority::Critical, "user-facing")));
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use tracing::trace;

/// Request priority levels
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background / prefetch work.
    Low = 0,
    /// Standard priority for most requests.
    #[default]
    Medium = 1,
    /// Elevated priority, admitted before `Medium`.
    High = 2,
    /// User-blocking work, admitted ahead of all others.
    Critical = 3,
}

impl Priority {
    /// Parse a priority level from a name string (`"low"`, `"medium"`, `"high"`, `"critical"`).
    ///
    /// Returns `None` for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    /// One level lower. `Low` stays `Low`.
    pub fn demote(self) -> Self {
        match self {
            Priority::Critical => Priority::High,
            Priority::High => Priority::Medium,
            Priority::Medium | Priority::Low => Priority::Low,
        }
    }

    /// Lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct PrioritizedItem<T> {
    priority: Priority,
    sequence: u64, // For FIFO within same priority
    item: T,
}

impl<T> PartialEq for PrioritizedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for PrioritizedItem<T> {}

impl<T> PartialOrd for PrioritizedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PrioritizedItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (FIFO)
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

/// Stable priority queue.
///
/// Not internally synchronised: the scheduler owns it behind its state lock.
pub struct PriorityQueue<T> {
    heap: BinaryHeap<PrioritizedItem<T>>,
    sequence: u64,
}

impl<T> PriorityQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            sequence: 0,
        }
    }

    /// Push an item; it sorts after every earlier item of equal priority.
    pub fn push(&mut self, priority: Priority, item: T) {
        self.sequence += 1;
        self.heap.push(PrioritizedItem {
            priority,
            sequence: self.sequence,
            item,
        });
        trace!(
            priority = %priority,
            sequence = self.sequence,
            queue_size = self.heap.len(),
            "item enqueued"
        );
    }

    /// Highest-priority item without removing it.
    pub fn peek(&self) -> Option<(Priority, &T)> {
        self.heap.peek().map(|p| (p.priority, &p.item))
    }

    /// Remove and return the highest-priority item.
    pub fn pop(&mut self) -> Option<(Priority, T)> {
        self.heap.pop().map(|p| (p.priority, p.item))
    }

    /// Remove every item matching `predicate`, preserving order of the rest.
    pub fn drain_where<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = BinaryHeap::with_capacity(self.heap.len());
        for entry in std::mem::take(&mut self.heap).into_vec() {
            if predicate(&entry.item) {
                removed.push(entry.item);
            } else {
                kept.push(entry);
            }
        }
        self.heap = kept;
        removed
    }

    /// Iterate in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (Priority, &T)> {
        self.heap.iter().map(|p| (p.priority, &p.item))
    }

    /// Current queue size.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Count of queued items per priority.
    pub fn counts(&self) -> HashMap<Priority, usize> {
        let mut by_priority = HashMap::new();
        for entry in self.heap.iter() {
            *by_priority.entry(entry.priority).or_insert(0) += 1;
        }
        by_priority
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::Low, "low");
        queue.push(Priority::High, "high");
        queue.push(Priority::Medium, "medium");
        queue.push(Priority::Critical, "critical");

        assert_eq!(queue.pop().map(|x| x.0), Some(Priority::Critical));
        assert_eq!(queue.pop().map(|x| x.0), Some(Priority::High));
        assert_eq!(queue.pop().map(|x| x.0), Some(Priority::Medium));
        assert_eq!(queue.pop().map(|x| x.0), Some(Priority::Low));
    }

    #[test]
    fn test_fifo_preserved_across_all_priorities() {
        let mut queue = PriorityQueue::new();
        for (p, name) in [
            (Priority::Medium, "m1"),
            (Priority::Medium, "m2"),
            (Priority::High, "h1"),
            (Priority::High, "h2"),
            (Priority::Low, "l1"),
            (Priority::Low, "l2"),
        ] {
            queue.push(p, name);
        }

        let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(|x| x.1)).collect();
        assert_eq!(order, vec!["h1", "h2", "m1", "m2", "l1", "l2"]);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::High, 7);
        assert_eq!(queue.peek(), Some((Priority::High, &7)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_where_keeps_remaining_order() {
        let mut queue = PriorityQueue::new();
        for i in 0..6 {
            queue.push(Priority::Medium, i);
        }
        let removed = queue.drain_where(|i| i % 2 == 0);
        assert_eq!(removed.len(), 3);
        let rest: Vec<_> = std::iter::from_fn(|| queue.pop().map(|x| x.1)).collect();
        assert_eq!(rest, vec![1, 3, 5]);
    }

    #[test]
    fn test_counts_by_priority() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::High, ());
        queue.push(Priority::High, ());
        queue.push(Priority::Low, ());
        let counts = queue.counts();
        assert_eq!(counts.get(&Priority::High), Some(&2));
        assert_eq!(counts.get(&Priority::Low), Some(&1));
        assert!(counts.get(&Priority::Critical).is_none());
    }

    #[test]
    fn test_empty_queue_pop_returns_none() {
        let mut queue: PriorityQueue<u8> = PriorityQueue::default();
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_demote_never_promotes() {
        let levels = [
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Critical,
        ];
        for p in levels {
            assert!(p.demote() <= p);
        }
        assert_eq!(Priority::Critical.demote(), Priority::High);
        assert_eq!(Priority::Low.demote(), Priority::Low);
    }

    #[test]
    fn test_priority_default_is_medium() {
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_from_name_case_insensitive() {
        assert_eq!(Priority::from_name("HIGH"), Some(Priority::High));
        assert_eq!(Priority::from_name("medium"), Some(Priority::Medium));
        assert_eq!(Priority::from_name("urgent"), None);
    }
}
