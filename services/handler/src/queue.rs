//! Bounded memory of flushed bundle ids.

use std::collections::{HashMap, VecDeque};

type Prefix = [u8; 16];
type Suffix = [u8; 4];

/// Remembers the last suffix recorded for each prefix, evicting the oldest
/// prefix once `capacity` is exceeded.
///
/// Every `put` takes a fresh ticket; the eviction order may hold stale
/// tickets of prefixes that were put again later, those are skipped.
#[derive(Debug)]
pub struct PQueue {
    capacity: usize,
    next_ticket: u64,
    entries: HashMap<Prefix, (Suffix, u64)>,
    order: VecDeque<(Prefix, u64)>,
}

impl PQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_ticket: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn put(&mut self, prefix: Prefix, suffix: Suffix) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.entries.insert(prefix, (suffix, ticket));
        self.order.push_back((prefix, ticket));

        while self.entries.len() > self.capacity {
            let Some((oldest, t)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&oldest).is_some_and(|(_, live)| *live == t) {
                self.entries.remove(&oldest);
            }
        }
        if self.order.len() > 2 * self.capacity {
            let entries = &self.entries;
            self.order
                .retain(|(p, t)| entries.get(p).is_some_and(|(_, live)| live == t));
        }
    }

    /// True when `prefix` is recorded with exactly `suffix`.
    pub fn contains(&self, prefix: &Prefix, suffix: &Suffix) -> bool {
        self.entries.get(prefix).is_some_and(|(s, _)| s == suffix)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: u8) -> Prefix {
        [n; 16]
    }

    #[test]
    fn contains_matches_prefix_and_suffix() {
        let mut q = PQueue::new(4);
        q.put(p(1), [0, 0, 0, 1]);
        assert!(q.contains(&p(1), &[0, 0, 0, 1]));
        assert!(!q.contains(&p(1), &[0, 0, 0, 2]));
        assert!(!q.contains(&p(2), &[0, 0, 0, 1]));

        q.put(p(1), [0, 0, 0, 2]);
        assert!(q.contains(&p(1), &[0, 0, 0, 2]));
        assert!(!q.contains(&p(1), &[0, 0, 0, 1]));
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let mut q = PQueue::new(2);
        q.put(p(1), [1; 4]);
        q.put(p(2), [2; 4]);
        q.put(p(3), [3; 4]);
        assert_eq!(q.len(), 2);
        assert!(!q.contains(&p(1), &[1; 4]));
        assert!(q.contains(&p(2), &[2; 4]));
        assert!(q.contains(&p(3), &[3; 4]));
    }

    #[test]
    fn refreshed_entries_survive_eviction() {
        let mut q = PQueue::new(2);
        q.put(p(1), [1; 4]);
        q.put(p(2), [2; 4]);
        q.put(p(1), [9; 4]);
        q.put(p(3), [3; 4]);
        assert!(q.contains(&p(1), &[9; 4]));
        assert!(!q.contains(&p(2), &[2; 4]));
        assert!(q.contains(&p(3), &[3; 4]));
    }

    #[test]
    fn repeated_puts_do_not_grow_the_order_unbounded() {
        let mut q = PQueue::new(2);
        for n in 0..100u8 {
            q.put(p(1), [n; 4]);
        }
        assert_eq!(q.len(), 1);
        assert!(q.order.len() <= 4);
    }
}
