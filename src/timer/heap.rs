//! Min-heap of pending timer tasks.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::timer::task::{Deadline, TimerSlot};

pub(crate) struct Entry {
    pub(crate) deadline: Deadline,
    seq: u64,
    pub(crate) slot: Arc<TimerSlot>,
}

impl Entry {
    fn key(&self) -> (Deadline, u64) {
        (self.deadline, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equal deadlines fall back to submission order, so the order is total.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Pending tasks keyed by deadline; the earliest is always at the top.
#[derive(Default)]
pub(crate) struct TimerHeap {
    entries: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl TimerHeap {
    pub(crate) fn push(&mut self, deadline: Deadline, slot: Arc<TimerSlot>) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.push(Reverse(Entry {
            deadline,
            seq,
            slot,
        }));
    }

    pub(crate) fn earliest(&self) -> Option<Deadline> {
        self.entries.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pops the earliest entry if its deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: Deadline) -> Option<Entry> {
        if self.earliest()? > now {
            return None;
        }
        self.entries.pop().map(|Reverse(entry)| entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Entry> + '_ {
        self.entries.drain().map(|Reverse(entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_deadline_then_submission_order() {
        let base = Deadline::now();
        let mut heap = TimerHeap::default();

        let late = Arc::new(TimerSlot::default());
        let first_tie = Arc::new(TimerSlot::default());
        let second_tie = Arc::new(TimerSlot::default());

        heap.push(base.after_millis(20), late.clone());
        heap.push(base.after_millis(10), first_tie.clone());
        heap.push(base.after_millis(10), second_tie.clone());
        assert_eq!(heap.earliest(), Some(base.after_millis(10)));

        assert!(heap.pop_expired(base).is_none());

        let horizon = base.after_millis(30);
        let order: Vec<_> = std::iter::from_fn(|| heap.pop_expired(horizon))
            .map(|entry| entry.slot)
            .collect();

        assert_eq!(order.len(), 3);
        assert!(Arc::ptr_eq(&order[0], &first_tie));
        assert!(Arc::ptr_eq(&order[1], &second_tie));
        assert!(Arc::ptr_eq(&order[2], &late));
        assert_eq!(heap.len(), 0);
    }
}
