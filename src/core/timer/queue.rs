//! Timer queue representations
//!
//! Two interchangeable containers hold armed timers: an ordered list
//! (O(n) insert, no capacity limit) and a bounded binary min-heap
//! (O(log n), fixed capacity). Both order entries by the same total
//! rank, so the externally observable firing sequence is identical
//! whichever representation is configured.

use crate::core::timer::TimerId;
use crate::core::{Error, Result};
use crate::utils::bheap::BoundedHeap;
use alloc::vec::Vec;
use core::cmp::Ordering;

/// Total firing order: key ascending, then priority descending, then
/// insertion sequence ascending. The sequence makes equal (key, prio)
/// entries dequeue FIFO-fair in both representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rank {
    pub key: u64,
    pub prio: i32,
    pub seq: u64,
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.prio.cmp(&self.prio))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub rank: Rank,
    pub id: TimerId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered list of armed timers, ascending rank.
///
/// Insertion scans from the tail: most arrivals land near the end of
/// the horizon, so the common case is short.
#[derive(Debug, Default)]
pub(crate) struct SortedList {
    items: Vec<Entry>,
}

impl SortedList {
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn insert(&mut self, entry: Entry) {
        let pos = self
            .items
            .iter()
            .rposition(|e| e.rank < entry.rank)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.items.insert(pos, entry);
    }

    pub fn head(&self) -> Option<&Entry> {
        self.items.first()
    }

    pub fn pop_head(&mut self) -> Option<Entry> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    pub fn remove(&mut self, id: TimerId) -> bool {
        if let Some(pos) = self.items.iter().position(|e| e.id == id) {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Queue representation selected once at engine init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Ordered doubly-ended list; unbounded, O(n) insert
    List,
    /// Bounded binary min-heap; O(log n), fixed capacity
    Heap,
}

pub(crate) enum TimerQ {
    List(SortedList),
    Heap(BoundedHeap<Entry>),
}

impl TimerQ {
    pub fn new(kind: QueueKind, capacity: usize) -> Self {
        match kind {
            QueueKind::List => TimerQ::List(SortedList::new()),
            QueueKind::Heap => TimerQ::Heap(BoundedHeap::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TimerQ::List(l) => l.len(),
            TimerQ::Heap(h) => h.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&mut self, entry: Entry) -> Result<()> {
        match self {
            TimerQ::List(l) => {
                l.insert(entry);
                Ok(())
            }
            TimerQ::Heap(h) => h.insert(entry).map_err(|_| Error::QueueFull),
        }
    }

    pub fn head(&self) -> Option<Entry> {
        match self {
            TimerQ::List(l) => l.head().copied(),
            TimerQ::Heap(h) => h.peek().copied(),
        }
    }

    pub fn pop_head(&mut self) -> Option<Entry> {
        match self {
            TimerQ::List(l) => l.pop_head(),
            TimerQ::Heap(h) => h.pop(),
        }
    }

    pub fn remove(&mut self, id: TimerId) -> bool {
        match self {
            TimerQ::List(l) => l.remove(id),
            TimerQ::Heap(h) => h.remove_where(|e| e.id == id).is_some(),
        }
    }
}
