//! Indexed binary max-heap of tickets.
//!
//! Tickets live in a `Vec` laid out as an implicit binary tree. A side map
//! from ticket id to slot keeps `remove` and `update_priority` logarithmic and
//! lets the scheduler answer lookups without scanning.

use std::collections::HashMap;
use std::time::Instant;

use crate::api::TicketId;
use crate::ticket::{RankKey, Ticket};

/// Summary of the pending set, computed without touching the heap order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueStats {
    pub total: usize,
    pub oldest_enqueued: Option<Instant>,
    pub newest_enqueued: Option<Instant>,
    pub average_priority: f64,
}

#[derive(Debug)]
pub struct PriorityQueue<C> {
    heap: Vec<Ticket<C>>,
    slots: HashMap<TicketId, usize>,
}

impl<C> Default for PriorityQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> PriorityQueue<C> {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            slots: HashMap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            slots: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: &TicketId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &TicketId) -> Option<&Ticket<C>> {
        self.slots.get(id).map(|&slot| &self.heap[slot])
    }

    /// Inserts a ticket. The caller guarantees the id is not already queued.
    pub fn push(&mut self, ticket: Ticket<C>) {
        debug_assert!(
            !self.slots.contains_key(&ticket.id),
            "duplicate ticket id {}",
            ticket.id
        );
        let slot = self.heap.len();
        self.slots.insert(ticket.id.clone(), slot);
        self.heap.push(ticket);
        self.sift_up(slot);
    }

    pub fn peek_max(&self) -> Option<&Ticket<C>> {
        self.heap.first()
    }

    pub fn pop_max(&mut self) -> Option<Ticket<C>> {
        if self.heap.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    pub fn remove(&mut self, id: &TicketId) -> Option<Ticket<C>> {
        let slot = *self.slots.get(id)?;
        self.remove_at(slot)
    }

    /// Sets a new score for the ticket and restores heap order.
    ///
    /// The value becomes both the base score and the current score, so a
    /// later aging pass builds on top of it.
    pub fn update_priority(&mut self, id: &TicketId, score: f64) -> bool {
        self.update_with(id, |ticket| {
            ticket.base_score = score;
            ticket.priority_score = score;
        })
    }

    /// Mutates one ticket in place and fixes its heap slot.
    pub(crate) fn update_with<F>(&mut self, id: &TicketId, update: F) -> bool
    where
        F: FnOnce(&mut Ticket<C>),
    {
        let Some(&slot) = self.slots.get(id) else {
            return false;
        };
        update(&mut self.heap[slot]);
        self.fix(slot);
        true
    }

    /// Applies `update` to every ticket and rebuilds the heap when any call
    /// reports a change. Returns the number of changed tickets.
    pub(crate) fn update_all<F>(&mut self, mut update: F) -> usize
    where
        F: FnMut(&mut Ticket<C>) -> bool,
    {
        let mut changed = 0usize;
        for ticket in self.heap.iter_mut() {
            if update(ticket) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.rebuild();
        }
        changed
    }

    /// 1-based rank of a ticket by its stored key.
    pub fn rank_of(&self, id: &TicketId) -> Option<usize> {
        self.rank_of_by(id, Ticket::key)
    }

    /// 1-based rank of a ticket under an arbitrary key, e.g. the effective
    /// key at a given instant. O(n).
    pub(crate) fn rank_of_by<F>(&self, id: &TicketId, key: F) -> Option<usize>
    where
        F: Fn(&Ticket<C>) -> RankKey,
    {
        let target = key(self.get(id)?);
        let ahead = self.heap.iter().filter(|t| key(t) > target).count();
        Some(ahead + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ticket<C>> {
        self.heap.iter()
    }

    pub fn snapshot(&self) -> Vec<Ticket<C>>
    where
        C: Clone,
    {
        self.heap.clone()
    }

    pub fn stats(&self) -> QueueStats {
        if self.heap.is_empty() {
            return QueueStats::default();
        }
        let oldest = self.heap.iter().map(|t| t.enqueued_at).min();
        let newest = self.heap.iter().map(|t| t.enqueued_at).max();
        let total_priority: f64 = self.heap.iter().map(|t| t.priority_score).sum();
        QueueStats {
            total: self.heap.len(),
            oldest_enqueued: oldest,
            newest_enqueued: newest,
            average_priority: total_priority / self.heap.len() as f64,
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
    }

    /// Restores heap order bottom-up after bulk key changes.
    pub fn rebuild(&mut self) {
        let len = self.heap.len();
        for slot in (0..len / 2).rev() {
            self.sift_down(slot);
        }
    }

    fn remove_at(&mut self, slot: usize) -> Option<Ticket<C>> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(slot, last);
        let removed = self.heap.pop()?;
        self.slots.remove(&removed.id);
        if slot < self.heap.len() {
            self.fix(slot);
        }
        Some(removed)
    }

    fn fix(&mut self, slot: usize) {
        if self.sift_up(slot) == slot {
            self.sift_down(slot);
        }
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.heap[slot].outranks(&self.heap[parent]) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut best = slot;
            if left < len && self.heap[left].outranks(&self.heap[best]) {
                best = left;
            }
            if right < len && self.heap[right].outranks(&self.heap[best]) {
                best = right;
            }
            if best == slot {
                return;
            }
            self.swap(slot, best);
            slot = best;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        if let Some(entry) = self.slots.get_mut(&self.heap[a].id) {
            *entry = a;
        }
        if let Some(entry) = self.slots.get_mut(&self.heap[b].id) {
            *entry = b;
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        assert_eq!(self.heap.len(), self.slots.len());
        for (slot, ticket) in self.heap.iter().enumerate() {
            assert_eq!(self.slots.get(&ticket.id), Some(&slot));
            if slot > 0 {
                let parent = (slot - 1) / 2;
                assert!(
                    !ticket.outranks(&self.heap[parent]),
                    "slot {slot} outranks its parent {parent}"
                );
            }
        }
    }
}
