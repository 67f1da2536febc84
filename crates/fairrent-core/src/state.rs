use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::api::{RequestUpdate, TicketId, UserGroup};
use crate::priority::{AgingPolicy, FairnessParams};
use crate::queue::PriorityQueue;

/// Everything guarded by the scheduler's queue lock.
#[derive(Debug)]
pub(crate) struct QueueState<C> {
    pub(crate) queue: PriorityQueue<C>,
    pub(crate) params: FairnessParams,
    next_sequence: u64,
}

impl<C> QueueState<C> {
    pub(crate) fn new(params: FairnessParams) -> Self {
        Self {
            queue: PriorityQueue::new(),
            params,
            next_sequence: 0,
        }
    }

    pub(crate) fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }

    /// Recomputes every base score from the current parameters, then
    /// reapplies aging. Returns the number of tickets whose key changed.
    pub(crate) fn rescore_all(&mut self, aging: &AgingPolicy, now: Instant) -> usize {
        let params = &self.params;
        self.queue.update_all(|ticket| {
            let base = params.score(ticket.group, ticket.urgency, ticket.bonus);
            let rescored = base != ticket.base_score;
            ticket.base_score = base;
            ticket.priority_score = base;
            aging.apply(ticket, now) || rescored
        })
    }

    pub(crate) fn age_all(&mut self, aging: &AgingPolicy, now: Instant) -> usize {
        self.queue.update_all(|ticket| aging.apply(ticket, now))
    }

    /// Applies an urgency or bonus change and rescoring to one ticket.
    pub(crate) fn reprioritize(
        &mut self,
        id: &TicketId,
        update: &RequestUpdate,
        aging: &AgingPolicy,
        now: Instant,
    ) -> bool {
        let params = &self.params;
        self.queue.update_with(id, |ticket| {
            if let Some(urgency) = update.urgency {
                ticket.urgency = urgency;
            }
            if let Some(bonus) = update.bonus {
                ticket.bonus = bonus;
            }
            let base = params.score(ticket.group, ticket.urgency, ticket.bonus);
            ticket.base_score = base;
            ticket.priority_score = base;
            aging.apply(ticket, now);
        })
    }

    pub(crate) fn pending_by_group(&self) -> BTreeMap<UserGroup, usize> {
        let mut counts = BTreeMap::new();
        for ticket in self.queue.iter() {
            *counts.entry(ticket.group).or_insert(0) += 1;
        }
        counts
    }

    /// Mean age of pending tickets per group at `now`.
    pub(crate) fn pending_wait_by_group(&self, now: Instant) -> BTreeMap<UserGroup, Duration> {
        let mut totals: BTreeMap<UserGroup, (Duration, u32)> = BTreeMap::new();
        for ticket in self.queue.iter() {
            let entry = totals.entry(ticket.group).or_default();
            entry.0 = entry.0.saturating_add(ticket.age(now));
            entry.1 = entry.1.saturating_add(1);
        }
        totals
            .into_iter()
            .map(|(group, (total, count))| (group, total / count.max(1)))
            .collect()
    }
}
