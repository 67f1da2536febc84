use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::api::{TicketId, Urgency, UserGroup};

/// One outstanding allocation request.
///
/// Identity, group, urgency and arrival data never change after creation.
/// `priority_score` is the value last computed for the ticket and is only
/// modified through the queue so the heap can be fixed in the same step.
#[derive(Clone, Debug)]
pub struct Ticket<C> {
    pub(crate) id: TicketId,
    pub(crate) requester_id: String,
    pub(crate) group: UserGroup,
    pub(crate) urgency: Urgency,
    pub(crate) bonus: f64,
    pub(crate) enqueued_at: Instant,
    pub(crate) sequence: u64,
    pub(crate) base_score: f64,
    pub(crate) priority_score: f64,
    pub(crate) escalated: bool,
    pub(crate) constraints: C,
}

impl<C> Ticket<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TicketId,
        requester_id: String,
        group: UserGroup,
        urgency: Urgency,
        bonus: f64,
        enqueued_at: Instant,
        sequence: u64,
        score: f64,
        constraints: C,
    ) -> Self {
        Self {
            id,
            requester_id,
            group,
            urgency,
            bonus,
            enqueued_at,
            sequence,
            base_score: score,
            priority_score: score,
            escalated: false,
            constraints,
        }
    }

    pub fn id(&self) -> &TicketId {
        &self.id
    }

    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }

    pub fn group(&self) -> UserGroup {
        self.group
    }

    pub fn urgency(&self) -> Urgency {
        self.urgency
    }

    pub fn bonus(&self) -> f64 {
        self.bonus
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Arrival number; lower values arrived earlier.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Score from the priority formula, without any age term.
    pub fn base_score(&self) -> f64 {
        self.base_score
    }

    pub fn priority_score(&self) -> f64 {
        self.priority_score
    }

    /// True once the ticket has waited at least the configured maximum.
    pub fn is_escalated(&self) -> bool {
        self.escalated
    }

    pub fn constraints(&self) -> &C {
        &self.constraints
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    pub(crate) fn key(&self) -> RankKey {
        RankKey {
            escalated: self.escalated,
            score: self.priority_score,
            sequence: self.sequence,
        }
    }

    /// Heap comparator: true when `self` must be scheduled before `other`.
    pub(crate) fn outranks(&self, other: &Ticket<C>) -> bool {
        self.key().cmp(&other.key()) == Ordering::Greater
    }
}

/// Ordering key of a ticket; greater keys are scheduled first.
///
/// Escalated tickets beat every non-escalated one and are served oldest
/// first among themselves. Otherwise the higher score wins and equal scores
/// fall back to arrival order.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct RankKey {
    pub(crate) escalated: bool,
    pub(crate) score: f64,
    pub(crate) sequence: u64,
}

impl Eq for RankKey {}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.escalated, other.escalated) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (true, true) => other.sequence.cmp(&self.sequence),
            (false, false) => self
                .score
                .total_cmp(&other.score)
                .then_with(|| other.sequence.cmp(&self.sequence)),
        }
    }
}
