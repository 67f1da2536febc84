//! α-fair priority scoring and age-based starvation protection.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::api::{Urgency, UserGroup};
use crate::config::{AgingConfig, SchedulerConfig};
use crate::error::ConfigError;
use crate::ticket::{RankKey, Ticket};

/// Weight applied to groups absent from a custom weight table.
pub const FALLBACK_WEIGHT: f64 = 1.0;

/// Live fairness parameters. Owned by the queue state so that a
/// reconfiguration and the rescoring it implies happen under one lock.
#[derive(Clone, Debug)]
pub struct FairnessParams {
    alpha: f64,
    weights: BTreeMap<UserGroup, f64>,
}

impl FairnessParams {
    pub fn new(alpha: f64, weights: BTreeMap<UserGroup, f64>) -> Result<Self, ConfigError> {
        validate_alpha(alpha)?;
        for (group, weight) in &weights {
            validate_weight(*group, *weight)?;
        }
        Ok(Self { alpha, weights })
    }

    pub(crate) fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            alpha: config.alpha,
            weights: config.group_weights.clone(),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn weights(&self) -> &BTreeMap<UserGroup, f64> {
        &self.weights
    }

    pub fn weight(&self, group: UserGroup) -> f64 {
        self.weights.get(&group).copied().unwrap_or(FALLBACK_WEIGHT)
    }

    pub(crate) fn set_alpha(&mut self, alpha: f64) -> Result<(), ConfigError> {
        validate_alpha(alpha)?;
        self.alpha = alpha;
        Ok(())
    }

    pub(crate) fn set_weight(&mut self, group: UserGroup, weight: f64) -> Result<(), ConfigError> {
        validate_weight(group, weight)?;
        self.weights.insert(group, weight);
        Ok(())
    }

    /// `(urgency / MAX * weight + bonus) ^ alpha`.
    ///
    /// `alpha = 0` yields 1 for every request, which degrades to FIFO.
    pub fn score(&self, group: UserGroup, urgency: Urgency, bonus: f64) -> f64 {
        let base = urgency.normalized() * self.weight(group) + bonus;
        base.powf(self.alpha)
    }
}

pub(crate) fn validate_alpha(alpha: f64) -> Result<(), ConfigError> {
    if !alpha.is_finite() || alpha < 0.0 {
        return Err(ConfigError::InvalidAlpha(alpha));
    }
    Ok(())
}

pub(crate) fn validate_weight(group: UserGroup, weight: f64) -> Result<(), ConfigError> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(ConfigError::InvalidGroupWeight {
            group: group.to_string(),
            weight,
        });
    }
    Ok(())
}

/// Raises the effective score of tickets that have waited long.
///
/// Past `threshold * max_wait` the score gains `factor * age / max_wait`.
/// Past `max_wait` the ticket escalates and outranks every non-escalated one.
#[derive(Clone, Copy, Debug)]
pub struct AgingPolicy {
    max_wait: Duration,
    threshold: Duration,
    factor: f64,
}

impl AgingPolicy {
    pub fn new(max_wait: Duration, aging: &AgingConfig) -> Self {
        Self {
            max_wait,
            threshold: max_wait.mul_f64(aging.threshold.clamp(0.0, 1.0)),
            factor: aging.factor,
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Effective `(score, escalated)` of a ticket at `now`.
    pub fn effective<C>(&self, ticket: &Ticket<C>, now: Instant) -> (f64, bool) {
        let age = ticket.age(now);
        let escalated = age >= self.max_wait;
        if age < self.threshold {
            return (ticket.base_score, escalated);
        }
        let ratio = age.as_secs_f64() / self.max_wait.as_secs_f64();
        (ticket.base_score + self.factor * ratio, escalated)
    }

    pub(crate) fn effective_key<C>(&self, ticket: &Ticket<C>, now: Instant) -> RankKey {
        let (score, escalated) = self.effective(ticket, now);
        RankKey {
            escalated,
            score,
            sequence: ticket.sequence,
        }
    }

    /// Stores the effective values on the ticket. Returns true if anything changed.
    pub(crate) fn apply<C>(&self, ticket: &mut Ticket<C>, now: Instant) -> bool {
        let (score, escalated) = self.effective(ticket, now);
        let changed = score != ticket.priority_score || escalated != ticket.escalated;
        ticket.priority_score = score;
        ticket.escalated = escalated;
        changed
    }
}
