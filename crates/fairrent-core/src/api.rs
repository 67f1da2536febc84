use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{ConfigError, ValidationError};

/// Opaque ticket identifier, rendered as `tkt_<ULID>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    const PREFIX: &'static str = "tkt";

    pub(crate) fn generate() -> Self {
        Self(format!("{}_{}", Self::PREFIX, Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TicketId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TicketId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Demographic category of a requester.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserGroup {
    Refugee,
    Disabled,
    Senior,
    LowIncome,
    Student,
    Family,
    Single,
    MiddleIncome,
    HighIncome,
}

impl UserGroup {
    pub const ALL: [UserGroup; 9] = [
        UserGroup::Refugee,
        UserGroup::Disabled,
        UserGroup::Senior,
        UserGroup::LowIncome,
        UserGroup::Student,
        UserGroup::Family,
        UserGroup::Single,
        UserGroup::MiddleIncome,
        UserGroup::HighIncome,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UserGroup::Refugee => "refugee",
            UserGroup::Disabled => "disabled",
            UserGroup::Senior => "senior",
            UserGroup::LowIncome => "low_income",
            UserGroup::Student => "student",
            UserGroup::Family => "family",
            UserGroup::Single => "single",
            UserGroup::MiddleIncome => "middle_income",
            UserGroup::HighIncome => "high_income",
        }
    }

    /// Weight from the default table, favouring historically disadvantaged groups.
    pub fn default_weight(self) -> f64 {
        match self {
            UserGroup::Refugee => 1.5,
            UserGroup::Disabled => 1.3,
            UserGroup::Senior => 1.2,
            UserGroup::LowIncome => 1.1,
            UserGroup::Student | UserGroup::Family => 1.0,
            UserGroup::Single => 0.9,
            UserGroup::MiddleIncome => 0.8,
            UserGroup::HighIncome => 0.7,
        }
    }
}

impl fmt::Display for UserGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserGroup {
    type Err = ConfigError;

    /// Accepts `low_income`, `LowIncome` and `USER_GROUP_LOW_INCOME` spellings.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let bare = trimmed.strip_prefix("USER_GROUP_").unwrap_or(trimmed);
        let normalized: String = bare
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        UserGroup::ALL
            .into_iter()
            .find(|group| group.as_str().replace('_', "") == normalized)
            .ok_or_else(|| ConfigError::UnknownGroup(value.to_string()))
    }
}

/// Ordinal urgency of a request, `Low = 1` up to `Critical = 5`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Urgency {
    Low = 1,
    Medium = 2,
    High = 3,
    Severe = 4,
    Critical = 5,
}

impl Urgency {
    pub const MAX_LEVEL: u8 = 5;

    pub fn level(self) -> u8 {
        self as u8
    }

    /// `level / MAX_LEVEL`, always within (0, 1].
    pub fn normalized(self) -> f64 {
        f64::from(self.level()) / f64::from(Self::MAX_LEVEL)
    }
}

impl TryFrom<u8> for Urgency {
    type Error = ValidationError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Urgency::Low),
            2 => Ok(Urgency::Medium),
            3 => Ok(Urgency::High),
            4 => Ok(Urgency::Severe),
            5 => Ok(Urgency::Critical),
            _ => Err(ValidationError::MissingUrgency),
        }
    }
}

/// Payload carried by a ticket on behalf of downstream allocation logic.
///
/// The scheduler never interprets the payload beyond calling `validate`
/// before a ticket is created.
pub trait RequestPayload {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

impl RequestPayload for () {}

/// Budget and dwelling limits attached to a housing request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousingConstraints {
    pub max_monthly_rent: Option<f64>,
    pub min_rooms: Option<u32>,
    pub max_rooms: Option<u32>,
    pub min_area_sqm: Option<f64>,
    pub preferred_districts: Vec<String>,
    pub accessibility_required: bool,
}

impl RequestPayload for HousingConstraints {
    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(rent) = self.max_monthly_rent {
            if !rent.is_finite() || rent <= 0.0 {
                return Err(ValidationError::NonPositive {
                    field: "max_monthly_rent",
                    value: rent,
                });
            }
        }
        if let Some(area) = self.min_area_sqm {
            if !area.is_finite() || area <= 0.0 {
                return Err(ValidationError::NonPositive {
                    field: "min_area_sqm",
                    value: area,
                });
            }
        }
        if let Some(rooms) = self.min_rooms {
            if rooms == 0 {
                return Err(ValidationError::NonPositive {
                    field: "min_rooms",
                    value: 0.0,
                });
            }
        }
        if let (Some(min), Some(max)) = (self.min_rooms, self.max_rooms) {
            if min > max {
                return Err(ValidationError::InvertedRange {
                    field: "rooms",
                    min: f64::from(min),
                    max: f64::from(max),
                });
            }
        }
        if self.preferred_districts.iter().any(|d| d.trim().is_empty()) {
            return Err(ValidationError::Constraints(
                "preferred_districts contains an empty name".to_string(),
            ));
        }
        Ok(())
    }
}

/// Input of [`Scheduler::enqueue`](crate::Scheduler::enqueue).
///
/// `group` and `urgency` are optional so that transports can forward an
/// unspecified value and have it rejected as a validation error.
#[derive(Clone, Debug)]
pub struct EnqueueRequest<C = HousingConstraints> {
    pub requester_id: String,
    pub group: Option<UserGroup>,
    pub urgency: Option<Urgency>,
    /// Extra priority in `[0, 1]`.
    pub bonus: f64,
    pub constraints: C,
}

impl<C: Default> EnqueueRequest<C> {
    pub fn new(requester_id: impl Into<String>, group: UserGroup, urgency: Urgency) -> Self {
        Self {
            requester_id: requester_id.into(),
            group: Some(group),
            urgency: Some(urgency),
            bonus: 0.0,
            constraints: C::default(),
        }
    }
}

impl<C> EnqueueRequest<C> {
    pub fn with_bonus(mut self, bonus: f64) -> Self {
        self.bonus = bonus;
        self
    }

    pub fn with_constraints<D>(self, constraints: D) -> EnqueueRequest<D> {
        EnqueueRequest {
            requester_id: self.requester_id,
            group: self.group,
            urgency: self.urgency,
            bonus: self.bonus,
            constraints,
        }
    }
}

/// Re-priority input for [`Scheduler::update_request`](crate::Scheduler::update_request).
/// Fields left as `None` keep their current value.
#[derive(Clone, Debug, Default)]
pub struct RequestUpdate {
    pub urgency: Option<Urgency>,
    pub bonus: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct EnqueueReceipt {
    pub ticket_id: TicketId,
    /// 1-based rank among pending tickets right after insertion.
    pub position: usize,
    pub total_in_queue: usize,
    pub estimated_wait: Duration,
    pub priority_score: f64,
}

#[derive(Clone, Debug)]
pub struct ScheduledTicket<C = HousingConstraints> {
    pub ticket_id: TicketId,
    pub requester_id: String,
    pub group: UserGroup,
    pub urgency: Urgency,
    /// Effective score that won the scheduling decision.
    pub fairness_score: f64,
    pub wait_time: Duration,
    pub constraints: C,
    /// Arrival data carried so the ticket can be handed back with
    /// [`Scheduler::requeue`](crate::Scheduler::requeue).
    pub bonus: f64,
    pub enqueued_at: Instant,
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PositionReport {
    pub ticket_id: TicketId,
    pub position: usize,
    pub total_in_queue: usize,
    pub estimated_wait: Duration,
    pub fairness_score: f64,
}

/// Live view of the pending set.
#[derive(Clone, Debug, Default)]
pub struct QueueStatus {
    pub total_pending: usize,
    pub oldest_wait: Duration,
    pub newest_wait: Duration,
    pub average_priority: f64,
    pub pending_by_group: BTreeMap<UserGroup, usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistogramBucket {
    /// Inclusive upper bound; `f64::INFINITY` for the overflow bucket.
    pub le: f64,
    pub count: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Histogram {
    pub buckets: Vec<HistogramBucket>,
    pub sum: f64,
    pub count: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct GroupMetrics {
    pub group: UserGroup,
    pub pending: usize,
    pub requests: u64,
    pub allocations: u64,
    pub cancellations: u64,
    /// Share of all allocations that went to this group.
    pub allocation_rate: f64,
    pub target_allocation_rate: f64,
    pub actual_vs_target_ratio: f64,
    pub average_wait: Duration,
    pub pending_average_wait: Duration,
}

/// Aggregate returned by [`Scheduler::metrics`](crate::Scheduler::metrics).
#[derive(Clone, Debug, Serialize)]
pub struct FairnessMetrics {
    pub alpha: f64,
    pub group_weights: BTreeMap<UserGroup, f64>,
    pub total_requests: u64,
    pub total_allocations: u64,
    pub total_cancellations: u64,
    pub active_requests: usize,
    pub average_wait: Duration,
    pub median_wait: Duration,
    pub p95_wait: Duration,
    pub p99_wait: Duration,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub max_wait_ratio: f64,
    pub gini_coefficient: f64,
    pub average_processing_interval: Duration,
    /// Allocations per hour over the recent rate window.
    pub allocation_rate: f64,
    /// Requests processed per hour over the whole interval window.
    pub queue_turnover_rate: f64,
    pub group_metrics: Vec<GroupMetrics>,
    pub processing_interval_seconds: Histogram,
    pub priority_scores: Histogram,
}

/// Hooks for an external metrics exporter.
///
/// Called outside the queue lock, after the mutation has been applied.
pub trait SchedulerObserver: Send + Sync {
    fn on_enqueued(&self, _group: UserGroup, _priority_score: f64) {}

    fn on_processed(
        &self,
        _group: UserGroup,
        _wait: Duration,
        _priority_score: f64,
        _processing_interval: Option<Duration>,
    ) {
    }

    fn on_cancelled(&self, _group: UserGroup) {}

    fn on_queue_len(&self, _len: usize) {}
}
