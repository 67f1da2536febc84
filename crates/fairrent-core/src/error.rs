use thiserror::Error;

use crate::api::TicketId;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors returned by [`Scheduler`](crate::Scheduler) operations.
///
/// None of these are fatal: every variant is handed back to the caller and
/// the scheduler never retries on its own.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed enqueue or update input. Nothing was mutated.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No pending tickets to schedule.
    #[error("queue is empty")]
    EmptyQueue,

    /// The ticket is unknown, already scheduled or cancelled.
    #[error("ticket not found: {0}")]
    TicketNotFound(TicketId),

    /// A ticket with this id is already pending.
    #[error("ticket already queued: {0}")]
    DuplicateTicket(TicketId),

    /// The caller cancelled before the queue lock was acquired.
    #[error("operation cancelled before acquiring the queue")]
    Cancelled,

    /// The caller's deadline passed before the queue lock was acquired.
    #[error("deadline exceeded before acquiring the queue")]
    DeadlineExceeded,

    /// Invalid scheduler configuration or reconfiguration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl SchedulerError {
    /// Returns true for errors caused by caller-side cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Reasons an enqueue request is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("requester_id is required")]
    MissingRequester,

    #[error("group is required")]
    MissingGroup,

    #[error("urgency level is required")]
    MissingUrgency,

    #[error("bonus must be within [0, 1], got {0}")]
    BonusOutOfRange(f64),

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("{field}: minimum {min} exceeds maximum {max}")]
    InvertedRange {
        field: &'static str,
        min: f64,
        max: f64,
    },

    #[error("invalid constraints: {0}")]
    Constraints(String),
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("alpha must be finite and >= 0, got {0}")]
    InvalidAlpha(f64),

    #[error("weight for group {group} must be finite and > 0, got {weight}")]
    InvalidGroupWeight { group: String, weight: f64 },

    #[error("max_wait_time must be greater than zero")]
    ZeroMaxWait,

    #[error("aging threshold must be within [0, 1], got {0}")]
    InvalidAgingThreshold(f64),

    #[error("aging factor must be finite and >= 0, got {0}")]
    InvalidAgingFactor(f64),

    #[error("{0} window must hold at least one sample")]
    EmptyWindow(&'static str),

    #[error("unknown group: {0}")]
    UnknownGroup(String),
}
