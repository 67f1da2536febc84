//! FairRent core: an in-process α-fair scheduler for scarce, indivisible
//! resources.
//!
//! Requests carry a demographic group, an urgency level and an optional
//! bonus. Each one is scored as
//!
//! ```text
//! score = (urgency / 5 * group_weight + bonus) ^ alpha
//! ```
//!
//! and kept in an indexed binary heap. `alpha = 0` degrades to FIFO; larger
//! values sharpen the preference for urgent requests from heavily weighted
//! groups. Ties are broken by arrival order.
//!
//! Long waits are bounded: before every scheduling decision an aging pass
//! raises the score of tickets older than a fraction of `max_wait_time`, and
//! tickets older than `max_wait_time` are served ahead of everything else,
//! oldest first.
//!
//! The core is runtime-agnostic and never blocks on I/O. The Tokio adapter
//! lives in `fairrent-async`.
//!
//! ```no_run
//! use fairrent_core::{EnqueueRequest, Scheduler, SchedulerConfig, Urgency, UserGroup};
//!
//! # fn main() -> fairrent_core::SchedulerResult<()> {
//! let scheduler: Scheduler = Scheduler::new(SchedulerConfig::default())?;
//! let receipt = scheduler.enqueue(EnqueueRequest::new(
//!     "user-42",
//!     UserGroup::Senior,
//!     Urgency::High,
//! ))?;
//! let next = scheduler.schedule_next()?;
//! assert_eq!(next.ticket_id, receipt.ticket_id);
//! # Ok(())
//! # }
//! ```

mod api;
mod config;
mod context;
mod error;
mod metrics;
mod priority;
pub mod prometheus;
mod queue;
mod scheduler;
mod state;
mod ticket;

pub use api::{
    EnqueueReceipt, EnqueueRequest, FairnessMetrics, GroupMetrics, Histogram, HistogramBucket,
    HousingConstraints, PositionReport, QueueStatus, RequestPayload, RequestUpdate,
    ScheduledTicket, SchedulerObserver, TicketId, Urgency, UserGroup,
};
pub use config::{default_group_weights, AgingConfig, MetricsConfig, SchedulerConfig};
pub use context::{CallContext, CancelToken};
pub use error::{ConfigError, SchedulerError, SchedulerResult, ValidationError};
pub use metrics::{
    gini, percentile_sorted, GroupSnapshot, MetricsCollector, MetricsSnapshot, WaitStats,
    PRIORITY_SCORE_BUCKETS, PROCESSING_BUCKETS_SECS,
};
pub use priority::{AgingPolicy, FairnessParams, FALLBACK_WEIGHT};
pub use queue::{PriorityQueue, QueueStats};
pub use scheduler::Scheduler;
pub use ticket::Ticket;

#[cfg(test)]
mod tests;
