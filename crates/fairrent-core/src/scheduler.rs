use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::api::{
    EnqueueReceipt, EnqueueRequest, FairnessMetrics, GroupMetrics, HousingConstraints,
    PositionReport, QueueStatus, RequestPayload, RequestUpdate, ScheduledTicket,
    SchedulerObserver, TicketId, Urgency, UserGroup,
};
use crate::config::SchedulerConfig;
use crate::context::CallContext;
use crate::error::{SchedulerError, SchedulerResult, ValidationError};
use crate::metrics::MetricsCollector;
use crate::priority::{validate_alpha, validate_weight, AgingPolicy, FairnessParams};
use crate::state::QueueState;
use crate::ticket::Ticket;

/// Thread-safe α-fair scheduler.
///
/// The pending set, its index, the live fairness parameters and the arrival
/// counter share one `RwLock`. Mutating operations take it exclusively;
/// `peek_position`, `metrics` and `queue_status` share it. The metrics
/// collector has its own lock, always taken after the queue lock.
pub struct Scheduler<C = HousingConstraints> {
    config: SchedulerConfig,
    aging: AgingPolicy,
    state: RwLock<QueueState<C>>,
    metrics: MetricsCollector,
    observer: Option<Arc<dyn SchedulerObserver>>,
}

impl<C> Scheduler<C> {
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;
        let aging = AgingPolicy::new(config.max_wait_time, &config.aging);
        let state = QueueState::new(FairnessParams::from_config(&config));
        let metrics = MetricsCollector::new(config.metrics.clone());
        debug!(
            alpha = config.alpha,
            max_wait_secs = config.max_wait_time.as_secs_f64(),
            "scheduler created"
        );
        Ok(Self {
            config,
            aging,
            state: RwLock::new(state),
            metrics,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Configuration the scheduler was built with. Reconfiguration through
    /// `set_alpha` / `set_group_weight` is reported by `metrics()`, not here.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.state.read().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().queue.is_empty()
    }

    fn notify(&self, event: impl FnOnce(&dyn SchedulerObserver)) {
        if let Some(observer) = &self.observer {
            event(observer.as_ref());
        }
    }

    fn write_state(
        &self,
        cx: &CallContext,
        op: &'static str,
    ) -> SchedulerResult<RwLockWriteGuard<'_, QueueState<C>>> {
        cx.write(&self.state).inspect_err(|err| {
            debug!(op, error = %err, "gave up waiting for queue lock");
        })
    }

    fn read_state(
        &self,
        cx: &CallContext,
        op: &'static str,
    ) -> SchedulerResult<RwLockReadGuard<'_, QueueState<C>>> {
        cx.read(&self.state).inspect_err(|err| {
            debug!(op, error = %err, "gave up waiting for queue lock");
        })
    }

    /// Mean gap between recent allocations, or the configured guess before
    /// two allocations have happened.
    fn processing_interval(&self) -> Duration {
        self.metrics
            .average_processing_interval()
            .unwrap_or(self.config.initial_processing_estimate)
    }

    fn estimate_wait(&self, position: usize, interval: Duration) -> Duration {
        let factor = u32::try_from(position).unwrap_or(u32::MAX);
        interval
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.aging.max_wait())
    }

    /// Position and effective score of a ticket evaluated at `now`.
    fn position_report(
        &self,
        state: &QueueState<C>,
        id: &TicketId,
        now: Instant,
        interval: Duration,
    ) -> SchedulerResult<PositionReport> {
        let ticket = state
            .queue
            .get(id)
            .ok_or_else(|| SchedulerError::TicketNotFound(id.clone()))?;
        let (fairness_score, _) = self.aging.effective(ticket, now);
        let position = state
            .queue
            .rank_of_by(id, |t| self.aging.effective_key(t, now))
            .ok_or_else(|| SchedulerError::TicketNotFound(id.clone()))?;
        Ok(PositionReport {
            ticket_id: id.clone(),
            position,
            total_in_queue: state.queue.len(),
            estimated_wait: self.estimate_wait(position, interval),
            fairness_score,
        })
    }

    pub fn schedule_next(&self) -> SchedulerResult<ScheduledTicket<C>> {
        self.schedule_next_with(&CallContext::background())
    }

    /// Pops the best ticket after bringing every pending score up to date.
    pub fn schedule_next_with(&self, cx: &CallContext) -> SchedulerResult<ScheduledTicket<C>> {
        let (ticket, wait, interval, remaining) = {
            let mut state = self.write_state(cx, "schedule_next")?;
            let now = Instant::now();
            let aged = state.age_all(&self.aging, now);
            if aged > 0 {
                debug!(aged, "aging pass updated pending tickets");
            }
            let ticket = state.queue.pop_max().ok_or(SchedulerError::EmptyQueue)?;
            let wait = ticket.age(now);
            let interval =
                self.metrics
                    .record_processed_at(ticket.group, wait, ticket.priority_score, now);
            (ticket, wait, interval, state.queue.len())
        };

        let Ticket {
            id,
            requester_id,
            group,
            urgency,
            priority_score,
            escalated,
            constraints,
            bonus,
            enqueued_at,
            sequence,
            ..
        } = ticket;
        debug!(
            ticket_id = %id,
            %group,
            urgency = urgency.level(),
            priority_score,
            escalated,
            wait_ms = wait.as_millis() as u64,
            "ticket scheduled"
        );
        self.notify(|observer| {
            observer.on_processed(group, wait, priority_score, interval);
            observer.on_queue_len(remaining);
        });

        Ok(ScheduledTicket {
            ticket_id: id,
            requester_id,
            group,
            urgency,
            fairness_score: priority_score,
            wait_time: wait,
            constraints,
            bonus,
            enqueued_at,
            sequence,
        })
    }

    pub fn peek_position(&self, id: &TicketId) -> SchedulerResult<PositionReport> {
        self.peek_position_with(&CallContext::background(), id)
    }

    pub fn peek_position_with(
        &self,
        cx: &CallContext,
        id: &TicketId,
    ) -> SchedulerResult<PositionReport> {
        let interval = self.processing_interval();
        let state = self.read_state(cx, "peek_position")?;
        self.position_report(&state, id, Instant::now(), interval)
    }

    pub fn metrics(&self) -> SchedulerResult<FairnessMetrics> {
        self.metrics_with(&CallContext::background())
    }

    /// Aggregates collector statistics with the live pending set. Read-only:
    /// repeated calls without intervening mutations return the same counts.
    ///
    /// The collector is read under the queue lock, so counters and the
    /// pending set always describe the same instant.
    pub fn metrics_with(&self, cx: &CallContext) -> SchedulerResult<FairnessMetrics> {
        let (alpha, group_weights, active_requests, pending, pending_wait, snapshot) = {
            let state = self.read_state(cx, "metrics")?;
            let now = Instant::now();
            (
                state.params.alpha(),
                state.params.weights().clone(),
                state.queue.len(),
                state.pending_by_group(),
                state.pending_wait_by_group(now),
                self.metrics.snapshot(),
            )
        };

        let group_metrics = snapshot
            .groups
            .iter()
            .map(|group| GroupMetrics {
                group: group.group,
                pending: pending.get(&group.group).copied().unwrap_or(0),
                requests: group.requests,
                allocations: group.allocations,
                cancellations: group.cancellations,
                allocation_rate: group.allocation_rate,
                target_allocation_rate: group.target_allocation_rate,
                actual_vs_target_ratio: group.actual_vs_target_ratio,
                average_wait: group.average_wait,
                pending_average_wait: pending_wait
                    .get(&group.group)
                    .copied()
                    .unwrap_or_default(),
            })
            .collect();

        Ok(FairnessMetrics {
            alpha,
            group_weights,
            total_requests: snapshot.total_requests,
            total_allocations: snapshot.total_allocations,
            total_cancellations: snapshot.total_cancellations,
            active_requests,
            average_wait: snapshot.wait.average,
            median_wait: snapshot.wait.median,
            p95_wait: snapshot.wait.p95,
            p99_wait: snapshot.wait.p99,
            min_wait: snapshot.wait.min,
            max_wait: snapshot.wait.max,
            max_wait_ratio: snapshot.wait.max_ratio,
            gini_coefficient: snapshot.wait.gini,
            average_processing_interval: snapshot
                .average_processing_interval
                .unwrap_or_default(),
            allocation_rate: snapshot.allocation_rate,
            queue_turnover_rate: snapshot.queue_turnover_rate,
            group_metrics,
            processing_interval_seconds: snapshot.processing_interval_seconds,
            priority_scores: snapshot.priority_scores,
        })
    }

    /// Removes a pending ticket and hands it back.
    pub fn cancel(&self, id: &TicketId, reason: &str) -> SchedulerResult<Ticket<C>> {
        self.cancel_with(&CallContext::background(), id, reason)
    }

    pub fn cancel_with(
        &self,
        cx: &CallContext,
        id: &TicketId,
        reason: &str,
    ) -> SchedulerResult<Ticket<C>> {
        let (ticket, remaining) = {
            let mut state = self.write_state(cx, "cancel")?;
            let ticket = state
                .queue
                .remove(id)
                .ok_or_else(|| SchedulerError::TicketNotFound(id.clone()))?;
            self.metrics.record_cancelled(ticket.group);
            (ticket, state.queue.len())
        };
        info!(ticket_id = %id, group = %ticket.group, reason, "ticket cancelled");
        self.notify(|observer| {
            observer.on_cancelled(ticket.group);
            observer.on_queue_len(remaining);
        });
        Ok(ticket)
    }

    pub fn requeue(&self, ticket: ScheduledTicket<C>) -> SchedulerResult<PositionReport> {
        self.requeue_with(&CallContext::background(), ticket)
    }

    /// Puts a scheduled ticket back under its original id, arrival order
    /// and enqueue time, and takes its allocation out of the counters.
    pub fn requeue_with(
        &self,
        cx: &CallContext,
        ticket: ScheduledTicket<C>,
    ) -> SchedulerResult<PositionReport> {
        validate_bonus(ticket.bonus)?;
        let ScheduledTicket {
            ticket_id,
            requester_id,
            group,
            urgency,
            constraints,
            bonus,
            enqueued_at,
            sequence,
            ..
        } = ticket;
        let interval = self.processing_interval();

        let report = {
            let mut state = self.write_state(cx, "requeue")?;
            if state.queue.contains(&ticket_id) {
                return Err(SchedulerError::DuplicateTicket(ticket_id));
            }
            let now = Instant::now();
            let score = state.params.score(group, urgency, bonus);
            let mut restored = Ticket::new(
                ticket_id.clone(),
                requester_id,
                group,
                urgency,
                bonus,
                enqueued_at,
                sequence,
                score,
                constraints,
            );
            self.aging.apply(&mut restored, now);
            state.queue.push(restored);
            self.metrics.record_requeued(group);
            self.position_report(&state, &ticket_id, now, interval)?
        };

        info!(
            ticket_id = %report.ticket_id,
            %group,
            position = report.position,
            "ticket requeued"
        );
        self.notify(|observer| observer.on_queue_len(report.total_in_queue));
        Ok(report)
    }

    pub fn update_request(
        &self,
        id: &TicketId,
        update: RequestUpdate,
    ) -> SchedulerResult<PositionReport> {
        self.update_request_with(&CallContext::background(), id, update)
    }

    /// Changes urgency and/or bonus of a pending ticket and rescores it.
    pub fn update_request_with(
        &self,
        cx: &CallContext,
        id: &TicketId,
        update: RequestUpdate,
    ) -> SchedulerResult<PositionReport> {
        if let Some(bonus) = update.bonus {
            validate_bonus(bonus)?;
        }
        let interval = self.processing_interval();
        let mut state = self.write_state(cx, "update_request")?;
        let now = Instant::now();
        if !state.reprioritize(id, &update, &self.aging, now) {
            return Err(SchedulerError::TicketNotFound(id.clone()));
        }
        let report = self.position_report(&state, id, now, interval)?;
        drop(state);
        info!(
            ticket_id = %id,
            urgency = update.urgency.map(Urgency::level),
            bonus = update.bonus,
            priority_score = report.fairness_score,
            position = report.position,
            "ticket reprioritized"
        );
        Ok(report)
    }

    pub fn queue_status(&self) -> SchedulerResult<QueueStatus> {
        self.queue_status_with(&CallContext::background())
    }

    pub fn queue_status_with(&self, cx: &CallContext) -> SchedulerResult<QueueStatus> {
        let state = self.read_state(cx, "queue_status")?;
        let now = Instant::now();
        let stats = state.queue.stats();
        let wait_since = |at: Option<Instant>| {
            at.map(|at| now.saturating_duration_since(at))
                .unwrap_or_default()
        };
        Ok(QueueStatus {
            total_pending: stats.total,
            oldest_wait: wait_since(stats.oldest_enqueued),
            newest_wait: wait_since(stats.newest_enqueued),
            average_priority: stats.average_priority,
            pending_by_group: state.pending_by_group(),
        })
    }

    pub fn set_alpha(&self, alpha: f64) -> SchedulerResult<()> {
        self.set_alpha_with(&CallContext::background(), alpha)
    }

    /// Replaces α and rescores every pending ticket.
    pub fn set_alpha_with(&self, cx: &CallContext, alpha: f64) -> SchedulerResult<()> {
        validate_alpha(alpha)?;
        let mut state = self.write_state(cx, "set_alpha")?;
        let previous = state.params.alpha();
        state.params.set_alpha(alpha)?;
        let rescored = state.rescore_all(&self.aging, Instant::now());
        drop(state);
        info!(previous, alpha, rescored, "alpha updated");
        Ok(())
    }

    pub fn set_group_weight(&self, group: UserGroup, weight: f64) -> SchedulerResult<()> {
        self.set_group_weight_with(&CallContext::background(), group, weight)
    }

    /// Replaces one group weight and rescores every pending ticket.
    pub fn set_group_weight_with(
        &self,
        cx: &CallContext,
        group: UserGroup,
        weight: f64,
    ) -> SchedulerResult<()> {
        validate_weight(group, weight)?;
        let mut state = self.write_state(cx, "set_group_weight")?;
        let previous = state.params.weight(group);
        state.params.set_weight(group, weight)?;
        let rescored = state.rescore_all(&self.aging, Instant::now());
        drop(state);
        info!(%group, previous, weight, rescored, "group weight updated");
        Ok(())
    }

    /// Runs the aging pass now. Returns the number of tickets whose
    /// effective score or escalation changed.
    pub fn refresh_priorities(&self) -> SchedulerResult<usize> {
        self.refresh_priorities_with(&CallContext::background())
    }

    pub fn refresh_priorities_with(&self, cx: &CallContext) -> SchedulerResult<usize> {
        let mut state = self.write_state(cx, "refresh_priorities")?;
        let changed = state.age_all(&self.aging, Instant::now());
        drop(state);
        if changed > 0 {
            debug!(changed, "priorities refreshed");
        }
        Ok(changed)
    }
}

impl<C: RequestPayload> Scheduler<C> {
    pub fn enqueue(&self, request: EnqueueRequest<C>) -> SchedulerResult<EnqueueReceipt> {
        self.enqueue_with(&CallContext::background(), request)
    }

    /// Validates and queues a request.
    ///
    /// Nothing is mutated when validation fails or the context fires before
    /// the queue lock is acquired.
    pub fn enqueue_with(
        &self,
        cx: &CallContext,
        request: EnqueueRequest<C>,
    ) -> SchedulerResult<EnqueueReceipt> {
        let (group, urgency) = validate_request(&request).inspect_err(|err| {
            warn!(requester_id = %request.requester_id, error = %err, "enqueue rejected");
        })?;
        let EnqueueRequest {
            requester_id,
            bonus,
            constraints,
            ..
        } = request;
        let interval = self.processing_interval();

        let (receipt, total) = {
            let mut state = self.write_state(cx, "enqueue")?;
            let mut id = TicketId::generate();
            while state.queue.contains(&id) {
                id = TicketId::generate();
            }
            let sequence = state.take_sequence();
            let score = state.params.score(group, urgency, bonus);
            let now = Instant::now();
            state.queue.push(Ticket::new(
                id.clone(),
                requester_id,
                group,
                urgency,
                bonus,
                now,
                sequence,
                score,
                constraints,
            ));
            self.metrics.record_enqueued(group);
            let report = self.position_report(&state, &id, now, interval)?;
            let receipt = EnqueueReceipt {
                ticket_id: id,
                position: report.position,
                total_in_queue: report.total_in_queue,
                estimated_wait: report.estimated_wait,
                priority_score: score,
            };
            (receipt, report.total_in_queue)
        };

        debug!(
            ticket_id = %receipt.ticket_id,
            %group,
            urgency = urgency.level(),
            priority_score = receipt.priority_score,
            position = receipt.position,
            "ticket enqueued"
        );
        self.notify(|observer| {
            observer.on_enqueued(group, receipt.priority_score);
            observer.on_queue_len(total);
        });
        Ok(receipt)
    }
}

fn validate_bonus(bonus: f64) -> Result<(), ValidationError> {
    if !bonus.is_finite() || !(0.0..=1.0).contains(&bonus) {
        return Err(ValidationError::BonusOutOfRange(bonus));
    }
    Ok(())
}

fn validate_request<C: RequestPayload>(
    request: &EnqueueRequest<C>,
) -> Result<(UserGroup, Urgency), ValidationError> {
    if request.requester_id.trim().is_empty() {
        return Err(ValidationError::MissingRequester);
    }
    let group = request.group.ok_or(ValidationError::MissingGroup)?;
    let urgency = request.urgency.ok_or(ValidationError::MissingUrgency)?;
    validate_bonus(request.bonus)?;
    request.constraints.validate()?;
    Ok((group, urgency))
}
