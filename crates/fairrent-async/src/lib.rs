//! Tokio adapter for `fairrent-core`.
//!
//! This crate provides async wrappers around the core scheduler, including:
//! - `AsyncScheduler` running each operation on the blocking pool
//! - `AllocationStream`, a `Stream` of scheduled tickets
//! - `Dispatcher` with bounded in-flight execution

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

pub use fairrent_core::{
    CallContext, CancelToken, EnqueueReceipt, EnqueueRequest, FairnessMetrics, HousingConstraints,
    PositionReport, QueueStatus, RequestUpdate, ScheduledTicket, Scheduler, SchedulerConfig,
    SchedulerError, SchedulerResult, TicketId, Urgency, UserGroup,
};
use fairrent_core::{RequestPayload, Ticket};
use futures_core::Stream;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, warn};

/// Longest a waiting consumer sleeps before polling the queue again. Covers
/// tickets enqueued directly on the core scheduler, which do not notify.
const IDLE_POLL: Duration = Duration::from_millis(25);

/// Async wrapper around [`Scheduler`].
pub struct AsyncScheduler<C = HousingConstraints> {
    inner: Arc<Scheduler<C>>,
    work: Arc<Notify>,
    shutdown: CancelToken,
    op_timeout: Option<Duration>,
}

impl<C> Clone for AsyncScheduler<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            work: Arc::clone(&self.work),
            shutdown: self.shutdown.clone(),
            op_timeout: self.op_timeout,
        }
    }
}

impl<C> AsyncScheduler<C> {
    /// Creates a new async wrapper over a shared core scheduler.
    pub fn new(inner: Arc<Scheduler<C>>) -> Self {
        Self {
            inner,
            work: Arc::new(Notify::new()),
            shutdown: CancelToken::new(),
            op_timeout: None,
        }
    }

    /// Bounds how long each operation may wait for the queue lock.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Returns the shared core scheduler.
    pub fn inner(&self) -> &Arc<Scheduler<C>> {
        &self.inner
    }

    /// Stops consumers and fails operations still waiting for the lock.
    /// Pending tickets stay queued in the core scheduler.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.work.notify_waiters();
        debug!("async scheduler closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn context(&self, call: CancelToken) -> CallContext {
        let cx = CallContext::background()
            .with_token(self.shutdown.clone())
            .with_token(call);
        match self.op_timeout {
            Some(timeout) => cx.with_timeout(timeout),
            None => cx,
        }
    }

    /// Returns a `Stream` of scheduled tickets.
    pub fn stream(&self) -> AllocationStream<C> {
        AllocationStream::new(self.clone())
    }
}

/// Hands a value produced for a caller that is gone back to the scheduler.
type Reclaim<C, R> = fn(&Scheduler<C>, R);

/// Result slot of one blocking call.
///
/// Dropping it before the result is taken cancels the call. A value that
/// was produced anyway goes through `reclaim`, either here or in the
/// blocking closure once its send fails.
struct PendingCall<C: Send + Sync + 'static, R: Send + 'static> {
    scheduler: Arc<Scheduler<C>>,
    token: CancelToken,
    result: oneshot::Receiver<SchedulerResult<R>>,
    reclaim: Reclaim<C, R>,
    taken: bool,
}

impl<C: Send + Sync + 'static, R: Send + 'static> PendingCall<C, R> {
    async fn wait(mut self) -> SchedulerResult<R> {
        let result = (&mut self.result).await;
        self.taken = true;
        result.unwrap_or_else(|_| {
            warn!("scheduler operation did not complete");
            Err(SchedulerError::Cancelled)
        })
    }
}

impl<C: Send + Sync + 'static, R: Send + 'static> Drop for PendingCall<C, R> {
    fn drop(&mut self) {
        if self.taken {
            return;
        }
        self.token.cancel();
        self.result.close();
        if let Ok(Ok(value)) = self.result.try_recv() {
            let scheduler = Arc::clone(&self.scheduler);
            let reclaim = self.reclaim;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || reclaim(&scheduler, value));
                }
                Err(_) => reclaim(&scheduler, value),
            }
        }
    }
}

fn discard<C, R>(_: &Scheduler<C>, _: R) {}

fn requeue_abandoned<C>(scheduler: &Scheduler<C>, ticket: ScheduledTicket<C>) {
    let ticket_id = ticket.ticket_id.clone();
    match scheduler.requeue(ticket) {
        Ok(report) => debug!(
            ticket_id = %ticket_id,
            position = report.position,
            "abandoned allocation requeued"
        ),
        Err(err) => warn!(
            ticket_id = %ticket_id,
            error = %err,
            "abandoned allocation could not be requeued"
        ),
    }
}

impl<C: Send + Sync + 'static> AsyncScheduler<C> {
    async fn run<R, F>(&self, op: F) -> SchedulerResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Scheduler<C>, &CallContext) -> SchedulerResult<R> + Send + 'static,
    {
        self.run_reclaiming(op, discard::<C, R>).await
    }

    /// Runs `op` on the blocking pool. If the caller stops waiting, the
    /// call is cancelled before it takes the queue lock; a value it still
    /// produces is passed to `reclaim`.
    async fn run_reclaiming<R, F>(&self, op: F, reclaim: Reclaim<C, R>) -> SchedulerResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Scheduler<C>, &CallContext) -> SchedulerResult<R> + Send + 'static,
    {
        let token = CancelToken::new();
        let cx = self.context(token.clone());
        let (tx, rx) = oneshot::channel();
        let scheduler = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let result = op(&scheduler, &cx);
            if let Err(Ok(value)) = tx.send(result) {
                reclaim(&scheduler, value);
            }
        });

        PendingCall {
            scheduler: Arc::clone(&self.inner),
            token,
            result: rx,
            reclaim,
            taken: false,
        }
        .wait()
        .await
    }

    /// Pops the best ticket. A ticket popped for a caller that dropped this
    /// future is requeued with its original arrival order.
    pub async fn schedule_next(&self) -> SchedulerResult<ScheduledTicket<C>> {
        self.run_reclaiming(
            |scheduler, cx| scheduler.schedule_next_with(cx),
            requeue_abandoned::<C>,
        )
        .await
    }

    pub async fn peek_position(&self, id: TicketId) -> SchedulerResult<PositionReport> {
        self.run(move |scheduler, cx| scheduler.peek_position_with(cx, &id))
            .await
    }

    pub async fn cancel(&self, id: TicketId, reason: String) -> SchedulerResult<Ticket<C>> {
        self.run(move |scheduler, cx| scheduler.cancel_with(cx, &id, &reason))
            .await
    }

    pub async fn update_request(
        &self,
        id: TicketId,
        update: RequestUpdate,
    ) -> SchedulerResult<PositionReport> {
        self.run(move |scheduler, cx| scheduler.update_request_with(cx, &id, update))
            .await
    }

    pub async fn metrics(&self) -> SchedulerResult<FairnessMetrics> {
        self.run(|scheduler, cx| scheduler.metrics_with(cx)).await
    }

    pub async fn queue_status(&self) -> SchedulerResult<QueueStatus> {
        self.run(|scheduler, cx| scheduler.queue_status_with(cx))
            .await
    }

    /// Waits for the next ticket, returning `None` once the adapter closes.
    pub async fn next_allocation(&self) -> Option<ScheduledTicket<C>> {
        loop {
            if self.is_closed() {
                return None;
            }
            let notified = self.work.notified();
            match self.schedule_next().await {
                Ok(ticket) => return Some(ticket),
                Err(SchedulerError::EmptyQueue) => {
                    let _ = tokio::time::timeout(IDLE_POLL, notified).await;
                }
                Err(err) if err.is_cancellation() => return None,
                Err(err) => {
                    warn!(error = %err, "stopping allocation loop");
                    return None;
                }
            }
        }
    }
}

impl<C: RequestPayload + Send + Sync + 'static> AsyncScheduler<C> {
    /// Enqueues a request and wakes one waiting consumer.
    pub async fn enqueue(&self, request: EnqueueRequest<C>) -> SchedulerResult<EnqueueReceipt> {
        let receipt = self
            .run(move |scheduler, cx| scheduler.enqueue_with(cx, request))
            .await?;
        self.work.notify_one();
        Ok(receipt)
    }
}

type NextAllocation<C> = Pin<Box<dyn Future<Output = Option<ScheduledTicket<C>>> + Send>>;

fn allocation_future<C: Send + Sync + 'static>(scheduler: AsyncScheduler<C>) -> NextAllocation<C> {
    Box::pin(async move { scheduler.next_allocation().await })
}

/// `Stream` adapter over [`AsyncScheduler::next_allocation`].
///
/// Dropping the stream while it waits requeues a ticket popped for it.
pub struct AllocationStream<C = HousingConstraints> {
    scheduler: AsyncScheduler<C>,
    next: Option<NextAllocation<C>>,
}

impl<C> AllocationStream<C> {
    /// Creates a new stream adapter.
    pub fn new(scheduler: AsyncScheduler<C>) -> Self {
        Self {
            scheduler,
            next: None,
        }
    }
}

impl<C: Send + Sync + 'static> Stream for AllocationStream<C> {
    type Item = ScheduledTicket<C>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let scheduler = &this.scheduler;
        let next = this.next.get_or_insert_with(|| allocation_future(scheduler.clone()));
        let item = ready!(next.as_mut().poll(cx));
        this.next = None;
        Poll::Ready(item)
    }
}

pub struct Dispatcher<C = HousingConstraints> {
    scheduler: AsyncScheduler<C>,
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
}

impl<C> Dispatcher<C> {
    /// Creates a dispatcher with bounded in-flight handler executions.
    pub fn new(scheduler: AsyncScheduler<C>, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            scheduler,
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }
}

impl<C: Send + Sync + 'static> Dispatcher<C> {
    /// Runs the allocation loop and hands each ticket to `handler`. Returns
    /// after the scheduler closes and every started handler has finished.
    ///
    /// A handler slot is reserved before a ticket is popped, so no ticket
    /// waits inside the dispatcher for capacity.
    pub async fn run<F, Fut>(&self, handler: F)
    where
        F: Fn(ScheduledTicket<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let Ok(slot) = Arc::clone(&self.semaphore).acquire_owned().await else {
                break;
            };
            let Some(ticket) = self.scheduler.next_allocation().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let _slot = slot;
                handler(ticket).await;
            });
        }

        let permits = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        let _ = self.semaphore.acquire_many(permits).await;
    }
}
