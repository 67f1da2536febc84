use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::{
    CallContext, CancelToken, EnqueueRequest, HousingConstraints, RequestUpdate, Scheduler,
    SchedulerConfig, SchedulerError, SchedulerObserver, TicketId, Urgency, UserGroup,
    ValidationError,
};

fn scheduler(config: SchedulerConfig) -> Scheduler {
    Scheduler::new(config).expect("valid config")
}

fn request(user: &str, group: UserGroup, urgency: Urgency) -> EnqueueRequest {
    EnqueueRequest::new(user, group, urgency)
}

#[test]
fn highest_priority_is_scheduled_first() {
    let scheduler = scheduler(SchedulerConfig::default());
    scheduler
        .enqueue(request("student", UserGroup::Student, Urgency::Low))
        .expect("enqueue");
    let refugee = scheduler
        .enqueue(request("refugee", UserGroup::Refugee, Urgency::Critical).with_bonus(0.9))
        .expect("enqueue");
    scheduler
        .enqueue(request("senior", UserGroup::Senior, Urgency::High).with_bonus(0.5))
        .expect("enqueue");

    assert!((refugee.priority_score - 5.76).abs() < 1e-9);
    assert_eq!(refugee.position, 1);

    let first = scheduler.schedule_next().expect("scheduled");
    assert_eq!(first.ticket_id, refugee.ticket_id);
    assert_eq!(first.group, UserGroup::Refugee);
    assert_eq!(first.requester_id, "refugee");

    let order: Vec<_> = std::iter::from_fn(|| scheduler.schedule_next().ok())
        .map(|t| t.requester_id)
        .collect();
    assert_eq!(order, vec!["senior", "student"]);
}

#[test]
fn empty_queue_and_unknown_ticket() {
    let scheduler = scheduler(SchedulerConfig::default());
    assert!(matches!(
        scheduler.schedule_next(),
        Err(SchedulerError::EmptyQueue)
    ));
    match scheduler.peek_position(&TicketId::from("unknown-id")) {
        Err(SchedulerError::TicketNotFound(id)) => assert_eq!(id.as_str(), "unknown-id"),
        other => panic!("expected TicketNotFound, got {other:?}"),
    }
}

#[test]
fn peek_position_ranks_by_score() {
    let scores = [
        (UserGroup::Refugee, 95.5),
        (UserGroup::Disabled, 87.3),
        (UserGroup::Family, 76.8),
        (UserGroup::Senior, 92.1),
        (UserGroup::Single, 83.7),
    ];
    let config = scores.iter().fold(
        SchedulerConfig::default().with_alpha(1.0),
        |config, (group, weight)| config.with_group_weight(*group, *weight),
    );
    let scheduler = scheduler(config);
    let ids: Vec<_> = scores
        .iter()
        .map(|(group, weight)| {
            let receipt = scheduler
                .enqueue(request(group.as_str(), *group, Urgency::Critical))
                .expect("enqueue");
            assert!((receipt.priority_score - weight).abs() < 1e-9);
            receipt.ticket_id
        })
        .collect();

    let report = scheduler.peek_position(&ids[3]).expect("queued");
    assert_eq!(report.position, 2);
    assert_eq!(report.total_in_queue, 5);
    assert!((report.fairness_score - 92.1).abs() < 1e-9);
    let positions: Vec<_> = ids
        .iter()
        .map(|id| scheduler.peek_position(id).expect("queued").position)
        .collect();
    assert_eq!(positions, vec![1, 3, 5, 2, 4]);
}

#[test]
fn alpha_zero_serves_in_arrival_order() {
    let scheduler = scheduler(SchedulerConfig::default().with_alpha(0.0));
    let groups = [
        UserGroup::HighIncome,
        UserGroup::Refugee,
        UserGroup::Single,
        UserGroup::Disabled,
        UserGroup::Student,
    ];
    let ids: Vec<_> = groups
        .iter()
        .enumerate()
        .map(|(i, group)| {
            scheduler
                .enqueue(request(&format!("u{i}"), *group, Urgency::Critical))
                .expect("enqueue")
                .ticket_id
        })
        .collect();
    let served: Vec<_> = std::iter::from_fn(|| scheduler.schedule_next().ok())
        .map(|t| t.ticket_id)
        .collect();
    assert_eq!(served, ids);
}

#[test]
fn receipts_estimate_from_initial_interval() {
    let scheduler = scheduler(
        SchedulerConfig::default().with_initial_processing_estimate(Duration::from_secs(600)),
    );
    let first = scheduler
        .enqueue(request("a", UserGroup::Refugee, Urgency::Critical))
        .expect("enqueue");
    let second = scheduler
        .enqueue(request("b", UserGroup::HighIncome, Urgency::Low))
        .expect("enqueue");
    assert_eq!(first.estimated_wait, Duration::from_secs(600));
    assert_eq!(second.position, 2);
    assert_eq!(second.total_in_queue, 2);
    assert_eq!(second.estimated_wait, Duration::from_secs(1200));

    let report = scheduler.peek_position(&second.ticket_id).expect("queued");
    assert_eq!(report.position, 2);
    assert_eq!(report.total_in_queue, 2);
}

#[test]
fn concurrent_enqueues_are_unique_and_complete() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 100;

    let scheduler = Arc::new(scheduler(SchedulerConfig::default()));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|i| {
                        let group = UserGroup::ALL[(t + i) % UserGroup::ALL.len()];
                        scheduler
                            .enqueue(request(&format!("t{t}-{i}"), group, Urgency::Medium))
                            .expect("enqueue")
                            .ticket_id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        for id in handle.join().expect("producer thread") {
            assert!(ids.insert(id), "duplicate ticket id");
        }
    }
    assert_eq!(ids.len(), THREADS * PER_THREAD);
    assert_eq!(scheduler.len(), THREADS * PER_THREAD);

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let mut served = Vec::new();
                while let Ok(ticket) = scheduler.schedule_next() {
                    served.push(ticket.ticket_id);
                }
                served
            })
        })
        .collect();
    let mut served = HashSet::new();
    for handle in consumers {
        for id in handle.join().expect("consumer thread") {
            assert!(served.insert(id), "ticket scheduled twice");
        }
    }
    assert_eq!(served, ids);
    assert!(scheduler.is_empty());
}

#[test]
fn metrics_do_not_change_queue_state() {
    let scheduler = scheduler(SchedulerConfig::default());
    for (i, group) in UserGroup::ALL.into_iter().enumerate() {
        scheduler
            .enqueue(request(&format!("u{i}"), group, Urgency::High))
            .expect("enqueue");
    }
    scheduler.schedule_next().expect("scheduled");
    scheduler.schedule_next().expect("scheduled");

    let first = scheduler.metrics().expect("metrics");
    let second = scheduler.metrics().expect("metrics");
    assert_eq!(first.total_requests, 9);
    assert_eq!(first.total_allocations, 2);
    assert_eq!(first.active_requests, 7);
    assert_eq!(first.total_requests, second.total_requests);
    assert_eq!(first.total_allocations, second.total_allocations);
    assert_eq!(first.active_requests, second.active_requests);
    assert_eq!(first.median_wait, second.median_wait);
    assert_eq!(first.gini_coefficient, second.gini_coefficient);
    let pending: Vec<_> = first.group_metrics.iter().map(|g| g.pending).collect();
    let again: Vec<_> = second.group_metrics.iter().map(|g| g.pending).collect();
    assert_eq!(pending, again);
    assert_eq!(pending.iter().sum::<usize>(), 7);
    assert_eq!(scheduler.len(), 7);
    assert_eq!(first.alpha, 2.0);
}

#[test]
fn metrics_counts_agree_under_concurrency() {
    let scheduler = Arc::new(scheduler(SchedulerConfig::default()));
    let workers: Vec<_> = (0..4)
        .map(|t| {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                for i in 0..500 {
                    let group = UserGroup::ALL[(t + i) % UserGroup::ALL.len()];
                    scheduler
                        .enqueue(request(&format!("t{t}-{i}"), group, Urgency::Medium))
                        .expect("enqueue");
                    let _ = scheduler.schedule_next();
                }
            })
        })
        .collect();

    for _ in 0..2_000 {
        let metrics = scheduler.metrics().expect("metrics");
        assert_eq!(
            metrics.total_requests,
            metrics.total_allocations + metrics.total_cancellations + metrics.active_requests as u64
        );
        let pending: usize = metrics.group_metrics.iter().map(|g| g.pending).sum();
        assert_eq!(pending, metrics.active_requests);
    }
    for worker in workers {
        worker.join().expect("worker thread");
    }
}

#[test]
fn requeue_restores_arrival_order() {
    let scheduler = scheduler(SchedulerConfig::default());
    let first = scheduler
        .enqueue(request("a", UserGroup::Family, Urgency::High))
        .expect("enqueue");
    let second = scheduler
        .enqueue(request("b", UserGroup::Family, Urgency::High))
        .expect("enqueue");

    let scheduled = scheduler.schedule_next().expect("scheduled");
    assert_eq!(scheduled.ticket_id, first.ticket_id);
    let sequence = scheduled.sequence;
    let enqueued_at = scheduled.enqueued_at;

    let report = scheduler.requeue(scheduled.clone()).expect("requeue");
    assert_eq!(report.position, 1);
    assert_eq!(report.total_in_queue, 2);
    assert!(matches!(
        scheduler.requeue(scheduled),
        Err(SchedulerError::DuplicateTicket(_))
    ));

    let metrics = scheduler.metrics().expect("metrics");
    assert_eq!(metrics.total_requests, 2);
    assert_eq!(metrics.total_allocations, 0);
    assert_eq!(metrics.active_requests, 2);

    let again = scheduler.schedule_next().expect("scheduled");
    assert_eq!(again.ticket_id, first.ticket_id);
    assert_eq!(again.sequence, sequence);
    assert_eq!(again.enqueued_at, enqueued_at);
    assert_eq!(
        scheduler.schedule_next().expect("scheduled").ticket_id,
        second.ticket_id
    );
}

#[test]
fn overdue_ticket_beats_higher_score() {
    let config = SchedulerConfig::default()
        .with_alpha(1.0)
        .with_max_wait_time(Duration::from_millis(100));
    let scheduler = scheduler(config);
    let starved = scheduler
        .enqueue(request("old", UserGroup::HighIncome, Urgency::Low))
        .expect("enqueue");
    thread::sleep(Duration::from_millis(150));
    for i in 0..5 {
        let fresh = request(&format!("new{i}"), UserGroup::Refugee, Urgency::Critical);
        scheduler
            .enqueue(fresh.with_bonus(1.0))
            .expect("enqueue");
    }

    let report = scheduler.peek_position(&starved.ticket_id).expect("queued");
    assert_eq!(report.position, 1);

    let first = scheduler.schedule_next().expect("scheduled");
    assert_eq!(first.ticket_id, starved.ticket_id);
    assert!(first.wait_time >= Duration::from_millis(100));
}

#[test]
fn fresh_ticket_does_not_jump_ahead() {
    let scheduler = scheduler(
        SchedulerConfig::default()
            .with_alpha(1.0)
            .with_max_wait_time(Duration::from_secs(60)),
    );
    scheduler
        .enqueue(request("low", UserGroup::HighIncome, Urgency::Low))
        .expect("enqueue");
    let high = scheduler
        .enqueue(request("high", UserGroup::Refugee, Urgency::Critical))
        .expect("enqueue");
    assert_eq!(scheduler.refresh_priorities().expect("refresh"), 0);
    assert_eq!(scheduler.schedule_next().expect("scheduled").ticket_id, high.ticket_id);
}

#[test]
fn cancel_removes_ticket() {
    let scheduler = scheduler(SchedulerConfig::default());
    let ids: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|user| {
            scheduler
                .enqueue(request(user, UserGroup::Family, Urgency::Medium))
                .expect("enqueue")
                .ticket_id
        })
        .collect();

    let cancelled = scheduler.cancel(&ids[1], "found housing").expect("cancel");
    assert_eq!(cancelled.requester_id(), "b");
    assert!(matches!(
        scheduler.peek_position(&ids[1]),
        Err(SchedulerError::TicketNotFound(_))
    ));
    assert!(matches!(
        scheduler.cancel(&ids[1], "again"),
        Err(SchedulerError::TicketNotFound(_))
    ));
    assert_eq!(scheduler.peek_position(&ids[2]).expect("queued").position, 2);

    let served: Vec<_> = std::iter::from_fn(|| scheduler.schedule_next().ok())
        .map(|t| t.ticket_id)
        .collect();
    assert_eq!(served, vec![ids[0].clone(), ids[2].clone()]);

    let metrics = scheduler.metrics().expect("metrics");
    assert_eq!(metrics.total_cancellations, 1);
    assert_eq!(metrics.group_metrics[0].cancellations, 1);
}

#[test]
fn invalid_requests_leave_no_trace() {
    let scheduler = scheduler(SchedulerConfig::default());
    let mut missing_urgency = request("u", UserGroup::Student, Urgency::Low);
    missing_urgency.urgency = None;

    let cases = [
        request("", UserGroup::Student, Urgency::Low),
        missing_urgency,
        request("u", UserGroup::Student, Urgency::Low).with_bonus(2.0),
        request("u", UserGroup::Student, Urgency::Low).with_constraints(HousingConstraints {
            min_rooms: Some(4),
            max_rooms: Some(2),
            ..HousingConstraints::default()
        }),
    ];
    for case in cases {
        assert!(matches!(
            scheduler.enqueue(case),
            Err(SchedulerError::Validation(_))
        ));
    }
    assert!(scheduler.is_empty());
    assert_eq!(scheduler.metrics().expect("metrics").total_requests, 0);
}

#[test]
fn cancelled_context_has_no_side_effects() {
    let scheduler = scheduler(SchedulerConfig::default());
    let token = CancelToken::new();
    token.cancel();
    let cancelled = CallContext::background().with_token(token);
    let expired = CallContext::background().with_timeout(Duration::ZERO);

    let err = scheduler
        .enqueue_with(&cancelled, request("u", UserGroup::Senior, Urgency::High))
        .expect_err("cancelled");
    assert!(matches!(err, SchedulerError::Cancelled));
    assert!(err.is_cancellation());
    assert!(matches!(
        scheduler.enqueue_with(&expired, request("u", UserGroup::Senior, Urgency::High)),
        Err(SchedulerError::DeadlineExceeded)
    ));
    assert!(scheduler.is_empty());

    let id = scheduler
        .enqueue(request("u", UserGroup::Senior, Urgency::High))
        .expect("enqueue")
        .ticket_id;
    assert!(scheduler.schedule_next_with(&cancelled).is_err());
    assert!(scheduler.cancel_with(&cancelled, &id, "nope").is_err());
    assert!(scheduler.set_alpha_with(&cancelled, 1.0).is_err());
    assert!(scheduler.metrics_with(&cancelled).is_err());

    let metrics = scheduler.metrics().expect("metrics");
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.total_allocations, 0);
    assert_eq!(metrics.total_cancellations, 0);
    assert_eq!(metrics.alpha, 2.0);
    assert_eq!(scheduler.peek_position(&id).expect("queued").position, 1);
}

#[test]
fn reconfiguration_reorders_pending() {
    let scheduler = scheduler(SchedulerConfig::default().with_alpha(1.0));
    let wealthy = scheduler
        .enqueue(request("w", UserGroup::HighIncome, Urgency::High))
        .expect("enqueue");
    let student = scheduler
        .enqueue(request("s", UserGroup::Student, Urgency::Medium))
        .expect("enqueue");
    assert_eq!(scheduler.peek_position(&wealthy.ticket_id).expect("queued").position, 1);

    scheduler
        .set_group_weight(UserGroup::Student, 2.0)
        .expect("valid weight");
    let report = scheduler.peek_position(&student.ticket_id).expect("queued");
    assert_eq!(report.position, 1);
    assert!((report.fairness_score - 0.8).abs() < 1e-9);

    scheduler.set_alpha(0.0).expect("valid alpha");
    assert_eq!(scheduler.peek_position(&wealthy.ticket_id).expect("queued").position, 1);

    assert!(matches!(
        scheduler.set_alpha(-1.0),
        Err(SchedulerError::Config(_))
    ));
    assert!(matches!(
        scheduler.set_group_weight(UserGroup::Student, 0.0),
        Err(SchedulerError::Config(_))
    ));
    let metrics = scheduler.metrics().expect("metrics");
    assert_eq!(metrics.alpha, 0.0);
    assert_eq!(metrics.group_weights[&UserGroup::Student], 2.0);
}

#[test]
fn update_request_rescores() {
    let scheduler = scheduler(SchedulerConfig::default());
    let low = scheduler
        .enqueue(request("low", UserGroup::Student, Urgency::Low))
        .expect("enqueue");
    scheduler
        .enqueue(request("high", UserGroup::Student, Urgency::High))
        .expect("enqueue");
    assert_eq!(scheduler.peek_position(&low.ticket_id).expect("queued").position, 2);

    let report = scheduler
        .update_request(
            &low.ticket_id,
            RequestUpdate {
                urgency: Some(Urgency::Critical),
                bonus: None,
            },
        )
        .expect("update");
    assert_eq!(report.position, 1);
    assert!((report.fairness_score - 1.0).abs() < 1e-9);

    assert!(matches!(
        scheduler.update_request(
            &low.ticket_id,
            RequestUpdate {
                urgency: None,
                bonus: Some(-1.0),
            },
        ),
        Err(SchedulerError::Validation(ValidationError::BonusOutOfRange(_)))
    ));
    assert!(matches!(
        scheduler.update_request(&TicketId::from("missing"), RequestUpdate::default()),
        Err(SchedulerError::TicketNotFound(_))
    ));

    let first = scheduler.schedule_next().expect("scheduled");
    assert_eq!(first.ticket_id, low.ticket_id);
    assert_eq!(first.urgency, Urgency::Critical);
}

#[test]
fn queue_status_reports_pending_set() {
    let scheduler = scheduler(SchedulerConfig::default().with_alpha(1.0));
    assert_eq!(scheduler.queue_status().expect("status").total_pending, 0);

    scheduler
        .enqueue(request("a", UserGroup::Family, Urgency::Critical))
        .expect("enqueue");
    scheduler
        .enqueue(request("b", UserGroup::Family, Urgency::Low))
        .expect("enqueue");
    scheduler
        .enqueue(request("c", UserGroup::Disabled, Urgency::Low))
        .expect("enqueue");

    let status = scheduler.queue_status().expect("status");
    assert_eq!(status.total_pending, 3);
    assert_eq!(status.pending_by_group[&UserGroup::Family], 2);
    assert_eq!(status.pending_by_group[&UserGroup::Disabled], 1);
    assert!(status.oldest_wait >= status.newest_wait);
    let expected = (1.0 + 0.2 + 0.2 * 1.3) / 3.0;
    assert!((status.average_priority - expected).abs() < 1e-9);
}

#[test]
fn instances_are_independent() {
    let a = scheduler(SchedulerConfig::default());
    let b = scheduler(SchedulerConfig::default());
    a.enqueue(request("u", UserGroup::Senior, Urgency::Medium))
        .expect("enqueue");
    assert_eq!(a.len(), 1);
    assert!(b.is_empty());
    assert!(matches!(b.schedule_next(), Err(SchedulerError::EmptyQueue)));
    assert_eq!(b.metrics().expect("metrics").total_requests, 0);
}

#[derive(Default)]
struct Recorder {
    enqueued: AtomicUsize,
    processed: AtomicUsize,
    cancelled: AtomicUsize,
    lengths: Mutex<Vec<usize>>,
}

impl SchedulerObserver for Recorder {
    fn on_enqueued(&self, _group: UserGroup, _priority_score: f64) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn on_processed(
        &self,
        _group: UserGroup,
        _wait: Duration,
        _priority_score: f64,
        _processing_interval: Option<Duration>,
    ) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_cancelled(&self, _group: UserGroup) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn on_queue_len(&self, len: usize) {
        self.lengths.lock().expect("lengths").push(len);
    }
}

#[test]
fn observer_sees_every_mutation() {
    let recorder = Arc::new(Recorder::default());
    let scheduler = scheduler(SchedulerConfig::default()).with_observer(recorder.clone());

    let first = scheduler
        .enqueue(request("a", UserGroup::LowIncome, Urgency::Severe))
        .expect("enqueue");
    scheduler
        .enqueue(request("b", UserGroup::Single, Urgency::Low))
        .expect("enqueue");
    scheduler.schedule_next().expect("scheduled");
    assert!(matches!(
        scheduler.cancel(&first.ticket_id, "already scheduled"),
        Err(SchedulerError::TicketNotFound(_))
    ));
    let remaining = scheduler.queue_status().expect("status");
    assert_eq!(remaining.total_pending, 1);

    assert_eq!(recorder.enqueued.load(Ordering::Relaxed), 2);
    assert_eq!(recorder.processed.load(Ordering::Relaxed), 1);
    assert_eq!(recorder.cancelled.load(Ordering::Relaxed), 0);
    assert_eq!(*recorder.lengths.lock().expect("lengths"), vec![1, 2, 1]);
}
