use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use fairrent_core::{
    prometheus, EnqueueRequest, HousingConstraints, Scheduler, SchedulerConfig, SchedulerError,
    SchedulerResult, Urgency, UserGroup,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const URGENCY_CYCLE: [Urgency; 5] = [
    Urgency::Low,
    Urgency::Medium,
    Urgency::High,
    Urgency::Severe,
    Urgency::Critical,
];

fn main() -> SchedulerResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let run_seconds = 5u64;
    let worker_count = 2usize;
    let worker_pause = Duration::from_millis(2);

    let config = SchedulerConfig::default().with_max_wait_time(Duration::from_secs(2));
    let scheduler: Arc<Scheduler> = Arc::new(Scheduler::new(config)?);

    let running = Arc::new(AtomicBool::new(true));
    let produced_total = Arc::new(AtomicU64::new(0));
    let rejected_total = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();

    // High-income requests arrive much faster than everyone else's.
    handles.push(spawn_producer(
        Arc::clone(&scheduler),
        Arc::clone(&running),
        Arc::clone(&produced_total),
        Arc::clone(&rejected_total),
        UserGroup::HighIncome,
        1,
    ));
    for group in UserGroup::ALL
        .into_iter()
        .filter(|group| *group != UserGroup::HighIncome)
    {
        handles.push(spawn_producer(
            Arc::clone(&scheduler),
            Arc::clone(&running),
            Arc::clone(&produced_total),
            Arc::clone(&rejected_total),
            group,
            20,
        ));
    }

    for _ in 0..worker_count {
        handles.push(spawn_worker(
            Arc::clone(&scheduler),
            Arc::clone(&running),
            worker_pause,
        ));
    }

    info!(
        groups = UserGroup::ALL.len(),
        workers = worker_count,
        seconds = run_seconds,
        "bench: hot group vs the rest"
    );
    let start = Instant::now();
    thread::sleep(Duration::from_secs(run_seconds));
    let elapsed = start.elapsed().as_secs_f64();

    running.store(false, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }

    let metrics = scheduler.metrics()?;
    let throughput = if elapsed > 0.0 {
        metrics.total_allocations as f64 / elapsed
    } else {
        0.0
    };

    println!(
        "stats: enq={} alloc={} pending={} rejected={}",
        metrics.total_requests,
        metrics.total_allocations,
        metrics.active_requests,
        rejected_total.load(Ordering::Relaxed)
    );
    println!(
        "derived: throughput={:.1} ops/s avg_wait_ms={:.3} p99_wait_ms={:.3} max_wait_ms={:.3} gini={:.4}",
        throughput,
        metrics.average_wait.as_secs_f64() * 1_000.0,
        metrics.p99_wait.as_secs_f64() * 1_000.0,
        metrics.max_wait.as_secs_f64() * 1_000.0,
        metrics.gini_coefficient
    );
    for group in &metrics.group_metrics {
        println!(
            "group={:<14} req={:<6} alloc={:<6} pending={:<6} share_vs_target={:.2} avg_wait_ms={:.1}",
            group.group.as_str(),
            group.requests,
            group.allocations,
            group.pending,
            group.actual_vs_target_ratio,
            group.average_wait.as_secs_f64() * 1_000.0
        );
    }
    println!(
        "produced_total={}",
        produced_total.load(Ordering::Relaxed)
    );
    println!();
    print!("{}", prometheus::render_metrics(&metrics, "fairrent_bench"));
    Ok(())
}

fn spawn_producer(
    scheduler: Arc<Scheduler>,
    running: Arc<AtomicBool>,
    produced_total: Arc<AtomicU64>,
    rejected_total: Arc<AtomicU64>,
    group: UserGroup,
    interval_ms: u64,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut seq = 0usize;
        while running.load(Ordering::Relaxed) {
            seq += 1;
            let mut request: EnqueueRequest = EnqueueRequest::new(
                format!("{group}-{seq}"),
                group,
                URGENCY_CYCLE[seq % URGENCY_CYCLE.len()],
            )
            .with_bonus((seq % 10) as f64 / 10.0);
            request.constraints = HousingConstraints {
                max_monthly_rent: Some(800.0 + (seq % 5) as f64 * 150.0),
                min_rooms: Some(1 + (seq % 3) as u32),
                ..HousingConstraints::default()
            };
            produced_total.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = scheduler.enqueue(request) {
                warn!(%group, error = %err, "enqueue failed");
                rejected_total.fetch_add(1, Ordering::Relaxed);
            }
            if interval_ms > 0 {
                thread::sleep(Duration::from_millis(interval_ms));
            }
        }
    })
}

fn spawn_worker(
    scheduler: Arc<Scheduler>,
    running: Arc<AtomicBool>,
    pause: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::Relaxed) {
            match scheduler.schedule_next() {
                Ok(_) => thread::sleep(pause),
                Err(SchedulerError::EmptyQueue) => thread::sleep(pause),
                Err(err) => {
                    warn!(error = %err, "worker stopping");
                    break;
                }
            }
        }
    })
}
