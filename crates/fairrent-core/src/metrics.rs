//! Bounded-window wait-time statistics and fairness measures.
//!
//! Counters that only grow are atomics. Sample windows sit behind a mutex
//! that is distinct from the queue lock; every statistic is computed on a
//! private sorted copy taken while that mutex is held.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::api::{Histogram, HistogramBucket, UserGroup};
use crate::config::MetricsConfig;

/// Upper bounds (seconds) for the processing interval histogram.
pub const PROCESSING_BUCKETS_SECS: [f64; 12] = [
    0.005,
    0.01,
    0.025,
    0.05,
    0.1,
    0.25,
    0.5,
    1.0,
    2.5,
    5.0,
    10.0,
    f64::INFINITY,
];

/// Upper bounds for the priority score histogram: 0, 1, ... 19, then overflow.
pub const PRIORITY_SCORE_BUCKETS: [f64; 21] = [
    0.0,
    1.0,
    2.0,
    3.0,
    4.0,
    5.0,
    6.0,
    7.0,
    8.0,
    9.0,
    10.0,
    11.0,
    12.0,
    13.0,
    14.0,
    15.0,
    16.0,
    17.0,
    18.0,
    19.0,
    f64::INFINITY,
];

#[derive(Debug)]
pub(crate) struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy> RingBuffer<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, value: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(value);
    }

    pub(crate) fn to_vec(&self) -> Vec<T> {
        self.items.iter().copied().collect()
    }
}

#[derive(Debug)]
struct CumulativeHistogram {
    bounds: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl CumulativeHistogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            counts: vec![0; bounds.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        if let Some(idx) = self.bounds.iter().position(|bound| value <= *bound) {
            self.counts[idx] = self.counts[idx].saturating_add(1);
        }
        self.sum += value;
        self.count = self.count.saturating_add(1);
    }

    fn snapshot(&self) -> Histogram {
        Histogram {
            buckets: self
                .bounds
                .iter()
                .zip(&self.counts)
                .map(|(le, count)| HistogramBucket {
                    le: *le,
                    count: *count,
                })
                .collect(),
            sum: self.sum,
            count: self.count,
        }
    }
}

#[derive(Debug)]
struct GroupSamples {
    requests: u64,
    allocations: u64,
    cancellations: u64,
    waits: RingBuffer<Duration>,
}

impl GroupSamples {
    fn new(window: usize) -> Self {
        Self {
            requests: 0,
            allocations: 0,
            cancellations: 0,
            waits: RingBuffer::new(window),
        }
    }
}

#[derive(Debug)]
struct Samples {
    waits: RingBuffer<Duration>,
    intervals: RingBuffer<Duration>,
    groups: BTreeMap<UserGroup, GroupSamples>,
    last_processed: Option<Instant>,
    processing_intervals: CumulativeHistogram,
    priority_scores: CumulativeHistogram,
}

#[derive(Debug)]
struct Counters {
    requests: AtomicU64,
    allocations: AtomicU64,
    cancellations: AtomicU64,
}

/// Wait-time distribution over the current global window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WaitStats {
    pub samples: usize,
    pub average: Duration,
    pub median: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub min: Duration,
    pub max: Duration,
    /// `max / min`; 0 when the minimum is zero.
    pub max_ratio: f64,
    pub gini: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GroupSnapshot {
    pub group: UserGroup,
    pub requests: u64,
    pub allocations: u64,
    pub cancellations: u64,
    pub allocation_rate: f64,
    pub target_allocation_rate: f64,
    pub actual_vs_target_ratio: f64,
    pub average_wait: Duration,
}

#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_allocations: u64,
    pub total_cancellations: u64,
    pub wait: WaitStats,
    pub average_processing_interval: Option<Duration>,
    pub allocation_rate: f64,
    pub queue_turnover_rate: f64,
    pub groups: Vec<GroupSnapshot>,
    pub processing_interval_seconds: Histogram,
    pub priority_scores: Histogram,
}

#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    counters: Counters,
    samples: Mutex<Samples>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        let samples = Samples {
            waits: RingBuffer::new(config.global_window),
            intervals: RingBuffer::new(config.interval_window),
            groups: BTreeMap::new(),
            last_processed: None,
            processing_intervals: CumulativeHistogram::new(&PROCESSING_BUCKETS_SECS),
            priority_scores: CumulativeHistogram::new(&PRIORITY_SCORE_BUCKETS),
        };
        Self {
            config,
            counters: Counters {
                requests: AtomicU64::new(0),
                allocations: AtomicU64::new(0),
                cancellations: AtomicU64::new(0),
            },
            samples: Mutex::new(samples),
        }
    }

    fn saturating_inc(counter: &AtomicU64) {
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(1);
            match counter.compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn saturating_dec(counter: &AtomicU64) {
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(1);
            match counter.compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn record_enqueued(&self, group: UserGroup) {
        Self::saturating_inc(&self.counters.requests);
        let window = self.config.group_window;
        let mut samples = self.samples.lock();
        let stats = samples
            .groups
            .entry(group)
            .or_insert_with(|| GroupSamples::new(window));
        stats.requests = stats.requests.saturating_add(1);
    }

    /// Records one allocation. Returns the interval since the previous
    /// allocation, if there was one.
    pub fn record_processed(
        &self,
        group: UserGroup,
        wait: Duration,
        priority_score: f64,
    ) -> Option<Duration> {
        self.record_processed_at(group, wait, priority_score, Instant::now())
    }

    pub(crate) fn record_processed_at(
        &self,
        group: UserGroup,
        wait: Duration,
        priority_score: f64,
        now: Instant,
    ) -> Option<Duration> {
        Self::saturating_inc(&self.counters.allocations);
        let window = self.config.group_window;
        let mut samples = self.samples.lock();

        samples.waits.push(wait);
        let stats = samples
            .groups
            .entry(group)
            .or_insert_with(|| GroupSamples::new(window));
        stats.allocations = stats.allocations.saturating_add(1);
        stats.waits.push(wait);
        samples.priority_scores.observe(priority_score);

        let interval = samples
            .last_processed
            .map(|last| now.saturating_duration_since(last));
        if let Some(interval) = interval {
            samples.intervals.push(interval);
            samples
                .processing_intervals
                .observe(interval.as_secs_f64());
        }
        samples.last_processed = Some(now);
        interval
    }

    /// Reverses the allocation counters of a ticket that went back into the
    /// queue. Its wait sample and interval stay in the windows.
    pub fn record_requeued(&self, group: UserGroup) {
        Self::saturating_dec(&self.counters.allocations);
        if let Some(stats) = self.samples.lock().groups.get_mut(&group) {
            stats.allocations = stats.allocations.saturating_sub(1);
        }
    }

    pub fn record_cancelled(&self, group: UserGroup) {
        Self::saturating_inc(&self.counters.cancellations);
        let window = self.config.group_window;
        let mut samples = self.samples.lock();
        let stats = samples
            .groups
            .entry(group)
            .or_insert_with(|| GroupSamples::new(window));
        stats.cancellations = stats.cancellations.saturating_add(1);
    }

    pub fn total_requests(&self) -> u64 {
        self.counters.requests.load(Ordering::Relaxed)
    }

    pub fn total_allocations(&self) -> u64 {
        self.counters.allocations.load(Ordering::Relaxed)
    }

    /// Mean of the recorded processing intervals, `None` before the second
    /// allocation.
    pub fn average_processing_interval(&self) -> Option<Duration> {
        let intervals = self.samples.lock().intervals.to_vec();
        mean_duration(&intervals)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (waits, intervals, groups, processing_interval_seconds, priority_scores) = {
            let samples = self.samples.lock();
            let groups: Vec<_> = samples
                .groups
                .iter()
                .map(|(group, stats)| {
                    (
                        *group,
                        stats.requests,
                        stats.allocations,
                        stats.cancellations,
                        stats.waits.to_vec(),
                    )
                })
                .collect();
            (
                samples.waits.to_vec(),
                samples.intervals.to_vec(),
                groups,
                samples.processing_intervals.snapshot(),
                samples.priority_scores.snapshot(),
            )
        };

        let total_allocations = self.total_allocations();
        let observed_groups = groups.len();
        let target = if observed_groups == 0 {
            0.0
        } else {
            1.0 / observed_groups as f64
        };
        let groups = groups
            .into_iter()
            .map(|(group, requests, allocations, cancellations, waits)| {
                let allocation_rate = if total_allocations == 0 {
                    0.0
                } else {
                    allocations as f64 / total_allocations as f64
                };
                GroupSnapshot {
                    group,
                    requests,
                    allocations,
                    cancellations,
                    allocation_rate,
                    target_allocation_rate: target,
                    actual_vs_target_ratio: if target > 0.0 {
                        allocation_rate / target
                    } else {
                        0.0
                    },
                    average_wait: mean_duration(&waits).unwrap_or_default(),
                }
            })
            .collect();

        let rate_window = self.config.rate_window.min(intervals.len());
        let recent = &intervals[intervals.len() - rate_window..];

        MetricsSnapshot {
            total_requests: self.total_requests(),
            total_allocations,
            total_cancellations: self.counters.cancellations.load(Ordering::Relaxed),
            wait: wait_stats(&waits),
            average_processing_interval: mean_duration(&intervals),
            allocation_rate: per_hour(recent),
            queue_turnover_rate: per_hour(&intervals),
            groups,
            processing_interval_seconds,
            priority_scores,
        }
    }
}

fn mean_duration(values: &[Duration]) -> Option<Duration> {
    if values.is_empty() {
        return None;
    }
    let total: Duration = values.iter().sum();
    Some(total / values.len() as u32)
}

/// Events per hour implied by a run of inter-event intervals.
fn per_hour(intervals: &[Duration]) -> f64 {
    let total: Duration = intervals.iter().sum();
    if intervals.is_empty() || total.is_zero() {
        return 0.0;
    }
    intervals.len() as f64 / (total.as_secs_f64() / 3600.0)
}

fn wait_stats(waits: &[Duration]) -> WaitStats {
    if waits.is_empty() {
        return WaitStats::default();
    }
    let mut secs: Vec<f64> = waits.iter().map(Duration::as_secs_f64).collect();
    secs.sort_by(f64::total_cmp);

    let min = secs[0];
    let max = secs[secs.len() - 1];
    let mean = secs.iter().sum::<f64>() / secs.len() as f64;
    WaitStats {
        samples: secs.len(),
        average: Duration::from_secs_f64(mean),
        median: Duration::from_secs_f64(percentile_sorted(&secs, 50.0)),
        p95: Duration::from_secs_f64(percentile_sorted(&secs, 95.0)),
        p99: Duration::from_secs_f64(percentile_sorted(&secs, 99.0)),
        min: Duration::from_secs_f64(min),
        max: Duration::from_secs_f64(max),
        max_ratio: if min > 0.0 { max / min } else { 0.0 },
        gini: gini_sorted(&secs),
    }
}

/// Linear-interpolated percentile of ascending `sorted` values.
pub fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = (pct.clamp(0.0, 100.0) / 100.0) * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

/// Gini coefficient of non-negative values; input order does not matter.
pub fn gini(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    gini_sorted(&sorted)
}

/// `Σ(2i − n − 1)·vᵢ / (n·Σvᵢ)` over ascending values, `i` from 1.
fn gini_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n < 2 {
        return 0.0;
    }
    let total: f64 = sorted.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let nf = n as f64;
    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, value)| (2.0 * (i + 1) as f64 - nf - 1.0) * value)
        .sum();
    (weighted / (nf * total)).max(0.0)
}
