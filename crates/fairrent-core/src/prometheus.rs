use std::fmt::Write;

use crate::api::{FairnessMetrics, Histogram};

/// Renders a metrics snapshot in the Prometheus text exposition format.
///
/// An empty namespace falls back to `fairrent`.
pub fn render_metrics(metrics: &FairnessMetrics, namespace: &str) -> String {
    let ns = if namespace.is_empty() {
        "fairrent"
    } else {
        namespace
    };

    let mut out = String::new();
    push_metric(
        &mut out,
        ns,
        "requests_enqueued_total",
        "Total allocation requests enqueued",
        "counter",
        metrics.total_requests as f64,
    );
    push_metric(
        &mut out,
        ns,
        "requests_processed_total",
        "Total allocation requests scheduled",
        "counter",
        metrics.total_allocations as f64,
    );
    push_metric(
        &mut out,
        ns,
        "requests_cancelled_total",
        "Total allocation requests cancelled",
        "counter",
        metrics.total_cancellations as f64,
    );
    push_metric(
        &mut out,
        ns,
        "queue_length",
        "Pending allocation requests",
        "gauge",
        metrics.active_requests as f64,
    );
    push_metric(
        &mut out,
        ns,
        "fairness_alpha",
        "Current fairness exponent",
        "gauge",
        metrics.alpha,
    );
    push_metric(
        &mut out,
        ns,
        "wait_gini_coefficient",
        "Gini coefficient of recent wait times",
        "gauge",
        metrics.gini_coefficient,
    );

    let _ = writeln!(
        out,
        "# HELP {ns}_wait_seconds Recent wait time quantiles\n# TYPE {ns}_wait_seconds summary"
    );
    for (quantile, value) in [
        ("0.5", metrics.median_wait),
        ("0.95", metrics.p95_wait),
        ("0.99", metrics.p99_wait),
    ] {
        let _ = writeln!(
            out,
            "{ns}_wait_seconds{{quantile=\"{quantile}\"}} {}",
            value.as_secs_f64()
        );
    }

    push_histogram(
        &mut out,
        ns,
        "processing_duration_seconds",
        "Interval between consecutive allocations",
        &metrics.processing_interval_seconds,
    );
    push_histogram(
        &mut out,
        ns,
        "priority_scores",
        "Priority score of scheduled requests",
        &metrics.priority_scores,
    );

    if !metrics.group_metrics.is_empty() {
        let _ = writeln!(
            out,
            "# HELP {ns}_group_allocation_ratio Allocation share relative to an equal split\n# TYPE {ns}_group_allocation_ratio gauge"
        );
        for group in &metrics.group_metrics {
            let _ = writeln!(
                out,
                "{ns}_group_allocation_ratio{{group=\"{}\"}} {}",
                group.group, group.actual_vs_target_ratio
            );
        }
        let _ = writeln!(
            out,
            "# HELP {ns}_group_pending Pending requests per group\n# TYPE {ns}_group_pending gauge"
        );
        for group in &metrics.group_metrics {
            let _ = writeln!(
                out,
                "{ns}_group_pending{{group=\"{}\"}} {}",
                group.group, group.pending
            );
        }
    }

    out
}

fn push_metric(out: &mut String, ns: &str, name: &str, help: &str, kind: &str, value: f64) {
    let _ = writeln!(
        out,
        "# HELP {ns}_{name} {help}\n# TYPE {ns}_{name} {kind}\n{ns}_{name} {value}"
    );
}

fn push_histogram(out: &mut String, ns: &str, name: &str, help: &str, histogram: &Histogram) {
    if histogram.buckets.is_empty() {
        return;
    }
    let _ = writeln!(out, "# HELP {ns}_{name} {help}\n# TYPE {ns}_{name} histogram");
    let mut cumulative = 0u64;
    for bucket in &histogram.buckets {
        cumulative = cumulative.saturating_add(bucket.count);
        let le = if bucket.le.is_infinite() {
            "+Inf".to_string()
        } else {
            bucket.le.to_string()
        };
        let _ = writeln!(out, "{ns}_{name}_bucket{{le=\"{le}\"}} {cumulative}");
    }
    let _ = writeln!(
        out,
        "{ns}_{name}_sum {}\n{ns}_{name}_count {}",
        histogram.sum, histogram.count
    );
}
