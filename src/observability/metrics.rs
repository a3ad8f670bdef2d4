//! # Metrics
//!
//! Prometheus metrics exposed on `GET /metrics`:
//!
//! - `hydros_reconciles_total` - reconciles dispatched by the manager
//! - `hydros_reconcile_errors_total` - reconciles that failed or panicked
//! - `hydros_reconcile_duration_seconds` - reconcile latency
//! - `hydros_prs_opened_total` - pull requests opened
//! - `hydros_images_replicated_total` - images copied to a destination

use prometheus::{Histogram, IntCounter, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new(
            "hydros_reconciles_total",
            "Reconciles dispatched by the manager",
        )
        .expect("valid metric definition"),
    )
});

static RECONCILE_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new(
            "hydros_reconcile_errors_total",
            "Reconciles that failed or panicked",
        )
        .expect("valid metric definition"),
    )
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register(
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "hydros_reconcile_duration_seconds",
                "Duration of reconciles in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )
        .expect("valid metric definition"),
    )
});

static PRS_OPENED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new("hydros_prs_opened_total", "Pull requests opened").expect("valid metric definition"),
    )
});

static IMAGES_REPLICATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new(
            "hydros_images_replicated_total",
            "Images copied to a destination registry",
        )
        .expect("valid metric definition"),
    )
});

fn register<M: prometheus::core::Collector + Clone + 'static>(metric: M) -> M {
    REGISTRY
        .register(Box::new(metric.clone()))
        .expect("metric registered once");
    metric
}

pub fn reconciles_inc() {
    RECONCILES_TOTAL.inc();
}

pub fn reconcile_errors_inc() {
    RECONCILE_ERRORS_TOTAL.inc();
}

pub fn reconcile_duration_observe(seconds: f64) {
    RECONCILE_DURATION.observe(seconds);
}

pub fn prs_opened_inc() {
    PRS_OPENED_TOTAL.inc();
}

pub fn images_replicated_inc() {
    IMAGES_REPLICATED_TOTAL.inc();
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        reconciles_inc();
        reconcile_errors_inc();
        reconcile_duration_observe(0.25);
        let text = gather_text().unwrap();
        assert!(text.contains("hydros_reconciles_total"));
        assert!(text.contains("hydros_reconcile_errors_total"));
    }
}
