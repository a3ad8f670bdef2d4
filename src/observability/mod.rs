//! Observability: Prometheus metrics and tracing setup.

pub mod metrics;

use tracing_subscriber::EnvFilter;

/// Initialize process-wide tracing. `RUST_LOG` overrides the default level.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
