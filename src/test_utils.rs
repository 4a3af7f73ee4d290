use tracing_subscriber::{EnvFilter, fmt};

/// Installs a test-writer subscriber once per process. Filtered by `RUST_LOG`.
pub fn trace_init() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
