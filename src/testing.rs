//! Shared helpers for this crate's tests.

/// Install a tracing subscriber once per test binary.  Filtering follows
/// `RUST_LOG`; output goes through the test writer so it stays attached to
/// the owning test.
pub(crate) fn init_test_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
