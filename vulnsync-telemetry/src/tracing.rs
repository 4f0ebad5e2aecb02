//! Tracing initialization for the synchronizer and its tests.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber for production use.
///
/// The filter is read from `RUST_LOG` and falls back to `info` when the variable
/// is not set. Panics if a global subscriber was already installed, since that
/// indicates a programming error in the binary setup.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

static TEST_TRACING: Once = Once::new();

/// Initializes tracing for tests.
///
/// Multiple tests run in the same process, so initialization must happen at most
/// once and must never panic when another test got there first.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
            .with_test_writer()
            .try_init();
    });
}
