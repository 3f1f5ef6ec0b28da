// Test library for key pool behavioral suites
pub use keypool_core::{
    audit::{AuditFilter, AuditKind, AuditSeverity},
    key::{KeyImport, NewKey},
    outcome::{CallOutcome, ErrorClass},
    pool::KeyPool,
    profile::{HealthThresholds, ResetPolicy, ServiceProfile},
    HealthState, KeyId, PoolError, ServiceKind,
};
pub use std::sync::Arc;
pub use std::time::Duration;

/// Install a fmt subscriber once so `RUST_LOG` works while debugging these
/// suites. Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
