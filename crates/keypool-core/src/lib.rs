//! Core key pool management for external research services.
//!
//! This crate contains:
//! - Per-service credential pools with quota-safe selection
//! - Usage windows with a reserve/commit/release discipline
//! - A per-key health state machine with half-open probing
//! - Fairness-aware rotation ordering
//! - An append-only audit sink for selection and health history
//! - Trait seams for persistence and provider transports

pub mod adapter;
pub mod audit;
pub mod error;
pub mod health;
pub mod key;
pub mod outcome;
pub mod pool;
pub mod profile;
pub mod registry;
pub mod rotation;
pub mod service;
pub mod store;
pub mod sweep;
pub mod usage;

pub use adapter::{
    AdapterRequest, AdapterResponse, ClassifiedError, NoopAdapter, ServiceAdapter,
};
pub use audit::{
    AuditEvent, AuditFilter, AuditKind, AuditSeverity, AuditSink, AuditStats,
    DEFAULT_AUDIT_CAPACITY,
};
pub use error::PoolError;
pub use health::{Admission, HealthRecord, HealthSnapshot, HealthState, HealthTransition};
pub use key::{
    ApiKey, ApiKeySummary, ImportReport, KeyExport, KeyId, KeyImport, KeySecret, NewKey,
};
pub use outcome::{CallOutcome, ErrorClass};
pub use pool::{KeyPool, PoolStats, SelectedKey, SweepReport, UsageStatus};
pub use profile::{
    BackoffPolicy, FailureRules, HealthThresholds, ResetPolicy, ServiceProfile,
};
pub use registry::ProfileRegistry;
pub use rotation::RotationMeta;
pub use service::ServiceKind;
pub use store::{KeyStore, MemoryKeyStore, StoreError};
pub use sweep::{spawn_sweeper, DEFAULT_SWEEP_INTERVAL};
pub use usage::{ReservationTicket, ReserveOutcome, UsageWindow};
