use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::health::HealthState;
use crate::key::KeyId;
use crate::service::ServiceKind;

/// What a recorded event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Selection,
    Exhaustion,
    HealthTransition,
    ReservationLeak,
    AdminAction,
    WindowReset,
    ConfigChange,
    KeyAdded,
    KeyRemoved,
}

impl AuditKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Selection => "selection",
            Self::Exhaustion => "exhaustion",
            Self::HealthTransition => "health_transition",
            Self::ReservationLeak => "reservation_leak",
            Self::AdminAction => "admin_action",
            Self::WindowReset => "window_reset",
            Self::ConfigChange => "config_change",
            Self::KeyAdded => "key_added",
            Self::KeyRemoved => "key_removed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Immutable record of one selection decision, health transition, or
/// administrative action. Never carries secret material.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub kind: AuditKind,
    pub severity: AuditSeverity,
    pub key_id: Option<KeyId>,
    pub service: Option<ServiceKind>,
    pub resulting_state: Option<HealthState>,
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, severity: AuditSeverity) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: OffsetDateTime::now_utc(),
            kind,
            severity,
            key_id: None,
            service: None,
            resulting_state: None,
            reason: None,
        }
    }

    pub fn info(kind: AuditKind) -> Self {
        Self::new(kind, AuditSeverity::Info)
    }

    pub fn warning(kind: AuditKind) -> Self {
        Self::new(kind, AuditSeverity::Warning)
    }

    pub fn with_key(mut self, key_id: KeyId) -> Self {
        self.key_id = Some(key_id);
        self
    }

    pub fn with_service(mut self, service: ServiceKind) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_state(mut self, state: HealthState) -> Self {
        self.resulting_state = Some(state);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Filter for audit queries. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub key_id: Option<KeyId>,
    pub service: Option<ServiceKind>,
    pub kind: Option<AuditKind>,
    pub severity: Option<AuditSeverity>,
    pub since: Option<OffsetDateTime>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(key_id) = self.key_id {
            if event.key_id != Some(key_id) {
                return false;
            }
        }
        if let Some(service) = self.service {
            if event.service != Some(service) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if event.severity != severity {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.at < since {
                return false;
            }
        }
        true
    }
}

/// Aggregate counters over everything ever recorded, including events the
/// ring has since evicted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total_recorded: u64,
    pub evicted: u64,
    pub by_kind: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct SinkInner {
    events: VecDeque<AuditEvent>,
    stats: AuditStats,
}

/// Append-only bounded event log. Durable retention is the reporting
/// collaborator's concern; the ring keeps the recent tail queryable
/// in-process.
#[derive(Debug)]
pub struct AuditSink {
    capacity: usize,
    inner: Mutex<SinkInner>,
}

pub const DEFAULT_AUDIT_CAPACITY: usize = 4_096;

impl Default for AuditSink {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditSink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(SinkInner::default()),
        }
    }

    pub fn record(&self, event: AuditEvent) {
        let mut inner = self.lock_inner();
        inner.stats.total_recorded += 1;
        *inner
            .stats
            .by_kind
            .entry(event.kind.as_str().to_owned())
            .or_insert(0) += 1;
        *inner
            .stats
            .by_severity
            .entry(event.severity.as_str().to_owned())
            .or_insert(0) += 1;

        if inner.events.len() == self.capacity {
            inner.events.pop_front();
            inner.stats.evicted += 1;
        }
        inner.events.push_back(event);
    }

    /// Matching events, newest first, capped at `limit`.
    pub fn events(&self, filter: &AuditFilter, limit: usize) -> Vec<AuditEvent> {
        let inner = self.lock_inner();
        inner
            .events
            .iter()
            .rev()
            .filter(|event| filter.matches(event))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AuditStats {
        self.lock_inner().stats.clone()
    }

    /// JSON export of the matching tail, for the reporting collaborator.
    pub fn export_json(&self, filter: &AuditFilter, limit: usize) -> serde_json::Result<String> {
        serde_json::to_string(&self.events(filter, limit))
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SinkInner> {
        self.inner.lock().expect("audit sink lock is not poisoned")
    }
}
