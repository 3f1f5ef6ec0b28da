use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::health::HealthState;
use crate::service::ServiceKind;
use crate::PoolError;

/// Unique identifier for a pooled credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(Uuid);

impl KeyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for KeyId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for KeyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Opaque secret material. The value never appears in `Debug`/`Display`
/// output, log lines, or audit payloads; only `expose` yields it, at the
/// point of the outbound call.
#[derive(Clone)]
pub struct KeySecret(String);

impl KeySecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Debug for KeySecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySecret(***)")
    }
}

impl Display for KeySecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

/// A pooled credential for one external service.
///
/// Mutated only through the pool: selection updates rotation metadata,
/// recorded outcomes update health and usage, removal is a soft delete so
/// audit history keeps resolving.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: KeyId,
    pub service: ServiceKind,
    pub label: String,
    pub secret: KeySecret,
    /// Fairness weight: a key with weight 2 tolerates twice the recent
    /// selection rate of a weight-1 key before losing rotation priority.
    pub priority_weight: u32,
    pub created_at: OffsetDateTime,
    pub deleted: bool,
}

impl ApiKey {
    pub fn new(service: ServiceKind, label: impl Into<String>, secret: KeySecret) -> Self {
        Self {
            id: KeyId::new(),
            service,
            label: label.into(),
            secret,
            priority_weight: 1,
            created_at: OffsetDateTime::now_utc(),
            deleted: false,
        }
    }
}

/// Request payload for adding a single key to the pool.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub service: ServiceKind,
    pub label: String,
    pub secret: String,
    pub priority_weight: Option<u32>,
}

impl NewKey {
    pub fn new(service: ServiceKind, label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            service,
            label: label.into(),
            secret: secret.into(),
            priority_weight: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        if self.label.trim().is_empty() {
            return Err(PoolError::InvalidKey {
                reason: String::from("label cannot be empty"),
            });
        }
        if self.secret.trim().is_empty() {
            return Err(PoolError::InvalidKey {
                reason: String::from("secret cannot be empty"),
            });
        }
        Ok(())
    }
}

/// Key summary exposed to the GUI/reporting collaborator. Never carries
/// secret material.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeySummary {
    pub id: KeyId,
    pub service: ServiceKind,
    pub label: String,
    pub state: HealthState,
    pub remaining: u32,
    pub quota: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub avg_latency_ms: Option<f64>,
    pub total_selections: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_selected_at: Option<OffsetDateTime>,
    pub deleted: bool,
}

/// One entry of a bulk key import.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyImport {
    pub service: ServiceKind,
    pub label: String,
    pub secret: String,
}

/// Per-item result of a bulk import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: u32,
    pub failed: u32,
    pub errors: Vec<String>,
}

/// Exportable key description. Secret material is intentionally absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExport {
    pub service: ServiceKind,
    pub label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub state: HealthState,
    pub total_selections: u64,
}
