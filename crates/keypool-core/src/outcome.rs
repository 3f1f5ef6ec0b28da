use serde::{Deserialize, Serialize};

/// Failure classification consumed by the health state machine. Derived
/// from a profile's failure rules, never from provider payloads directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Provider signalled its rate limit. Always forces Cooldown.
    RateLimited,
    /// Credential rejected. Retries cannot help; escalates to Cooldown
    /// and flags the key for operator attention.
    AuthFailed,
    /// Network error or timeout. Counts toward the failure streak only.
    Transient,
    /// Provider-side configuration/request error. Escalates like auth.
    Fatal,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::AuthFailed => "auth_failed",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }

    /// Whether this class quarantines the key immediately, independent of
    /// the consecutive-failure count.
    pub const fn forces_cooldown(self) -> bool {
        matches!(self, Self::RateLimited | Self::AuthFailed | Self::Fatal)
    }
}

/// Outcome of one dispatched call, reported back exactly once per
/// selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallOutcome {
    Success {
        latency_ms: u64,
    },
    Failure {
        class: ErrorClass,
        /// Whether the request reached the provider. Determines if the
        /// reservation consumed quota (commit) or not (release).
        reached_provider: bool,
        latency_ms: Option<u64>,
    },
}

impl CallOutcome {
    pub const fn success(latency_ms: u64) -> Self {
        Self::Success { latency_ms }
    }

    /// A rate-limit signal necessarily came from the provider.
    pub const fn rate_limited() -> Self {
        Self::Failure {
            class: ErrorClass::RateLimited,
            reached_provider: true,
            latency_ms: None,
        }
    }

    pub const fn auth_failed() -> Self {
        Self::Failure {
            class: ErrorClass::AuthFailed,
            reached_provider: true,
            latency_ms: None,
        }
    }

    pub const fn transient(reached_provider: bool) -> Self {
        Self::Failure {
            class: ErrorClass::Transient,
            reached_provider,
            latency_ms: None,
        }
    }

    pub const fn fatal() -> Self {
        Self::Failure {
            class: ErrorClass::Fatal,
            reached_provider: true,
            latency_ms: None,
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub const fn latency_ms(&self) -> Option<u64> {
        match self {
            Self::Success { latency_ms } => Some(*latency_ms),
            Self::Failure { latency_ms, .. } => *latency_ms,
        }
    }
}

/// How a reservation is settled once the outcome is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// The call consumed provider quota.
    Commit,
    /// The attempt never reached the provider; the slot is given back.
    Release,
}

impl Settlement {
    pub(crate) const fn for_outcome(outcome: &CallOutcome) -> Self {
        match outcome {
            CallOutcome::Success { .. } => Self::Commit,
            CallOutcome::Failure {
                reached_provider, ..
            } => {
                if *reached_provider {
                    Self::Commit
                } else {
                    Self::Release
                }
            }
        }
    }
}
