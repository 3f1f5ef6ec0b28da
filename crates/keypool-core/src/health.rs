use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::outcome::ErrorClass;
use crate::profile::HealthThresholds;

/// Per-key health state.
///
/// Only `Disabled` is entered and left by administrative action; the other
/// transitions are driven by recorded outcomes. Cooldown expiry is checked
/// lazily against timestamps at selection time, never by a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Active,
    Degraded,
    Cooldown,
    Disabled,
}

impl HealthState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Cooldown => "cooldown",
            Self::Disabled => "disabled",
        }
    }
}

/// Whether a key may be handed out right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Eligible { degraded: bool },
    /// Cooldown expired; this caller holds the single half-open probe slot
    /// until the probe outcome is recorded or the claim is aborted.
    Probe,
    Excluded { state: HealthState },
}

/// A state change, surfaced so the pool can audit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: HealthState,
    pub to: HealthState,
    pub reason: String,
}

#[derive(Debug)]
struct HealthInner {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    cooldown_until_ms: Option<u64>,
    current_cooldown_ms: u64,
    probing: bool,
    total_successes: u64,
    total_failures: u64,
    ema_latency_ms: Option<f64>,
}

/// Read-only view of a key's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub avg_latency_ms: Option<f64>,
    pub cooldown_until_ms: Option<u64>,
}

/// Circuit breaker applied per key.
#[derive(Debug)]
pub struct HealthRecord {
    inner: Mutex<HealthInner>,
}

const LATENCY_EMA_ALPHA: f64 = 0.2;

impl HealthRecord {
    pub fn new(thresholds: &HealthThresholds) -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                state: HealthState::Active,
                consecutive_failures: 0,
                consecutive_successes: 0,
                cooldown_until_ms: None,
                current_cooldown_ms: thresholds.base_cooldown.as_millis() as u64,
                probing: false,
                total_successes: 0,
                total_failures: 0,
                ema_latency_ms: None,
            }),
        }
    }

    /// Check eligibility for selection. An expired cooldown admits exactly
    /// one probe: the claim sticks until that probe's outcome is recorded
    /// or `abort_probe` returns it.
    pub fn try_admit(&self, now_ms: u64) -> Admission {
        let mut inner = self.lock_inner();
        match inner.state {
            HealthState::Active => Admission::Eligible { degraded: false },
            HealthState::Degraded => Admission::Eligible { degraded: true },
            HealthState::Disabled => Admission::Excluded {
                state: HealthState::Disabled,
            },
            HealthState::Cooldown => {
                let expired = inner
                    .cooldown_until_ms
                    .map(|until| now_ms >= until)
                    .unwrap_or(true);
                if expired && !inner.probing {
                    inner.probing = true;
                    Admission::Probe
                } else {
                    Admission::Excluded {
                        state: HealthState::Cooldown,
                    }
                }
            }
        }
    }

    /// Return an unused probe claim (selection aborted before dispatch).
    pub fn abort_probe(&self) {
        let mut inner = self.lock_inner();
        inner.probing = false;
    }

    pub fn record_success(
        &self,
        thresholds: &HealthThresholds,
        latency_ms: Option<u64>,
    ) -> Option<HealthTransition> {
        let mut inner = self.lock_inner();
        inner.total_successes = inner.total_successes.saturating_add(1);
        inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
        inner.consecutive_failures = 0;
        if let Some(sample) = latency_ms {
            let sample = sample as f64;
            inner.ema_latency_ms = Some(match inner.ema_latency_ms {
                Some(ema) => LATENCY_EMA_ALPHA * sample + (1.0 - LATENCY_EMA_ALPHA) * ema,
                None => sample,
            });
        }

        match inner.state {
            HealthState::Cooldown if inner.probing => {
                inner.probing = false;
                inner.cooldown_until_ms = None;
                inner.current_cooldown_ms = thresholds.base_cooldown.as_millis() as u64;
                inner.consecutive_successes = 0;
                Some(transition(
                    &mut inner,
                    HealthState::Active,
                    "half-open probe succeeded",
                ))
            }
            HealthState::Degraded if inner.consecutive_successes >= thresholds.promote_after => {
                Some(transition(
                    &mut inner,
                    HealthState::Active,
                    "consecutive successes restored",
                ))
            }
            _ => None,
        }
    }

    pub fn record_failure(
        &self,
        thresholds: &HealthThresholds,
        class: ErrorClass,
        now_ms: u64,
    ) -> Option<HealthTransition> {
        let mut inner = self.lock_inner();
        inner.total_failures = inner.total_failures.saturating_add(1);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.consecutive_successes = 0;

        match inner.state {
            HealthState::Disabled => None,
            HealthState::Cooldown if inner.probing => {
                // Failed probe: quarantine again, backing off exponentially.
                inner.probing = false;
                let grown = (inner.current_cooldown_ms as f64 * thresholds.cooldown_multiplier)
                    as u64;
                inner.current_cooldown_ms =
                    grown.min(thresholds.max_cooldown.as_millis() as u64);
                inner.cooldown_until_ms = Some(now_ms + inner.current_cooldown_ms);
                Some(transition(
                    &mut inner,
                    HealthState::Cooldown,
                    "half-open probe failed, cooldown extended",
                ))
            }
            HealthState::Cooldown => None,
            state => {
                if class.forces_cooldown() {
                    inner.cooldown_until_ms = Some(now_ms + inner.current_cooldown_ms);
                    return Some(transition(
                        &mut inner,
                        HealthState::Cooldown,
                        match class {
                            ErrorClass::RateLimited => "provider rate limit signal",
                            ErrorClass::AuthFailed => "authentication rejected",
                            _ => "fatal provider error",
                        },
                    ));
                }
                if inner.consecutive_failures >= thresholds.cooldown_after {
                    inner.cooldown_until_ms = Some(now_ms + inner.current_cooldown_ms);
                    return Some(transition(
                        &mut inner,
                        HealthState::Cooldown,
                        "consecutive failure threshold reached",
                    ));
                }
                if state == HealthState::Active
                    && inner.consecutive_failures >= thresholds.degrade_after
                {
                    return Some(transition(
                        &mut inner,
                        HealthState::Degraded,
                        "repeated failures",
                    ));
                }
                None
            }
        }
    }

    /// Administrative quarantine. Never auto-recovers.
    pub fn force_disable(&self) -> Option<HealthTransition> {
        let mut inner = self.lock_inner();
        if inner.state == HealthState::Disabled {
            return None;
        }
        inner.probing = false;
        Some(transition(
            &mut inner,
            HealthState::Disabled,
            "disabled by administrator",
        ))
    }

    pub fn re_enable(&self, thresholds: &HealthThresholds) -> Option<HealthTransition> {
        let mut inner = self.lock_inner();
        if inner.state != HealthState::Disabled {
            return None;
        }
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.cooldown_until_ms = None;
        inner.current_cooldown_ms = thresholds.base_cooldown.as_millis() as u64;
        inner.probing = false;
        Some(transition(
            &mut inner,
            HealthState::Active,
            "re-enabled by administrator",
        ))
    }

    pub fn state(&self) -> HealthState {
        self.lock_inner().state
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.lock_inner();
        HealthSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            avg_latency_ms: inner.ema_latency_ms,
            cooldown_until_ms: inner.cooldown_until_ms,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, HealthInner> {
        self.inner
            .lock()
            .expect("health record lock is not poisoned")
    }
}

fn transition(inner: &mut HealthInner, to: HealthState, reason: &str) -> HealthTransition {
    let from = inner.state;
    inner.state = to;
    if to == HealthState::Cooldown || to == HealthState::Disabled {
        warn!(from = from.as_str(), to = to.as_str(), reason, "key health transition");
    }
    HealthTransition {
        from,
        to,
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            degrade_after: 3,
            cooldown_after: 5,
            promote_after: 2,
            base_cooldown: Duration::from_millis(1_000),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_millis(3_000),
        }
    }

    fn fail_transient(record: &HealthRecord, t: &HealthThresholds, now_ms: u64) -> Option<HealthTransition> {
        record.record_failure(t, ErrorClass::Transient, now_ms)
    }

    #[test]
    fn degrades_after_threshold_then_quarantines() {
        let t = thresholds();
        let record = HealthRecord::new(&t);

        assert!(fail_transient(&record, &t, 1).is_none());
        assert!(fail_transient(&record, &t, 2).is_none());
        let degraded = fail_transient(&record, &t, 3).expect("third failure degrades");
        assert_eq!(degraded.to, HealthState::Degraded);

        assert!(fail_transient(&record, &t, 4).is_none());
        let cooled = fail_transient(&record, &t, 5).expect("fifth failure quarantines");
        assert_eq!(cooled.to, HealthState::Cooldown);
        assert_eq!(record.state(), HealthState::Cooldown);
    }

    #[test]
    fn rate_limit_forces_cooldown_despite_prior_successes() {
        let t = thresholds();
        let record = HealthRecord::new(&t);

        for _ in 0..10 {
            record.record_success(&t, Some(20));
        }
        let cooled = record
            .record_failure(&t, ErrorClass::RateLimited, 100)
            .expect("rate limit quarantines immediately");
        assert_eq!(cooled.from, HealthState::Active);
        assert_eq!(cooled.to, HealthState::Cooldown);
    }

    #[test]
    fn cooldown_admits_single_probe_after_expiry() {
        let t = thresholds();
        let record = HealthRecord::new(&t);
        record.record_failure(&t, ErrorClass::RateLimited, 0);

        assert!(matches!(
            record.try_admit(500),
            Admission::Excluded {
                state: HealthState::Cooldown
            }
        ));

        assert_eq!(record.try_admit(1_000), Admission::Probe);
        // Second caller while the probe is in flight stays excluded.
        assert!(matches!(record.try_admit(1_001), Admission::Excluded { .. }));
    }

    #[test]
    fn probe_success_restores_active_with_counters_reset() {
        let t = thresholds();
        let record = HealthRecord::new(&t);
        for now in 0..5 {
            fail_transient(&record, &t, now);
        }
        assert_eq!(record.state(), HealthState::Cooldown);

        assert_eq!(record.try_admit(1_005), Admission::Probe);
        let restored = record
            .record_success(&t, Some(30))
            .expect("probe success promotes");
        assert_eq!(restored.to, HealthState::Active);

        let snapshot = record.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.cooldown_until_ms, None);
    }

    #[test]
    fn probe_failure_extends_cooldown_exponentially_up_to_cap() {
        let t = thresholds();
        let record = HealthRecord::new(&t);
        record.record_failure(&t, ErrorClass::RateLimited, 0);

        assert_eq!(record.try_admit(1_000), Admission::Probe);
        record.record_failure(&t, ErrorClass::Transient, 1_000);
        assert_eq!(record.snapshot().cooldown_until_ms, Some(3_000));

        assert_eq!(record.try_admit(3_000), Admission::Probe);
        record.record_failure(&t, ErrorClass::Transient, 3_000);
        // 4s of growth capped at 3s.
        assert_eq!(record.snapshot().cooldown_until_ms, Some(6_000));
    }

    #[test]
    fn degraded_promotes_back_after_consecutive_successes() {
        let t = thresholds();
        let record = HealthRecord::new(&t);
        for now in 0..3 {
            fail_transient(&record, &t, now);
        }
        assert_eq!(record.state(), HealthState::Degraded);

        assert!(record.record_success(&t, Some(10)).is_none());
        let promoted = record
            .record_success(&t, Some(10))
            .expect("second success promotes");
        assert_eq!(promoted.to, HealthState::Active);
    }

    #[test]
    fn disabled_never_auto_recovers() {
        let t = thresholds();
        let record = HealthRecord::new(&t);
        record.force_disable().expect("disable transitions");

        assert!(matches!(
            record.try_admit(u64::MAX),
            Admission::Excluded {
                state: HealthState::Disabled
            }
        ));
        assert!(record.record_success(&t, Some(5)).is_none());
        assert_eq!(record.state(), HealthState::Disabled);

        let restored = record.re_enable(&t).expect("re-enable transitions");
        assert_eq!(restored.to, HealthState::Active);
    }

    #[test]
    fn latency_ema_tracks_samples() {
        let t = thresholds();
        let record = HealthRecord::new(&t);

        record.record_success(&t, Some(100));
        assert_eq!(record.snapshot().avg_latency_ms, Some(100.0));

        record.record_success(&t, Some(200));
        let ema = record.snapshot().avg_latency_ms.expect("ema present");
        assert!((ema - 120.0).abs() < 1e-9);
    }
}
