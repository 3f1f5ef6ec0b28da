use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::outcome::ErrorClass;
use crate::service::ServiceKind;

/// How a usage window advances when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// The window restarts from the moment the expired window is observed.
    Rolling,
    /// Windows are aligned to fixed boundaries (epoch multiples of the
    /// window length), matching providers that reset on calendar edges.
    FixedBoundary,
}

/// Backoff strategy for retrying failed provider requests.
///
/// The pool itself never retries; this rides on the profile so callers and
/// adapters apply one consistent policy per service.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    /// Apply +/- 50% random jitter to each delay.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 3,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given 0-based retry attempt, `None` once retries
    /// are spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }

        let scale = self.multiplier.powf(f64::from(attempt));
        let seconds = self.initial_delay.as_secs_f64() * scale;
        let capped = seconds.min(self.max_delay.as_secs_f64());
        let mut delay = Duration::from_secs_f64(capped);

        if self.jitter {
            let jitter_ms = (delay.as_millis() as f64 * 0.5) as u64;
            let offset = fastrand::u64(0..=(jitter_ms * 2));
            let total_ms = delay.as_millis() as i64 + (offset as i64 - jitter_ms as i64);
            delay = Duration::from_millis(total_ms.max(0) as u64);
        }

        Some(delay)
    }
}

/// Which provider signals count as rate-limit, auth, or fatal failures.
/// Anything unlisted is treated as transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRules {
    pub rate_limit_statuses: Vec<u16>,
    pub auth_statuses: Vec<u16>,
    pub fatal_statuses: Vec<u16>,
}

impl Default for FailureRules {
    fn default() -> Self {
        Self {
            rate_limit_statuses: vec![429],
            auth_statuses: vec![401, 403],
            fatal_statuses: vec![400, 404, 422],
        }
    }
}

impl FailureRules {
    pub fn classify_status(&self, status: u16) -> ErrorClass {
        if self.rate_limit_statuses.contains(&status) {
            ErrorClass::RateLimited
        } else if self.auth_statuses.contains(&status) {
            ErrorClass::AuthFailed
        } else if self.fatal_statuses.contains(&status) {
            ErrorClass::Fatal
        } else {
            ErrorClass::Transient
        }
    }
}

/// Health state machine thresholds, per service.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Consecutive failures before a key is deprioritized.
    pub degrade_after: u32,
    /// Consecutive failures before a key is quarantined.
    pub cooldown_after: u32,
    /// Consecutive successes needed to promote Degraded back to Active.
    pub promote_after: u32,
    pub base_cooldown: Duration,
    /// Growth factor applied after each failed half-open probe.
    pub cooldown_multiplier: f64,
    pub max_cooldown: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degrade_after: 3,
            cooldown_after: 5,
            promote_after: 2,
            base_cooldown: Duration::from_secs(600),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(3600),
        }
    }
}

/// Static description of one external service: quota shape, timing, and
/// failure classification. Immutable once loaded except through explicit
/// reconfiguration via the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceProfile {
    pub service: ServiceKind,
    /// Max calls per key per window.
    pub quota: u32,
    pub window: Duration,
    pub reset_policy: ResetPolicy,
    pub request_timeout: Duration,
    pub retry_backoff: BackoffPolicy,
    pub failure_rules: FailureRules,
    /// Fraction of quota withheld so a key stops slightly before the
    /// provider's hard limit (clock skew, in-flight reservations).
    pub reserve_buffer: f64,
    pub health: HealthThresholds,
    /// Reservations unsettled for longer than this are treated as leaked.
    pub reservation_grace: Duration,
}

impl ServiceProfile {
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);
    const MONTH: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    pub fn openrouter_default() -> Self {
        // Free tier: 50 messages/day, resets at the day boundary.
        Self::base(ServiceKind::OpenRouter, 50, Self::DAY)
    }

    pub fn serpapi_default() -> Self {
        // Free tier: 100 searches/month.
        Self::base(ServiceKind::SerpApi, 100, Self::MONTH)
    }

    pub fn jina_default() -> Self {
        Self::base(ServiceKind::Jina, 1_000, Self::MONTH)
    }

    pub fn firecrawl_default() -> Self {
        Self::base(ServiceKind::Firecrawl, 500, Self::MONTH)
    }

    pub fn tavily_default() -> Self {
        Self::base(ServiceKind::Tavily, 1_000, Self::MONTH)
    }

    pub fn exa_default() -> Self {
        Self::base(ServiceKind::Exa, 1_000, Self::MONTH)
    }

    pub fn default_for(service: ServiceKind) -> Self {
        match service {
            ServiceKind::OpenRouter => Self::openrouter_default(),
            ServiceKind::SerpApi => Self::serpapi_default(),
            ServiceKind::Jina => Self::jina_default(),
            ServiceKind::Firecrawl => Self::firecrawl_default(),
            ServiceKind::Tavily => Self::tavily_default(),
            ServiceKind::Exa => Self::exa_default(),
        }
    }

    /// Conservative fallback for a service with no tuned profile.
    pub fn generic(service: ServiceKind) -> Self {
        Self::base(service, 1_000, Self::DAY)
    }

    fn base(service: ServiceKind, quota: u32, window: Duration) -> Self {
        Self {
            service,
            quota,
            window,
            reset_policy: ResetPolicy::FixedBoundary,
            request_timeout: Duration::from_secs(30),
            retry_backoff: BackoffPolicy::default(),
            failure_rules: FailureRules::default(),
            reserve_buffer: 0.10,
            health: HealthThresholds::default(),
            reservation_grace: Duration::from_secs(60),
        }
    }

    /// Quota after withholding the predictive buffer. Small quotas are
    /// unaffected (the buffer rounds down); a non-zero quota always admits
    /// at least one call.
    pub fn effective_quota(&self) -> u32 {
        if self.quota == 0 {
            return 0;
        }
        let withheld = (f64::from(self.quota) * self.reserve_buffer.clamp(0.0, 1.0)) as u32;
        self.quota.saturating_sub(withheld).max(1)
    }

    pub fn with_quota(mut self, quota: u32, window: Duration) -> Self {
        self.quota = quota;
        self.window = window;
        self
    }

    pub fn with_reset_policy(mut self, policy: ResetPolicy) -> Self {
        self.reset_policy = policy;
        self
    }

    pub fn with_reserve_buffer(mut self, fraction: f64) -> Self {
        self.reserve_buffer = fraction;
        self
    }

    pub fn with_health(mut self, health: HealthThresholds) -> Self {
        self.health = health;
        self
    }

    pub fn with_reservation_grace(mut self, grace: Duration) -> Self {
        self.reservation_grace = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openrouter_profile_matches_free_tier() {
        let profile = ServiceProfile::openrouter_default();

        assert_eq!(profile.service, ServiceKind::OpenRouter);
        assert_eq!(profile.quota, 50);
        assert_eq!(profile.window, Duration::from_secs(86_400));
        assert_eq!(profile.reset_policy, ResetPolicy::FixedBoundary);
    }

    #[test]
    fn effective_quota_withholds_buffer_on_large_quotas_only() {
        let large = ServiceProfile::jina_default();
        assert_eq!(large.effective_quota(), 900);

        let small = ServiceProfile::generic(ServiceKind::Exa).with_quota(2, Duration::from_secs(60));
        assert_eq!(small.effective_quota(), 2);

        let zero = ServiceProfile::generic(ServiceKind::Exa).with_quota(0, Duration::from_secs(60));
        assert_eq!(zero.effective_quota(), 0);
    }

    #[test]
    fn classifies_statuses_per_rules() {
        let rules = FailureRules::default();

        assert_eq!(rules.classify_status(429), ErrorClass::RateLimited);
        assert_eq!(rules.classify_status(401), ErrorClass::AuthFailed);
        assert_eq!(rules.classify_status(404), ErrorClass::Fatal);
        assert_eq!(rules.classify_status(503), ErrorClass::Transient);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let backoff = BackoffPolicy {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_retries: 3,
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Some(Duration::from_secs(2)));
        assert_eq!(backoff.delay(1), Some(Duration::from_secs(4)));
        assert_eq!(backoff.delay(2), Some(Duration::from_secs(8)));
        assert_eq!(backoff.delay(3), Some(Duration::from_secs(10)));
        assert_eq!(backoff.delay(4), None);
    }
}
