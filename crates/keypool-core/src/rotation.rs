use std::cmp::Ordering;
use std::sync::Mutex;

/// Time constant for the decayed selection-rate counter.
pub(crate) const RATE_TAU_MS: f64 = 60_000.0;

#[derive(Debug, Default)]
struct RotationInner {
    last_selected_ms: Option<u64>,
    total_selections: u64,
    recent_rate: f64,
    rate_updated_ms: u64,
}

/// Per-key fairness bookkeeping. Best-effort only; never consulted for
/// quota or health correctness.
#[derive(Debug, Default)]
pub struct RotationMeta {
    inner: Mutex<RotationInner>,
}

impl RotationMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_selected(&self, now_ms: u64) {
        let mut inner = self.lock_inner();
        decay(&mut inner, now_ms);
        inner.recent_rate += 1.0;
        inner.total_selections = inner.total_selections.saturating_add(1);
        inner.last_selected_ms = Some(now_ms);
    }

    /// Decayed selections-per-window counter, used as the fairness term.
    pub fn recent_rate(&self, now_ms: u64) -> f64 {
        let mut inner = self.lock_inner();
        decay(&mut inner, now_ms);
        inner.recent_rate
    }

    pub fn last_selected_ms(&self) -> Option<u64> {
        self.lock_inner().last_selected_ms
    }

    pub fn total_selections(&self) -> u64 {
        self.lock_inner().total_selections
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, RotationInner> {
        self.inner
            .lock()
            .expect("rotation metadata lock is not poisoned")
    }
}

fn decay(inner: &mut RotationInner, now_ms: u64) {
    let elapsed = now_ms.saturating_sub(inner.rate_updated_ms) as f64;
    if elapsed > 0.0 {
        inner.recent_rate *= (-elapsed / RATE_TAU_MS).exp();
        inner.rate_updated_ms = now_ms;
    }
}

/// Ordering key for one reserved candidate.
///
/// Composite order: health tier (Active, then Degraded, then half-open
/// probes), then lowest weight-adjusted recent selection rate, then most
/// remaining quota, then least recently selected. Pure round-robin would
/// exhaust keys unevenly; pure greedy-by-remaining would starve low-traffic
/// keys of the exercise needed to notice recovery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CandidateRank {
    pub tier: u8,
    pub weighted_rate: f64,
    pub remaining: u32,
    pub last_selected_ms: Option<u64>,
}

pub(crate) const TIER_ACTIVE: u8 = 0;
pub(crate) const TIER_DEGRADED: u8 = 1;
pub(crate) const TIER_PROBE: u8 = 2;

impl CandidateRank {
    pub(crate) fn compare(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then_with(|| {
                self.weighted_rate
                    .partial_cmp(&other.weighted_rate)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| other.remaining.cmp(&self.remaining))
            .then_with(|| match (self.last_selected_ms, other.last_selected_ms) {
                (None, None) => Ordering::Equal,
                // Never-selected keys win the round-robin tie-break.
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(&b),
            })
    }
}
