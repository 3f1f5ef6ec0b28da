use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use time::OffsetDateTime;

use crate::profile::{ResetPolicy, ServiceProfile};

/// Current wall clock in unix milliseconds.
pub(crate) fn now_unix_ms() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos / 1_000_000).max(0) as u64
}

/// Result of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// One quota slot is tentatively claimed; the ticket must later be
    /// committed or released.
    Reserved(ReservationTicket),
    WouldExceed,
}

/// Opaque handle for one tentative quota claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationTicket(u64);

#[derive(Debug, Clone, Copy)]
struct Reservation {
    ticket: ReservationTicket,
    issued_at_ms: u64,
}

#[derive(Debug, Default)]
struct WindowInner {
    committed: u32,
    reservations: Vec<Reservation>,
}

/// Per-key usage window with tentative reservations.
///
/// Admission happens under one fine-grained lock per key; the window-start
/// field is a separate atomic so the expiry check and reset stay
/// idempotent under concurrent callers (first CAS wins, losers observe a
/// fresh window).
#[derive(Debug)]
pub struct UsageWindow {
    window_start_ms: AtomicU64,
    inner: Mutex<WindowInner>,
    next_ticket: AtomicU64,
}

impl UsageWindow {
    pub fn new(profile: &ServiceProfile, now_ms: u64) -> Self {
        Self {
            window_start_ms: AtomicU64::new(aligned_start(profile, now_ms)),
            inner: Mutex::new(WindowInner::default()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Tentatively claim one slot. The expired-window check runs first, so
    /// quota frees up lazily without any timer.
    pub fn reserve(&self, profile: &ServiceProfile, now_ms: u64) -> ReserveOutcome {
        let mut inner = self.lock_inner();
        self.reset_locked(&mut inner, profile, now_ms);

        let in_flight = inner.committed.saturating_add(inner.reservations.len() as u32);
        if in_flight >= profile.effective_quota() {
            return ReserveOutcome::WouldExceed;
        }

        let ticket = ReservationTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        inner.reservations.push(Reservation {
            ticket,
            issued_at_ms: now_ms,
        });
        ReserveOutcome::Reserved(ticket)
    }

    /// Confirm that a reserved slot was consumed against provider quota.
    /// Returns `false` when the ticket is unknown (already settled).
    pub fn commit(&self, ticket: ReservationTicket) -> bool {
        let mut inner = self.lock_inner();
        if remove_reservation(&mut inner.reservations, ticket) {
            inner.committed = inner.committed.saturating_add(1);
            true
        } else {
            false
        }
    }

    /// Give an unused reserved slot back.
    pub fn release(&self, ticket: ReservationTicket) -> bool {
        let mut inner = self.lock_inner();
        remove_reservation(&mut inner.reservations, ticket)
    }

    /// Slots still admissible right now (after buffer, committed, and
    /// outstanding reservations).
    pub fn remaining(&self, profile: &ServiceProfile, now_ms: u64) -> u32 {
        let mut inner = self.lock_inner();
        self.reset_locked(&mut inner, profile, now_ms);
        let in_flight = inner.committed.saturating_add(inner.reservations.len() as u32);
        profile.effective_quota().saturating_sub(in_flight)
    }

    /// Reset the window if it has expired. Idempotent: concurrent calls at
    /// a boundary produce exactly one logical reset.
    pub fn reset_if_due(&self, profile: &ServiceProfile, now_ms: u64) -> bool {
        let mut inner = self.lock_inner();
        self.reset_locked(&mut inner, profile, now_ms)
    }

    /// When the current window ends, in unix milliseconds.
    pub fn window_reset_at_ms(&self, profile: &ServiceProfile) -> u64 {
        let window_ms = window_ms(profile);
        self.window_start_ms
            .load(Ordering::Acquire)
            .saturating_add(window_ms)
    }

    pub fn committed(&self) -> u32 {
        self.lock_inner().committed
    }

    pub fn reserved(&self) -> u32 {
        self.lock_inner().reservations.len() as u32
    }

    /// Tickets unsettled since before `cutoff_ms`, removed and returned so
    /// the sweep can force-release them.
    pub(crate) fn take_leaked(&self, cutoff_ms: u64) -> Vec<ReservationTicket> {
        let mut inner = self.lock_inner();
        let mut leaked = Vec::new();
        inner.reservations.retain(|r| {
            if r.issued_at_ms < cutoff_ms {
                leaked.push(r.ticket);
                false
            } else {
                true
            }
        });
        leaked
    }

    fn reset_locked(
        &self,
        inner: &mut WindowInner,
        profile: &ServiceProfile,
        now_ms: u64,
    ) -> bool {
        let window_ms = window_ms(profile);
        let start = self.window_start_ms.load(Ordering::Acquire);

        let due = match profile.reset_policy {
            ResetPolicy::Rolling => now_ms.saturating_sub(start) >= window_ms,
            ResetPolicy::FixedBoundary => now_ms / window_ms > start / window_ms,
        };
        if !due {
            return false;
        }

        let new_start = aligned_start(profile, now_ms);
        if self
            .window_start_ms
            .compare_exchange(start, new_start, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Outstanding reservations survive a reset; they settle against
            // the fresh window.
            inner.committed = 0;
            true
        } else {
            false
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, WindowInner> {
        self.inner
            .lock()
            .expect("usage window lock is not poisoned")
    }
}

fn remove_reservation(reservations: &mut Vec<Reservation>, ticket: ReservationTicket) -> bool {
    if let Some(pos) = reservations.iter().position(|r| r.ticket == ticket) {
        reservations.remove(pos);
        true
    } else {
        false
    }
}

fn window_ms(profile: &ServiceProfile) -> u64 {
    (profile.window.as_millis() as u64).max(1)
}

fn aligned_start(profile: &ServiceProfile, now_ms: u64) -> u64 {
    match profile.reset_policy {
        ResetPolicy::Rolling => now_ms,
        ResetPolicy::FixedBoundary => {
            let window_ms = window_ms(profile);
            now_ms - now_ms % window_ms
        }
    }
}
