use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditFilter, AuditKind, AuditSeverity, AuditSink, AuditStats};
use crate::health::{Admission, HealthRecord, HealthState, HealthTransition};
use crate::key::{
    ApiKey, ApiKeySummary, ImportReport, KeyExport, KeyId, KeyImport, KeySecret, NewKey,
};
use crate::outcome::{CallOutcome, ErrorClass, Settlement};
use crate::profile::ServiceProfile;
use crate::registry::ProfileRegistry;
use crate::rotation::{CandidateRank, RotationMeta, TIER_ACTIVE, TIER_DEGRADED, TIER_PROBE};
use crate::service::ServiceKind;
use crate::store::{KeyStore, MemoryKeyStore};
use crate::usage::{now_unix_ms, ReservationTicket, ReserveOutcome, UsageWindow};
use crate::PoolError;

/// One selection still awaiting its recorded outcome.
#[derive(Debug, Clone, Copy)]
struct PendingSelection {
    ticket: ReservationTicket,
    selected_at_ms: u64,
    probe: bool,
}

/// All mutable state for one pooled key. Each field carries its own
/// fine-grained lock; the selector never holds more than one entry's lock
/// at a time and never across an external call.
struct KeyEntry {
    meta: Mutex<ApiKey>,
    usage: UsageWindow,
    health: HealthRecord,
    rotation: RotationMeta,
    pending: Mutex<VecDeque<PendingSelection>>,
}

impl KeyEntry {
    fn new(key: ApiKey, profile: &ServiceProfile, now_ms: u64) -> Self {
        Self {
            meta: Mutex::new(key),
            usage: UsageWindow::new(profile, now_ms),
            health: HealthRecord::new(&profile.health),
            rotation: RotationMeta::new(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn lock_meta(&self) -> std::sync::MutexGuard<'_, ApiKey> {
        self.meta.lock().expect("key entry lock is not poisoned")
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingSelection>> {
        self.pending
            .lock()
            .expect("pending selection lock is not poisoned")
    }
}

/// The credential handed back by a selection. Carries the secret for the
/// outbound call plus the probe marker; the reservation is settled by the
/// matching `record_outcome` (or `release_selection`).
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub id: KeyId,
    pub service: ServiceKind,
    pub label: String,
    pub secret: KeySecret,
    /// This selection is the single half-open trial of a cooled-down key.
    pub is_probe: bool,
}

/// Point-in-time usage view for one key.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStatus {
    pub remaining: u32,
    pub used: u32,
    pub quota: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub window_reset_at: OffsetDateTime,
    pub state: HealthState,
}

/// Aggregate pool counters for the reporting collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_selections: u64,
    pub exhaustions: u64,
    pub leaked_reservations: u64,
    pub keys_total: usize,
    pub keys_active: usize,
    pub keys_degraded: usize,
    pub keys_cooldown: usize,
    pub keys_disabled: usize,
}

/// What one housekeeping pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub leaked_released: u32,
    pub windows_reset: u32,
}

/// Pool of credentials for external services: tracks usage against quotas,
/// quarantines unhealthy keys, and rotates fairly among the healthy ones.
pub struct KeyPool {
    registry: ProfileRegistry,
    store: Arc<dyn KeyStore>,
    entries: RwLock<HashMap<KeyId, Arc<KeyEntry>>>,
    audit: AuditSink,
    selections: AtomicU64,
    exhaustions: AtomicU64,
    leaks: AtomicU64,
}

impl KeyPool {
    /// Empty pool over the given registry and store.
    pub fn new(registry: ProfileRegistry, store: Arc<dyn KeyStore>) -> Self {
        Self {
            registry,
            store,
            entries: RwLock::new(HashMap::new()),
            audit: AuditSink::default(),
            selections: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
            leaks: AtomicU64::new(0),
        }
    }

    /// Pool populated from the persistence collaborator.
    pub fn open(registry: ProfileRegistry, store: Arc<dyn KeyStore>) -> Result<Self, PoolError> {
        let pool = Self::new(registry, store);
        let loaded = pool.reload()?;
        info!(loaded, "key pool opened");
        Ok(pool)
    }

    /// Ephemeral pool with default profiles, for tests and tooling.
    pub fn in_memory() -> Self {
        Self::new(
            ProfileRegistry::with_defaults(),
            Arc::new(MemoryKeyStore::new()),
        )
    }

    /// Pull keys from the store, adding any the pool does not hold yet.
    /// Returns how many entries were added.
    pub fn reload(&self) -> Result<usize, PoolError> {
        let keys = self.store.load_keys()?;
        let now_ms = now_unix_ms();
        let mut entries = self.lock_entries_write();
        let mut added = 0;
        for key in keys {
            if entries.contains_key(&key.id) {
                continue;
            }
            let profile = self.registry.profile_for(key.service);
            entries.insert(key.id, Arc::new(KeyEntry::new(key, &profile, now_ms)));
            added += 1;
        }
        Ok(added)
    }

    /// Validate, persist, and start tracking a new key.
    pub fn add_key(&self, new_key: NewKey) -> Result<ApiKeySummary, PoolError> {
        new_key.validate()?;
        let mut key = ApiKey::new(
            new_key.service,
            new_key.label.trim(),
            KeySecret::new(new_key.secret),
        );
        if let Some(weight) = new_key.priority_weight {
            key.priority_weight = weight.max(1);
        }
        self.store.save_key(&key)?;

        let profile = self.registry.profile_for(key.service);
        let entry = Arc::new(KeyEntry::new(key.clone(), &profile, now_unix_ms()));
        self.lock_entries_write().insert(key.id, Arc::clone(&entry));

        self.audit.record(
            AuditEvent::info(AuditKind::KeyAdded)
                .with_key(key.id)
                .with_service(key.service)
                .with_reason(key.label.clone()),
        );
        info!(key = %key.id, service = %key.service, "key added");
        Ok(self.summary_of(&entry, &profile))
    }

    /// Bulk add. Failures are collected per item; valid entries still land.
    pub fn import_keys(&self, imports: Vec<KeyImport>) -> ImportReport {
        let mut report = ImportReport::default();
        for import in imports {
            let label = import.label.clone();
            let new_key = NewKey::new(import.service, import.label, import.secret);
            match self.add_key(new_key) {
                Ok(_) => report.imported += 1,
                Err(err) => {
                    report.failed += 1;
                    report.errors.push(format!("'{label}': {err}"));
                }
            }
        }
        report
    }

    /// Exportable descriptions of all live keys. No secret material.
    pub fn export_keys(&self) -> Vec<KeyExport> {
        self.collect_entries(None)
            .into_iter()
            .filter_map(|entry| {
                let meta = entry.lock_meta();
                if meta.deleted {
                    return None;
                }
                Some(KeyExport {
                    service: meta.service,
                    label: meta.label.clone(),
                    created_at: meta.created_at,
                    state: entry.health.state(),
                    total_selections: entry.rotation.total_selections(),
                })
            })
            .collect()
    }

    /// Soft delete: the key stops being selectable but stays resolvable
    /// for audit history. The store decides its own removal policy.
    pub fn remove_key(&self, key_id: KeyId) -> Result<(), PoolError> {
        let entry = self.entry(key_id)?;
        let service = {
            let mut meta = entry.lock_meta();
            meta.deleted = true;
            meta.service
        };
        self.store.delete_key(key_id)?;
        self.audit.record(
            AuditEvent::info(AuditKind::KeyRemoved)
                .with_key(key_id)
                .with_service(service),
        );
        info!(key = %key_id, "key removed (soft)");
        Ok(())
    }

    /// Summaries for the GUI, optionally narrowed to one service.
    pub fn list_keys(&self, service: Option<ServiceKind>) -> Vec<ApiKeySummary> {
        self.collect_entries(service)
            .into_iter()
            .map(|entry| {
                let profile = {
                    let meta = entry.lock_meta();
                    self.registry.profile_for(meta.service)
                };
                self.summary_of(&entry, &profile)
            })
            .collect()
    }

    /// Pick the best available key for `service`, reserving one quota slot
    /// on it. Never blocks: exhaustion is reported immediately and the
    /// caller decides whether to queue, back off, or fail.
    pub fn select_key(&self, service: ServiceKind) -> Result<SelectedKey, PoolError> {
        let profile = self.registry.profile_for(service);
        let now_ms = now_unix_ms();

        let pool_entries = self.collect_live_entries(service);
        if pool_entries.is_empty() {
            return Err(PoolError::NoKeysConfigured { service });
        }

        struct Scored {
            entry: Arc<KeyEntry>,
            ticket: ReservationTicket,
            probe: bool,
            rank: CandidateRank,
        }

        let mut scored: Vec<Scored> = Vec::with_capacity(pool_entries.len());
        let mut disabled_only = true;
        let mut first_disabled: Option<KeyId> = None;

        for entry in pool_entries {
            let (tier, probe) = match entry.health.try_admit(now_ms) {
                Admission::Eligible { degraded: false } => (TIER_ACTIVE, false),
                Admission::Eligible { degraded: true } => (TIER_DEGRADED, false),
                Admission::Probe => (TIER_PROBE, true),
                Admission::Excluded { state } => {
                    if state == HealthState::Disabled {
                        if first_disabled.is_none() {
                            first_disabled = Some(entry.lock_meta().id);
                        }
                    } else {
                        disabled_only = false;
                    }
                    continue;
                }
            };
            disabled_only = false;

            // Reservation happens as part of filtering, so the eventual
            // pick is already admitted against quota.
            match entry.usage.reserve(&profile, now_ms) {
                ReserveOutcome::Reserved(ticket) => {
                    let weight = entry.lock_meta().priority_weight.max(1);
                    let rank = CandidateRank {
                        tier,
                        weighted_rate: entry.rotation.recent_rate(now_ms) / f64::from(weight),
                        remaining: entry.usage.remaining(&profile, now_ms),
                        last_selected_ms: entry.rotation.last_selected_ms(),
                    };
                    scored.push(Scored {
                        entry,
                        ticket,
                        probe,
                        rank,
                    });
                }
                ReserveOutcome::WouldExceed => {
                    if probe {
                        entry.health.abort_probe();
                    }
                }
            }
        }

        if scored.is_empty() {
            if disabled_only {
                if let Some(id) = first_disabled {
                    return Err(PoolError::KeyDisabled { id });
                }
            }
            self.exhaustions.fetch_add(1, Ordering::Relaxed);
            self.audit.record(
                AuditEvent::warning(AuditKind::Exhaustion)
                    .with_service(service)
                    .with_reason("every key rate-limited or unhealthy"),
            );
            debug!(service = %service, "selection exhausted");
            return Err(PoolError::AllKeysExhausted { service });
        }

        scored.sort_by(|a, b| a.rank.compare(&b.rank));
        let winner = scored.remove(0);
        for loser in scored {
            loser.entry.usage.release(loser.ticket);
            if loser.probe {
                loser.entry.health.abort_probe();
            }
        }

        winner.entry.rotation.mark_selected(now_ms);
        winner.entry.lock_pending().push_back(PendingSelection {
            ticket: winner.ticket,
            selected_at_ms: now_ms,
            probe: winner.probe,
        });
        self.selections.fetch_add(1, Ordering::Relaxed);

        let selected = {
            let meta = winner.entry.lock_meta();
            SelectedKey {
                id: meta.id,
                service,
                label: meta.label.clone(),
                secret: meta.secret.clone(),
                is_probe: winner.probe,
            }
        };
        self.audit.record(
            AuditEvent::info(AuditKind::Selection)
                .with_key(selected.id)
                .with_service(service)
                .with_state(winner.entry.health.state()),
        );
        debug!(key = %selected.id, service = %service, probe = selected.is_probe, "key selected");
        Ok(selected)
    }

    /// Report the outcome of the oldest in-flight selection on this key,
    /// settling its reservation and driving the health state machine.
    pub fn record_outcome(&self, key_id: KeyId, outcome: CallOutcome) -> Result<(), PoolError> {
        let entry = self.entry(key_id)?;
        let (service, profile) = {
            let meta = entry.lock_meta();
            (meta.service, self.registry.profile_for(meta.service))
        };

        match entry.lock_pending().pop_front() {
            Some(pending) => match Settlement::for_outcome(&outcome) {
                Settlement::Commit => {
                    entry.usage.commit(pending.ticket);
                }
                Settlement::Release => {
                    entry.usage.release(pending.ticket);
                }
            },
            None => {
                warn!(key = %key_id, "outcome recorded with no in-flight selection");
            }
        }

        let transition = match outcome {
            CallOutcome::Success { latency_ms } => {
                entry.health.record_success(&profile.health, Some(latency_ms))
            }
            CallOutcome::Failure { class, .. } => {
                entry
                    .health
                    .record_failure(&profile.health, class, now_unix_ms())
            }
        };
        if let Some(transition) = transition {
            self.audit_transition(key_id, service, &outcome, &transition);
        }
        Ok(())
    }

    /// Abandon the oldest in-flight selection on this key without a call
    /// (the surrounding request was cancelled before dispatch).
    pub fn release_selection(&self, key_id: KeyId) -> Result<(), PoolError> {
        let entry = self.entry(key_id)?;
        if let Some(pending) = entry.lock_pending().pop_front() {
            entry.usage.release(pending.ticket);
            if pending.probe {
                entry.health.abort_probe();
            }
            debug!(key = %key_id, "selection released before dispatch");
        }
        Ok(())
    }

    pub fn usage_status(&self, key_id: KeyId) -> Result<UsageStatus, PoolError> {
        let entry = self.entry(key_id)?;
        let profile = {
            let meta = entry.lock_meta();
            self.registry.profile_for(meta.service)
        };
        let now_ms = now_unix_ms();
        Ok(UsageStatus {
            remaining: entry.usage.remaining(&profile, now_ms),
            used: entry.usage.committed(),
            quota: profile.quota,
            window_reset_at: datetime_from_ms(entry.usage.window_reset_at_ms(&profile)),
            state: entry.health.state(),
        })
    }

    /// Administrative quarantine; the key never auto-recovers from it.
    pub fn force_disable(&self, key_id: KeyId, reason: impl Into<String>) -> Result<(), PoolError> {
        let entry = self.entry(key_id)?;
        let service = entry.lock_meta().service;
        if let Some(transition) = entry.health.force_disable() {
            let reason = reason.into();
            self.audit.record(
                AuditEvent::warning(AuditKind::AdminAction)
                    .with_key(key_id)
                    .with_service(service)
                    .with_state(transition.to)
                    .with_reason(reason.clone()),
            );
            info!(key = %key_id, reason, "key disabled by administrator");
        }
        Ok(())
    }

    pub fn re_enable(&self, key_id: KeyId) -> Result<(), PoolError> {
        let entry = self.entry(key_id)?;
        let (service, profile) = {
            let meta = entry.lock_meta();
            (meta.service, self.registry.profile_for(meta.service))
        };
        if let Some(transition) = entry.health.re_enable(&profile.health) {
            self.audit.record(
                AuditEvent::info(AuditKind::AdminAction)
                    .with_key(key_id)
                    .with_service(service)
                    .with_state(transition.to)
                    .with_reason("re-enabled by administrator"),
            );
            info!(key = %key_id, "key re-enabled");
        }
        Ok(())
    }

    /// Replace one service's profile at runtime.
    pub fn configure_service(&self, profile: ServiceProfile) {
        let service = profile.service;
        self.registry.configure(profile);
        self.audit.record(
            AuditEvent::info(AuditKind::ConfigChange)
                .with_service(service)
                .with_reason("service profile reconfigured"),
        );
        info!(service = %service, "service profile reconfigured");
    }

    pub fn audit_events(&self, filter: &AuditFilter, limit: usize) -> Vec<AuditEvent> {
        self.audit.events(filter, limit)
    }

    pub fn audit_stats(&self) -> AuditStats {
        self.audit.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        let entries = self.collect_entries(None);
        let mut stats = PoolStats {
            total_selections: self.selections.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
            leaked_reservations: self.leaks.load(Ordering::Relaxed),
            keys_total: 0,
            keys_active: 0,
            keys_degraded: 0,
            keys_cooldown: 0,
            keys_disabled: 0,
        };
        for entry in entries {
            if entry.lock_meta().deleted {
                continue;
            }
            stats.keys_total += 1;
            match entry.health.state() {
                HealthState::Active => stats.keys_active += 1,
                HealthState::Degraded => stats.keys_degraded += 1,
                HealthState::Cooldown => stats.keys_cooldown += 1,
                HealthState::Disabled => stats.keys_disabled += 1,
            }
        }
        stats
    }

    /// One housekeeping pass: force-release leaked reservations and run
    /// proactive window resets. Lazy checks inside `reserve` keep the pool
    /// correct without this; the sweep exists for hygiene and audit
    /// visibility.
    pub fn sweep_once(&self) -> SweepReport {
        let now_ms = now_unix_ms();
        let mut report = SweepReport::default();

        for entry in self.collect_entries(None) {
            let (key_id, service, deleted) = {
                let meta = entry.lock_meta();
                (meta.id, meta.service, meta.deleted)
            };
            if deleted {
                continue;
            }
            let profile = self.registry.profile_for(service);

            let grace_ms = profile.reservation_grace.as_millis() as u64;
            let cutoff = now_ms.saturating_sub(grace_ms);
            let leaked = entry.usage.take_leaked(cutoff);
            if !leaked.is_empty() {
                let mut pending = entry.lock_pending();
                for ticket in &leaked {
                    if let Some(pos) = pending.iter().position(|p| p.ticket == *ticket) {
                        let stale = pending.remove(pos).expect("position is in bounds");
                        if stale.probe {
                            entry.health.abort_probe();
                        }
                    }
                }
                drop(pending);

                let count = leaked.len() as u32;
                report.leaked_released += count;
                self.leaks.fetch_add(u64::from(count), Ordering::Relaxed);
                self.audit.record(
                    AuditEvent::warning(AuditKind::ReservationLeak)
                        .with_key(key_id)
                        .with_service(service)
                        .with_reason(format!("force-released {count} leaked reservation(s)")),
                );
                warn!(key = %key_id, count, "leaked reservations force-released");
            }

            if entry.usage.reset_if_due(&profile, now_ms) {
                report.windows_reset += 1;
                self.audit.record(
                    AuditEvent::info(AuditKind::WindowReset)
                        .with_key(key_id)
                        .with_service(service),
                );
            }
        }
        report
    }

    fn audit_transition(
        &self,
        key_id: KeyId,
        service: ServiceKind,
        outcome: &CallOutcome,
        transition: &HealthTransition,
    ) {
        let severity = match (transition.to, outcome) {
            // Auth/config failures need an operator; retries cannot help.
            (
                HealthState::Cooldown,
                CallOutcome::Failure {
                    class: ErrorClass::AuthFailed | ErrorClass::Fatal,
                    ..
                },
            ) => AuditSeverity::Critical,
            (HealthState::Cooldown | HealthState::Degraded, _) => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        };
        self.audit.record(
            AuditEvent::new(AuditKind::HealthTransition, severity)
                .with_key(key_id)
                .with_service(service)
                .with_state(transition.to)
                .with_reason(transition.reason.clone()),
        );
    }

    fn summary_of(&self, entry: &KeyEntry, profile: &ServiceProfile) -> ApiKeySummary {
        let now_ms = now_unix_ms();
        let health = entry.health.snapshot();
        let meta = entry.lock_meta();
        ApiKeySummary {
            id: meta.id,
            service: meta.service,
            label: meta.label.clone(),
            state: health.state,
            remaining: entry.usage.remaining(profile, now_ms),
            quota: profile.quota,
            total_successes: health.total_successes,
            total_failures: health.total_failures,
            avg_latency_ms: health.avg_latency_ms,
            total_selections: entry.rotation.total_selections(),
            last_selected_at: entry.rotation.last_selected_ms().map(datetime_from_ms),
            deleted: meta.deleted,
        }
    }

    fn entry(&self, key_id: KeyId) -> Result<Arc<KeyEntry>, PoolError> {
        self.lock_entries_read()
            .get(&key_id)
            .cloned()
            .ok_or(PoolError::KeyNotFound { id: key_id })
    }

    fn collect_entries(&self, service: Option<ServiceKind>) -> Vec<Arc<KeyEntry>> {
        self.lock_entries_read()
            .values()
            .filter(|entry| service.is_none_or(|s| entry.lock_meta().service == s))
            .cloned()
            .collect()
    }

    fn collect_live_entries(&self, service: ServiceKind) -> Vec<Arc<KeyEntry>> {
        self.lock_entries_read()
            .values()
            .filter(|entry| {
                let meta = entry.lock_meta();
                meta.service == service && !meta.deleted
            })
            .cloned()
            .collect()
    }

    fn lock_entries_read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<KeyId, Arc<KeyEntry>>> {
        self.entries
            .read()
            .expect("key registry lock is not poisoned")
    }

    fn lock_entries_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<KeyId, Arc<KeyEntry>>> {
        self.entries
            .write()
            .expect("key registry lock is not poisoned")
    }
}

fn datetime_from_ms(ms: u64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .expect("unix millisecond timestamp is in range")
}
