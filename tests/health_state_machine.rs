use std::time::Duration;

use keypool_core::{
    AuditFilter, AuditKind, AuditSeverity, CallOutcome, HealthState, HealthThresholds, KeyId,
    KeyPool, NewKey, PoolError, ResetPolicy, ServiceKind, ServiceProfile,
};
use keypool_tests::init_test_logging;

const BASE_COOLDOWN: Duration = Duration::from_millis(300);

fn fast_cooldown_profile() -> ServiceProfile {
    ServiceProfile::generic(ServiceKind::SerpApi)
        .with_quota(1_000, Duration::from_secs(600))
        .with_reserve_buffer(0.0)
        .with_reset_policy(ResetPolicy::Rolling)
        .with_health(HealthThresholds {
            degrade_after: 3,
            cooldown_after: 5,
            promote_after: 2,
            base_cooldown: BASE_COOLDOWN,
            cooldown_multiplier: 3.0,
            max_cooldown: Duration::from_secs(2),
        })
}

fn pool_with_one_key() -> (KeyPool, KeyId) {
    let pool = KeyPool::in_memory();
    pool.configure_service(fast_cooldown_profile());
    let summary = pool
        .add_key(NewKey::new(ServiceKind::SerpApi, "primary", "sk-health"))
        .expect("key adds");
    (pool, summary.id)
}

fn state_of(pool: &KeyPool, key_id: KeyId) -> HealthState {
    pool.usage_status(key_id).expect("status resolves").state
}

fn fail_once(pool: &KeyPool, key_id: KeyId) {
    pool.select_key(ServiceKind::SerpApi).expect("slot available");
    pool.record_outcome(key_id, CallOutcome::transient(true))
        .expect("outcome records");
}

#[test]
fn exact_failure_threshold_reaches_cooldown() {
    init_test_logging();
    let (pool, key_id) = pool_with_one_key();

    for _ in 0..4 {
        fail_once(&pool, key_id);
    }
    assert_eq!(state_of(&pool, key_id), HealthState::Degraded);

    fail_once(&pool, key_id);
    assert_eq!(state_of(&pool, key_id), HealthState::Cooldown);

    // Before expiry the key is excluded from selection.
    assert!(matches!(
        pool.select_key(ServiceKind::SerpApi),
        Err(PoolError::AllKeysExhausted { .. })
    ));
}

#[test]
fn probe_after_expiry_restores_the_key() {
    init_test_logging();
    let (pool, key_id) = pool_with_one_key();
    for _ in 0..5 {
        fail_once(&pool, key_id);
    }
    assert_eq!(state_of(&pool, key_id), HealthState::Cooldown);

    std::thread::sleep(BASE_COOLDOWN + Duration::from_millis(50));

    let probe = pool.select_key(ServiceKind::SerpApi).expect("probe admitted");
    assert!(probe.is_probe);
    pool.record_outcome(key_id, CallOutcome::success(25))
        .expect("outcome records");

    assert_eq!(state_of(&pool, key_id), HealthState::Active);
    let selected = pool.select_key(ServiceKind::SerpApi).expect("key restored");
    assert!(!selected.is_probe);
}

#[test]
fn only_one_probe_passes_while_in_flight() {
    init_test_logging();
    let (pool, key_id) = pool_with_one_key();
    for _ in 0..5 {
        fail_once(&pool, key_id);
    }
    std::thread::sleep(BASE_COOLDOWN + Duration::from_millis(50));

    let probe = pool.select_key(ServiceKind::SerpApi).expect("probe admitted");
    assert!(probe.is_probe);
    // The half-open slot is taken until the probe outcome lands.
    assert!(matches!(
        pool.select_key(ServiceKind::SerpApi),
        Err(PoolError::AllKeysExhausted { .. })
    ));
}

#[test]
fn rate_limit_forces_cooldown_despite_success_streak() {
    init_test_logging();
    let (pool, key_id) = pool_with_one_key();

    for _ in 0..3 {
        pool.select_key(ServiceKind::SerpApi).expect("slot available");
        pool.record_outcome(key_id, CallOutcome::success(15))
            .expect("outcome records");
    }
    assert_eq!(state_of(&pool, key_id), HealthState::Active);

    pool.select_key(ServiceKind::SerpApi).expect("slot available");
    pool.record_outcome(key_id, CallOutcome::rate_limited())
        .expect("outcome records");

    assert_eq!(state_of(&pool, key_id), HealthState::Cooldown);
}

#[test]
fn failed_probe_extends_the_cooldown() {
    init_test_logging();
    let (pool, key_id) = pool_with_one_key();
    for _ in 0..5 {
        fail_once(&pool, key_id);
    }
    std::thread::sleep(BASE_COOLDOWN + Duration::from_millis(50));

    let probe = pool.select_key(ServiceKind::SerpApi).expect("probe admitted");
    assert!(probe.is_probe);
    pool.record_outcome(key_id, CallOutcome::transient(true))
        .expect("outcome records");

    // Quarantined again immediately after the failed probe.
    assert_eq!(state_of(&pool, key_id), HealthState::Cooldown);
    assert!(matches!(
        pool.select_key(ServiceKind::SerpApi),
        Err(PoolError::AllKeysExhausted { .. })
    ));

    // The extended cooldown (3x base) outlives the base one.
    std::thread::sleep(BASE_COOLDOWN + Duration::from_millis(50));
    assert!(matches!(
        pool.select_key(ServiceKind::SerpApi),
        Err(PoolError::AllKeysExhausted { .. })
    ));

    std::thread::sleep(BASE_COOLDOWN * 3);
    let retry = pool.select_key(ServiceKind::SerpApi).expect("probe admitted");
    assert!(retry.is_probe);
}

#[test]
fn auth_failure_escalates_immediately_and_flags_operators() {
    init_test_logging();
    let (pool, key_id) = pool_with_one_key();

    pool.select_key(ServiceKind::SerpApi).expect("slot available");
    pool.record_outcome(key_id, CallOutcome::auth_failed())
        .expect("outcome records");

    assert_eq!(state_of(&pool, key_id), HealthState::Cooldown);

    let filter = AuditFilter {
        kind: Some(AuditKind::HealthTransition),
        severity: Some(AuditSeverity::Critical),
        ..AuditFilter::default()
    };
    let flagged = pool.audit_events(&filter, 10);
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].key_id, Some(key_id));
}

#[test]
fn degraded_key_remains_selectable() {
    init_test_logging();
    let (pool, key_id) = pool_with_one_key();

    for _ in 0..3 {
        fail_once(&pool, key_id);
    }
    assert_eq!(state_of(&pool, key_id), HealthState::Degraded);

    let selected = pool.select_key(ServiceKind::SerpApi).expect("still selectable");
    assert_eq!(selected.id, key_id);

    // Two consecutive successes promote it back.
    pool.record_outcome(key_id, CallOutcome::success(20))
        .expect("outcome records");
    pool.select_key(ServiceKind::SerpApi).expect("slot available");
    pool.record_outcome(key_id, CallOutcome::success(20))
        .expect("outcome records");
    assert_eq!(state_of(&pool, key_id), HealthState::Active);
}
