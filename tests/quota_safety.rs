use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use keypool_core::{
    CallOutcome, KeyPool, NewKey, PoolError, ReserveOutcome, ResetPolicy, ServiceKind,
    ServiceProfile, UsageWindow,
};
use keypool_tests::init_test_logging;

fn rolling_profile(quota: u32, window: Duration) -> ServiceProfile {
    ServiceProfile::generic(ServiceKind::Jina)
        .with_quota(quota, window)
        .with_reserve_buffer(0.0)
        .with_reset_policy(ResetPolicy::Rolling)
}

fn pool_with_one_key(profile: ServiceProfile) -> (KeyPool, keypool_core::KeyId) {
    let pool = KeyPool::in_memory();
    pool.configure_service(profile);
    let summary = pool
        .add_key(NewKey::new(ServiceKind::Jina, "primary", "sk-quota"))
        .expect("key adds");
    (pool, summary.id)
}

#[test]
fn quota_two_exhausts_then_recovers_after_window() {
    init_test_logging();
    let window = Duration::from_millis(150);
    let (pool, key_id) = pool_with_one_key(rolling_profile(2, window));

    for _ in 0..2 {
        let selected = pool.select_key(ServiceKind::Jina).expect("slot available");
        assert_eq!(selected.id, key_id);
        pool.record_outcome(key_id, CallOutcome::success(10))
            .expect("outcome records");
    }

    assert!(matches!(
        pool.select_key(ServiceKind::Jina),
        Err(PoolError::AllKeysExhausted {
            service: ServiceKind::Jina
        })
    ));

    std::thread::sleep(window + Duration::from_millis(50));

    let status = pool.usage_status(key_id).expect("status resolves");
    assert_eq!(status.remaining, 2);
    assert!(pool.select_key(ServiceKind::Jina).is_ok());
}

#[test]
fn single_slot_admits_exactly_one_of_many_concurrent_callers() {
    init_test_logging();
    let (pool, _key_id) = pool_with_one_key(rolling_profile(1, Duration::from_secs(60)));

    let admitted = AtomicU32::new(0);
    let exhausted = AtomicU32::new(0);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| match pool.select_key(ServiceKind::Jina) {
                Ok(_) => {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
                Err(PoolError::AllKeysExhausted { .. }) => {
                    exhausted.fetch_add(1, Ordering::SeqCst);
                }
                Err(other) => panic!("unexpected error: {other}"),
            });
        }
    });

    assert_eq!(admitted.load(Ordering::SeqCst), 1);
    assert_eq!(exhausted.load(Ordering::SeqCst), 7);
}

#[test]
fn commits_stop_at_the_buffered_quota() {
    init_test_logging();
    let profile = ServiceProfile::generic(ServiceKind::Jina)
        .with_quota(100, Duration::from_secs(600))
        .with_reserve_buffer(0.10)
        .with_reset_policy(ResetPolicy::Rolling);
    let (pool, key_id) = pool_with_one_key(profile);

    let mut committed = 0u32;
    loop {
        match pool.select_key(ServiceKind::Jina) {
            Ok(_) => {
                pool.record_outcome(key_id, CallOutcome::success(1))
                    .expect("outcome records");
                committed += 1;
            }
            Err(PoolError::AllKeysExhausted { .. }) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(committed <= 100, "committed past the hard quota");
    }

    // quota x (1 - buffer): the pool stops 10 calls short of the limit.
    assert_eq!(committed, 90);
}

#[test]
fn concurrent_window_resets_collapse_to_one() {
    let profile = rolling_profile(3, Duration::from_millis(1_000));
    let window = UsageWindow::new(&profile, 0);

    let ReserveOutcome::Reserved(ticket) = window.reserve(&profile, 1) else {
        panic!("reservation must be admitted");
    };
    assert!(window.commit(ticket));
    assert_eq!(window.committed(), 1);

    let resets = AtomicU32::new(0);
    std::thread::scope(|scope| {
        for _ in 0..100 {
            scope.spawn(|| {
                if window.reset_if_due(&profile, 2_000) {
                    resets.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert_eq!(window.committed(), 0);
    assert_eq!(window.remaining(&profile, 2_000), 3);
}

#[test]
fn failed_local_attempts_do_not_consume_quota() {
    init_test_logging();
    let (pool, key_id) = pool_with_one_key(rolling_profile(2, Duration::from_secs(60)));

    pool.select_key(ServiceKind::Jina).expect("slot available");
    // The request never left the process, so the slot comes back.
    pool.record_outcome(key_id, CallOutcome::transient(false))
        .expect("outcome records");

    let status = pool.usage_status(key_id).expect("status resolves");
    assert_eq!(status.used, 0);
    assert_eq!(status.remaining, 2);

    pool.select_key(ServiceKind::Jina).expect("slot available");
    // The provider rejected the call after receiving it; quota is spent.
    pool.record_outcome(key_id, CallOutcome::transient(true))
        .expect("outcome records");

    let status = pool.usage_status(key_id).expect("status resolves");
    assert_eq!(status.used, 1);
    assert_eq!(status.remaining, 1);
}
