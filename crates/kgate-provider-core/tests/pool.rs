mod support;

use std::collections::HashSet;
use std::time::Duration;

use kgate_provider_core::{
    CredentialPool, CredentialState, Event, EventHub, Outcome, PoolExhausted, PoolPolicy,
    UnavailableReason,
};
use support::{ScriptedExchange, manager};
use tokio::time::timeout;

async fn pool_of(ids: &[i64], policy: PoolPolicy) -> CredentialPool {
    let pool = CredentialPool::new(EventHub::new(64), policy);
    let exchange = ScriptedExchange::new(Vec::new());
    for id in ids {
        pool.insert(manager(*id, exchange.clone())).await;
    }
    pool
}

#[tokio::test]
async fn rotation_visits_every_credential_once_per_cycle() {
    for size in 1..=5i64 {
        let ids: Vec<i64> = (1..=size).collect();
        let pool = pool_of(&ids, PoolPolicy::default()).await;

        let mut seen = Vec::new();
        for _ in 0..size {
            let handle = pool.acquire(None).await.unwrap();
            seen.push(handle.id());
            pool.report(handle, Outcome::Success).await;
        }
        let unique: HashSet<i64> = seen.iter().copied().collect();
        assert_eq!(unique.len(), size as usize);

        let next = pool.acquire(None).await.unwrap();
        assert_eq!(next.id(), seen[0]);
    }
}

#[tokio::test]
async fn sticky_binding_wins_while_usable() {
    let pool = pool_of(&[1, 2, 3], PoolPolicy::default()).await;

    for _ in 0..3 {
        let handle = pool.acquire(Some(2)).await.unwrap();
        assert_eq!(handle.id(), 2);
        assert!(handle.is_sticky());
    }

    pool.mark_unavailable(2, Duration::from_secs(60), UnavailableReason::Manual)
        .await;
    let handle = pool.acquire(Some(2)).await.unwrap();
    assert_ne!(handle.id(), 2);
    assert!(!handle.is_sticky());

    // Unknown sticky ids fall back to rotation.
    assert!(pool.acquire(Some(99)).await.is_ok());
}

#[tokio::test]
async fn auth_failure_removes_credential_from_rotation() {
    let pool = pool_of(&[1, 2, 3], PoolPolicy::default()).await;

    let mut first = pool.acquire(None).await.unwrap();
    assert_eq!(first.id(), 1);
    let session = first.token().await.unwrap();
    pool.report(first, Outcome::AuthFailure).await;

    assert!(matches!(
        pool.state(1).await,
        Some(CredentialState::Unavailable {
            reason: UnavailableReason::AuthInvalid,
            ..
        })
    ));
    // The stale session is dropped so recovery re-validates.
    let manager = pool.manager(1).await.unwrap();
    assert!(
        manager
            .cached_session()
            .is_none_or(|current| current.access_token != session.access_token)
    );

    for _ in 0..6 {
        let handle = pool.acquire(None).await.unwrap();
        assert_ne!(handle.id(), 1);
        pool.report(handle, Outcome::Success).await;
    }
    assert_eq!(pool.active_count().await, 2);
}

#[tokio::test]
async fn pool_reports_exhaustion_when_every_credential_fails() {
    let pool = pool_of(&[1, 2, 3], PoolPolicy::default()).await;

    for _ in 0..3 {
        let handle = pool.acquire(None).await.unwrap();
        pool.report(handle, Outcome::AuthFailure).await;
    }
    let err = pool.acquire(None).await.unwrap_err();
    assert_eq!(err, PoolExhausted { total: 3 });
    assert_eq!(err.code(), "pool_exhausted");
}

#[tokio::test]
async fn release_does_not_count_against_health() {
    let pool = pool_of(&[1], PoolPolicy::default()).await;

    let handle = pool.acquire(None).await.unwrap();
    assert_eq!(pool.snapshot().await[0].in_flight, 1);
    pool.report(handle, Outcome::Released).await;

    assert_eq!(pool.state(1).await, Some(CredentialState::Active));
    let views = pool.snapshot().await;
    let view = &views[0];
    assert_eq!(view.in_flight, 0);
    assert_eq!(view.use_count, 1);
    assert_eq!(view.state, "active");
}

#[tokio::test]
async fn dropping_a_handle_releases_it() {
    let pool = pool_of(&[1], PoolPolicy::default()).await;
    {
        let _handle = pool.acquire(None).await.unwrap();
        assert_eq!(pool.snapshot().await[0].in_flight, 1);
    }
    assert_eq!(pool.snapshot().await[0].in_flight, 0);
}

#[tokio::test]
async fn repeated_transient_errors_trip_a_cooldown() {
    let policy = PoolPolicy {
        transient_threshold: 2,
        ..PoolPolicy::default()
    };
    let pool = pool_of(&[1], policy).await;

    let handle = pool.acquire(None).await.unwrap();
    pool.report(handle, Outcome::Transient).await;
    assert_eq!(pool.state(1).await, Some(CredentialState::Active));

    let handle = pool.acquire(None).await.unwrap();
    pool.report(handle, Outcome::Transient).await;
    assert!(matches!(
        pool.state(1).await,
        Some(CredentialState::Unavailable {
            reason: UnavailableReason::Transient,
            ..
        })
    ));
}

#[tokio::test]
async fn revoked_credentials_stay_disabled() {
    let pool = pool_of(&[1, 2], PoolPolicy::default()).await;
    let mut rx = pool.events().subscribe();

    let handle = pool.acquire(Some(1)).await.unwrap();
    pool.report(handle, Outcome::Revoked("invalid_grant".to_string()))
        .await;

    let event = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, Event::CredentialDisabled(ref ev) if ev.credential_id == 1));
    pool.mark_unavailable(1, Duration::from_millis(1), UnavailableReason::Manual)
        .await;
    assert!(matches!(
        pool.state(1).await,
        Some(CredentialState::Disabled { .. })
    ));
    assert_eq!(pool.acquire(Some(1)).await.unwrap().id(), 2);
}

#[tokio::test]
async fn cooldown_recovers_via_queue() {
    let policy = PoolPolicy {
        quota_cooldown: Duration::from_millis(50),
        ..PoolPolicy::default()
    };
    let pool = pool_of(&[1], policy).await;
    let mut rx = pool.events().subscribe();

    let handle = pool.acquire(None).await.unwrap();
    pool.report(handle, Outcome::QuotaExceeded { retry_after: None })
        .await;
    let ev = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(ev, Event::UnavailableStart(_)));
    assert!(pool.acquire(None).await.is_err());

    let ev = timeout(Duration::from_millis(500), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(ev, Event::UnavailableEnd(_)));
    assert_eq!(pool.state(1).await, Some(CredentialState::Active));
}

#[tokio::test]
async fn stale_queue_entry_does_not_recover_early() {
    let pool = pool_of(&[1], PoolPolicy::default()).await;

    pool.mark_unavailable(1, Duration::from_millis(80), UnavailableReason::Transient)
        .await;
    pool.mark_unavailable(1, Duration::from_millis(200), UnavailableReason::Transient)
        .await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(matches!(
        pool.state(1).await,
        Some(CredentialState::Unavailable { .. })
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.state(1).await, Some(CredentialState::Active));
}
