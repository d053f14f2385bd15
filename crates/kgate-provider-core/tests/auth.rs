mod support;

use std::sync::Arc;
use std::time::Duration;

use kgate_provider_core::{
    AuthError, AuthManager, Event, EventHub, ExchangeError, TokenGrant,
};
use support::{ScriptedExchange, credential, fast_policy, grant, manager};
use time::OffsetDateTime;
use tokio::time::timeout;

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let exchange = ScriptedExchange::slow(Duration::from_millis(50));
    let auth = manager(1, exchange.clone());

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let auth = auth.clone();
        tasks.push(tokio::spawn(async move { auth.token().await }));
    }
    let mut tokens = Vec::new();
    for task in tasks {
        tokens.push(task.await.unwrap().unwrap().access_token.clone());
    }

    assert_eq!(exchange.calls(), 1);
    assert!(tokens.iter().all(|token| token == "token-1"));
}

#[tokio::test]
async fn valid_cached_token_needs_no_exchange() {
    let exchange = ScriptedExchange::new(Vec::new());
    let mut seeded = credential(7);
    seeded.access_token = Some("cached".to_string());
    seeded.expires_at = Some(OffsetDateTime::now_utc().unix_timestamp() + 3600);
    let auth = AuthManager::new(seeded, exchange.clone(), fast_policy(), "us-east-1");

    assert_eq!(auth.token().await.unwrap().access_token, "cached");
    assert_eq!(exchange.calls(), 0);
}

#[tokio::test]
async fn token_inside_safety_margin_is_refreshed() {
    let exchange = ScriptedExchange::new(Vec::new());
    let mut seeded = credential(7);
    seeded.access_token = Some("stale".to_string());
    seeded.expires_at = Some(OffsetDateTime::now_utc().unix_timestamp() + 30);
    let auth = AuthManager::new(seeded, exchange.clone(), fast_policy(), "us-east-1");

    assert_eq!(auth.token().await.unwrap().access_token, "token-1");
    assert_eq!(exchange.calls(), 1);
}

#[tokio::test]
async fn network_failures_are_retried_with_backoff() {
    let exchange = ScriptedExchange::new(vec![
        Err(ExchangeError::Transport("connection reset".to_string())),
        Err(ExchangeError::Rejected {
            status: 503,
            message: "busy".to_string(),
        }),
        Ok(grant("third-time")),
    ]);
    let auth = manager(2, exchange.clone());

    assert_eq!(auth.token().await.unwrap().access_token, "third-time");
    assert_eq!(exchange.calls(), 3);
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let exchange = ScriptedExchange::new(vec![
        Err(ExchangeError::Transport("down".to_string())),
        Err(ExchangeError::Transport("down".to_string())),
        Err(ExchangeError::Transport("down".to_string())),
        Ok(grant("never")),
    ]);
    let auth = manager(3, exchange.clone());

    let err = auth.token().await.unwrap_err();
    assert!(matches!(err, AuthError::RefreshFailed { credential_id: 3, .. }));
    assert!(!err.is_terminal());
    assert_eq!(exchange.calls(), 3);
    assert!(!auth.is_disabled());
}

#[tokio::test]
async fn invalid_grant_disables_the_credential() {
    let exchange = ScriptedExchange::new(vec![Err(ExchangeError::from_status(
        400,
        r#"{"error":"invalid_grant"}"#,
    ))]);
    let auth = manager(4, exchange.clone());

    let err = auth.token().await.unwrap_err();
    assert!(matches!(err, AuthError::Disabled { credential_id: 4, .. }));
    assert_eq!(err.code(), "auth_error");
    assert!(auth.is_disabled());

    // No further I/O once disabled.
    assert!(auth.token().await.is_err());
    assert_eq!(exchange.calls(), 1);
}

#[tokio::test]
async fn rotated_refresh_token_is_kept_and_announced() {
    let exchange = ScriptedExchange::new(vec![Ok(TokenGrant {
        access_token: "a1".to_string(),
        refresh_token: Some("refresh-rotated".to_string()),
        expires_in: 900,
        profile_arn: Some("arn:aws:codewhisperer:us-east-1:1:profile/P".to_string()),
    })]);
    let hub = EventHub::new(8);
    let mut rx = hub.subscribe();
    let auth = AuthManager::new(credential(5), exchange, fast_policy(), "us-east-1")
        .with_events(hub);

    let session = auth.token().await.unwrap();
    assert_eq!(session.profile_arn.as_deref(), Some("arn:aws:codewhisperer:us-east-1:1:profile/P"));
    let stored = auth.credential();
    assert_eq!(stored.auth.refresh_token(), "refresh-rotated");
    assert_eq!(stored.access_token.as_deref(), Some("a1"));

    let event = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        Event::TokenRefreshed(ev) => {
            assert_eq!(ev.credential_id, 5);
            assert!(ev.rotated);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn invalidate_only_drops_the_stale_session() {
    let exchange = ScriptedExchange::new(Vec::new());
    let auth: Arc<AuthManager> = manager(6, exchange.clone());

    let first = auth.token().await.unwrap();
    auth.invalidate("some-other-token");
    assert_eq!(auth.token().await.unwrap().access_token, first.access_token);
    assert_eq!(exchange.calls(), 1);

    auth.invalidate(&first.access_token);
    assert_eq!(auth.token().await.unwrap().access_token, "token-2");
    assert_eq!(exchange.calls(), 2);
}
