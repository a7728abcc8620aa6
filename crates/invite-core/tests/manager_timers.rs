//! Timer-driven behaviour of sessions hosted by the SessionManager
//!
//! These tests run on a paused tokio clock, so the retransmission, glare
//! backoff and session refresh timers elapse in virtual time.

use std::time::Duration;

use rvoip_invite_core::prelude::*;
use rvoip_invite_core::{GlareBackoffConfig, RefresherRole};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> SessionConfig {
    SessionConfig::default().with_glare_backoff(GlareBackoffConfig::fixed(Duration::from_millis(250)))
}

async fn next(rx: &mut UnboundedReceiver<SessionOutput>) -> SessionAction {
    rx.recv().await.expect("manager output").action
}

/// Wait for the next request, skipping responses and notifications
async fn next_request(rx: &mut UnboundedReceiver<SessionOutput>) -> rvoip_invite_core::OutboundRequest {
    loop {
        if let SessionAction::SendRequest(request) = next(rx).await {
            return request;
        }
    }
}

fn drain(rx: &mut UnboundedReceiver<SessionOutput>) {
    while rx.try_recv().is_ok() {}
}

/// Caller session connected with "alice-1"/"bob-1"
async fn connected_client(
    manager: &SessionManager,
    rx: &mut UnboundedReceiver<SessionOutput>,
    session_expires: Option<SessionExpires>,
) -> SessionId {
    let id = manager
        .create_client_session(DialogContext::new().with_update(), Some(Sdp::from("alice-1")))
        .await
        .unwrap();
    let mut ok = InboundMessage::response(Method::Invite, 200, Body::Answer(Sdp::from("bob-1")));
    if let Some(se) = session_expires {
        ok = ok.with_session_expires(se);
    }
    manager.dispatch(id, ok).await.unwrap();
    assert_eq!(manager.state(id).await.unwrap(), InviteState::Connected);
    drain(rx);
    id
}

#[tokio::test(start_paused = true)]
async fn test_missing_ack_terminates_then_session_is_reaped() {
    init_tracing();
    let (manager, mut rx) = SessionManager::new(config()).unwrap();
    let id = manager.create_server_session(DialogContext::new()).await;
    manager
        .dispatch(id, InboundMessage::request(Method::Invite, Body::Offer(Sdp::from("alice-1"))))
        .await
        .unwrap();
    manager.provide_answer(id, Sdp::from("bob-1")).await.unwrap();
    manager.accept(id).await.unwrap();
    drain(&mut rx);

    let started = Instant::now();
    let mut retransmissions = 0;
    let reason = loop {
        match next(&mut rx).await {
            SessionAction::SendResponse(response) => {
                assert_eq!(response.status, StatusCode::OK);
                retransmissions += 1;
            }
            SessionAction::Notify(SessionNotification::Terminated { reason }) => break reason,
            _ => {}
        }
    };

    assert_eq!(reason, TerminationReason::AckTimeout);
    assert_eq!(retransmissions, 10);
    // 0.5 + 1 + 2 + 4 * 8 seconds
    assert!(started.elapsed() >= Duration::from_millis(35_500));
    assert!(manager.contains(id));
    assert!(manager.armed_timers(id).is_empty());

    tokio::time::sleep(manager.config().terminated_linger()).await;
    tokio::task::yield_now().await;
    assert!(!manager.contains(id));
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ack_stops_retransmission() {
    init_tracing();
    let (manager, mut rx) = SessionManager::new(config()).unwrap();
    let id = manager.create_server_session(DialogContext::new()).await;
    manager
        .dispatch(id, InboundMessage::request(Method::Invite, Body::Offer(Sdp::from("alice-1"))))
        .await
        .unwrap();
    manager.provide_answer(id, Sdp::from("bob-1")).await.unwrap();
    manager.accept(id).await.unwrap();

    // first retransmission after T1
    tokio::time::sleep(Duration::from_millis(600)).await;
    manager.dispatch(id, InboundMessage::ack(Body::None)).await.unwrap();
    assert_eq!(manager.state(id).await.unwrap(), InviteState::Connected);
    assert!(manager.armed_timers(id).is_empty());
    drain(&mut rx);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(manager.local_sdp(id).await.unwrap(), Some(Sdp::from("bob-1")));
}

#[tokio::test(start_paused = true)]
async fn test_glare_retry_waits_for_backoff() {
    init_tracing();
    let (manager, mut rx) = SessionManager::new(config()).unwrap();
    let id = connected_client(&manager, &mut rx, None).await;

    manager.provide_offer(id, Sdp::from("alice-2")).await.unwrap();
    assert_eq!(next_request(&mut rx).await.method, Method::Invite);

    manager
        .dispatch(id, InboundMessage::response(Method::Invite, 491, Body::None))
        .await
        .unwrap();
    assert_eq!(manager.state(id).await.unwrap(), InviteState::SentReinviteGlare);
    assert_eq!(manager.local_sdp(id).await.unwrap(), Some(Sdp::from("alice-1")));

    let started = Instant::now();
    let retry = next_request(&mut rx).await;
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(retry.method, Method::Invite);
    assert_eq!(retry.body, Body::Offer(Sdp::from("alice-2")));
    assert_eq!(manager.state(id).await.unwrap(), InviteState::SentReinvite);

    manager
        .dispatch(id, InboundMessage::response(Method::Invite, 200, Body::Answer(Sdp::from("bob-2"))))
        .await
        .unwrap();
    assert_eq!(manager.local_sdp(id).await.unwrap(), Some(Sdp::from("alice-2")));
    assert_eq!(manager.remote_sdp(id).await.unwrap(), Some(Sdp::from("bob-2")));
}

#[tokio::test(start_paused = true)]
async fn test_session_refresh_sent_at_half_interval() {
    init_tracing();
    let (manager, mut rx) = SessionManager::new(config()).unwrap();
    let se = SessionExpires::new(120).with_refresher(RefresherRole::Uac);
    let started = Instant::now();
    let id = connected_client(&manager, &mut rx, Some(se)).await;

    let refresh = next_request(&mut rx).await;
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(refresh.method, Method::Update);
    assert_eq!(refresh.body, Body::Offer(Sdp::from("alice-1")));
    assert_eq!(refresh.session_expires, Some(se));

    manager
        .dispatch(
            id,
            InboundMessage::response(Method::Update, 200, Body::Answer(Sdp::from("bob-1")))
                .with_session_expires(se),
        )
        .await
        .unwrap();
    assert_eq!(manager.state(id).await.unwrap(), InviteState::Connected);

    // and again one half-interval later
    let second = next_request(&mut rx).await;
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert_eq!(second.method, Method::Update);
}

#[tokio::test(start_paused = true)]
async fn test_missed_refresh_is_reported_not_fatal() {
    init_tracing();
    let (manager, mut rx) = SessionManager::new(config()).unwrap();
    let se = SessionExpires::new(90).with_refresher(RefresherRole::Uas);
    let id = connected_client(&manager, &mut rx, Some(se)).await;

    loop {
        if let SessionAction::Notify(SessionNotification::RefreshMissed) = next(&mut rx).await {
            break;
        }
    }
    assert!(manager.contains(id));
    assert_eq!(manager.state(id).await.unwrap(), InviteState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_bye_stops_timers_and_answers_late_requests() {
    init_tracing();
    let (manager, mut rx) = SessionManager::new(config()).unwrap();
    let se = SessionExpires::new(1800).with_refresher(RefresherRole::Uac);
    let id = connected_client(&manager, &mut rx, Some(se)).await;
    assert_eq!(manager.armed_timers(id).len(), 1);

    manager
        .dispatch(id, InboundMessage::request(Method::Bye, Body::None))
        .await
        .unwrap();
    assert!(manager.armed_timers(id).is_empty());
    assert!(matches!(
        manager.provide_offer(id, Sdp::from("alice-2")).await,
        Err(InviteError::Terminated(_))
    ));
    drain(&mut rx);

    // BYE retransmitted because our 200 got lost
    manager
        .dispatch(id, InboundMessage::request(Method::Bye, Body::None))
        .await
        .unwrap();
    match next(&mut rx).await {
        SessionAction::SendResponse(response) => {
            assert_eq!(response.method, Method::Bye);
            assert_eq!(response.status, StatusCode::CALL_DOES_NOT_EXIST);
        }
        other => panic!("unexpected action {:?}", other),
    }

    // 200 to the INVITE retransmitted because our ACK got lost
    manager
        .dispatch(id, InboundMessage::response(Method::Invite, 200, Body::Answer(Sdp::from("bob-1"))))
        .await
        .unwrap();
    assert_eq!(next_request(&mut rx).await.method, Method::Ack);

    tokio::time::sleep(manager.config().terminated_linger() + Duration::from_secs(1)).await;
    assert!(!manager.contains(id));
    assert!(matches!(
        manager.provide_offer(id, Sdp::from("alice-2")).await,
        Err(InviteError::SessionNotFound(_))
    ));
}
