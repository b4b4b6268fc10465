use relaychat::reconnect::ReconnectState;
use relaychat::{ConnectionState, HttpClientRuntime, Notification};
use relaychat_tests::harness::relay::TestRelay;
use relaychat_tests::harness::{WAIT, init_tracing, poll_until, step_for, step_until};
use std::time::{Duration, Instant};

#[tokio::test]
async fn relay_drop_reconnects_and_refreshes_users_only() {
    init_tracing();
    let relay = TestRelay::spawn().await.unwrap();
    let alice_id = relay.add_user("alice", "secret");
    let bob_id = relay.add_user("bob", "secret");
    relay.seed_message(bob_id, alice_id, "before the drop");

    let config = relay.client_config();
    let (mut alice, _notes) = HttpClientRuntime::from_config(&config).unwrap();
    alice.login("alice", "secret").await.unwrap();
    step_until(&mut alice, WAIT, |rt| {
        rt.connection_state() == ConnectionState::Connected && rt.users().len() == 1
    })
    .await
    .unwrap();
    alice.select_user(bob_id).unwrap();
    step_until(&mut alice, WAIT, |rt| rt.conversation().len() == 1).await.unwrap();
    step_for(&mut alice, Duration::from_millis(100)).await;

    let first_conn = alice.connection_id();
    let user_fetches = relay.user_fetches();
    let message_fetches = relay.message_fetches();

    assert!(relay.kick(alice_id));
    step_until(&mut alice, WAIT, |rt| rt.connection_state() == ConnectionState::Disconnected)
        .await
        .unwrap();
    let dropped_at = Instant::now();
    step_until(&mut alice, WAIT, |rt| rt.connection_state() == ConnectionState::Connected)
        .await
        .unwrap();
    assert!(dropped_at.elapsed() >= Duration::from_millis(config.reconnect_delay_ms));
    assert_ne!(alice.connection_id(), first_conn);

    step_until(&mut alice, WAIT, |_| relay.user_fetches() > user_fetches).await.unwrap();
    step_for(&mut alice, Duration::from_millis(100)).await;
    assert_eq!(relay.message_fetches(), message_fetches, "history must not be refetched");
    assert_eq!(alice.selected(), Some(bob_id));
    assert_eq!(alice.conversation()[0].content, "before the drop");
    assert!(relay.is_online(alice_id));
}

#[tokio::test]
async fn logout_during_backoff_stops_reconnecting() {
    init_tracing();
    let relay = TestRelay::spawn().await.unwrap();
    let alice_id = relay.add_user("alice", "secret");
    relay.add_user("bob", "secret");

    let mut config = relay.client_config();
    config.reconnect_delay_ms = 300;
    let (mut alice, mut notes) = HttpClientRuntime::from_config(&config).unwrap();
    alice.login("alice", "secret").await.unwrap();
    step_until(&mut alice, WAIT, |rt| rt.connection_state() == ConnectionState::Connected)
        .await
        .unwrap();

    relay.kick(alice_id);
    step_until(&mut alice, WAIT, |rt| {
        matches!(rt.reconnect_state(), ReconnectState::Retrying { .. })
    })
    .await
    .unwrap();
    alice.stop();
    assert_eq!(alice.reconnect_state(), ReconnectState::Idle);

    step_for(&mut alice, Duration::from_millis(900)).await;
    assert!(!relay.is_online(alice_id));
    assert!(alice.session().is_none());

    let mut ended = false;
    while let Ok(n) = notes.try_recv() {
        ended |= n == Notification::SessionEnded;
    }
    assert!(ended);
}

#[tokio::test]
async fn capped_policy_gives_up_when_relay_is_gone() {
    init_tracing();
    let relay = TestRelay::spawn().await.unwrap();
    relay.add_user("alice", "secret");
    relay.add_user("bob", "secret");

    let mut config = relay.client_config();
    config.reconnect_delay_ms = 150;
    config.max_reconnect_attempts = Some(2);
    let (mut alice, mut notes) = HttpClientRuntime::from_config(&config).unwrap();
    alice.login("alice", "secret").await.unwrap();
    step_until(&mut alice, WAIT, |rt| rt.connection_state() == ConnectionState::Connected)
        .await
        .unwrap();

    drop(relay);
    step_until(&mut alice, WAIT, |rt| rt.reconnect_state() == ReconnectState::Idle)
        .await
        .unwrap();

    let mut gave_up = None;
    while let Ok(n) = notes.try_recv() {
        if let Notification::ReconnectGaveUp { attempts } = n {
            gave_up = Some(attempts);
        }
    }
    assert_eq!(gave_up, Some(2));
    assert_eq!(alice.connection_state(), ConnectionState::Disconnected);
    assert!(alice.session().is_some(), "giving up keeps the session");
}

#[tokio::test]
async fn failed_user_refresh_is_retried() {
    init_tracing();
    let relay = TestRelay::spawn().await.unwrap();
    relay.add_user("alice", "secret");
    relay.add_user("bob", "secret");
    relay.fail_user_fetches(2);

    let (mut alice, mut notes) = HttpClientRuntime::from_config(&relay.client_config()).unwrap();
    alice.login("alice", "secret").await.unwrap();
    step_until(&mut alice, WAIT, |rt| rt.users().len() == 1).await.unwrap();

    let mut unavailable = 0;
    while let Ok(n) = notes.try_recv() {
        if matches!(n, Notification::UsersUnavailable { .. }) {
            unavailable += 1;
        }
    }
    assert!(unavailable >= 1);
    assert!(poll_until(WAIT, || relay.user_fetches() >= 3).await);
}
