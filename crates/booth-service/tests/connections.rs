//! Connection lifecycle tests: handshake, lost sessions, resume across
//! instances, restart recovery, bans, chat and guest counting.
//!
//! Paused-time tests rely on tokio auto-advancing the clock whenever every
//! task is idle, so grace periods and auth windows elapse instantly.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use booth_service::bus::{EventBus, ServerAction, WireMessage};
use booth_service::connections::ConnectionState;
use booth_service::connections::registry::CHAT_MAX_LENGTH;
use booth_service::directory::UserRecord;
use booth_service::store::{keys, StateStore};
use booth_service::waitlist::AddUserOptions;
use booth_test_utils::{TestClient, TestInfra, TestInstance};
use serde_json::json;

const GRACE_ELAPSED: Duration = Duration::from_secs(31);

async fn wait_for_state(instance: &TestInstance, user_id: &str, expected: Option<ConnectionState>) {
    for _ in 0..200 {
        if instance.registry.lookup_user(user_id).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{user_id} never reached {expected:?} on {}", instance.instance_id);
}

async fn is_online(infra: &TestInfra, user_id: &str) -> bool {
    infra
        .store
        .set_contains(keys::ONLINE_USERS, user_id)
        .await
        .unwrap()
}

fn notice(n: u64) -> WireMessage {
    WireMessage::new("notice", json!(n))
}

/// Next message that is not a guest count update.
async fn next_non_guest(client: &mut TestClient) -> WireMessage {
    loop {
        let message = client.next_message().await;
        if message.command != "guests" {
            return message;
        }
    }
}

async fn wait_for_guest_total(infra: &TestInfra, expected: u64) {
    for _ in 0..600 {
        let total = infra.store.get(keys::GUEST_TOTAL).await.unwrap();
        if total == Some(expected.to_string()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("guest total never reached {expected}");
}

async fn claim_elsewhere(infra: &TestInfra, user_id: &str, instance_id: &str) {
    infra
        .store
        .hash_set(keys::SESSION_OWNERS, user_id, instance_id)
        .await
        .unwrap();
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_login_marks_participant_online() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    infra.add_participant("bob", &[]);
    let instance = infra.instance("booth-1");
    let mut bob = instance.login("bob").await;

    let _alice = instance.login("alice").await;

    let joined = bob.expect_command("join").await;
    assert_eq!(joined["userID"], "alice");
    assert!(is_online(&infra, "alice").await);
    assert_eq!(
        infra
            .store
            .hash_get(keys::SESSION_OWNERS, "alice")
            .await
            .unwrap()
            .as_deref(),
        Some("booth-1")
    );
    assert_eq!(
        instance.registry.lookup_user("alice").await.unwrap(),
        Some(ConnectionState::Authenticated)
    );
}

#[tokio::test]
async fn test_consumed_token_leaves_guest_waiting() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    let instance = infra.instance("booth-1");
    let token = instance.auth.create_auth_token("alice").await.unwrap();

    let mut first = instance.connect().await;
    first.send_raw(&token).await;
    first.expect_command("authenticated").await;

    let mut second = instance.connect().await;
    second.send_raw(&token).await;
    second.expect_command("error").await;

    let status = instance.registry.status().await.unwrap();
    assert_eq!(status.guests, 1);
    assert_eq!(status.authenticated, 1);

    // Still inside its window, the guest may try again.
    let fresh = instance.auth.create_auth_token("alice").await.unwrap();
    second.send_raw(&fresh).await;
    let ack = second.expect_command("authenticated").await;
    assert_eq!(ack["userID"], "alice");
    first.expect_close().await;
}

#[tokio::test]
async fn test_garbage_token_is_rejected() {
    let infra = TestInfra::new();
    let instance = infra.instance("booth-1");
    let mut guest = instance.connect().await;

    guest.send_raw("not-a-token").await;

    guest.expect_command("error").await;
    assert_eq!(instance.registry.status().await.unwrap().guests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_guest_closed_when_auth_window_elapses() {
    let infra = TestInfra::new();
    let instance = infra.instance("booth-1");
    let mut guest = instance.connect().await;

    tokio::time::sleep(Duration::from_secs(31)).await;

    guest.expect_command("error").await;
    guest.expect_close().await;
    assert_eq!(instance.registry.status().await.unwrap().guests, 0);
}

#[tokio::test]
async fn test_second_login_replaces_first_connection() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    let instance = infra.instance("booth-1");
    let mut first = instance.login("alice").await;

    let _second = instance.login("alice").await;

    first.expect_close().await;
    let status = instance.registry.status().await.unwrap();
    assert_eq!(status.authenticated, 1);
    assert_eq!(status.lost, 0);
}

// ============================================================================
// Lost sessions
// ============================================================================

#[tokio::test]
async fn test_lost_session_flushes_backlog_in_order_on_resume() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    let instance = infra.instance("booth-1");
    let alice = instance.login("alice").await;

    alice.close().await;
    wait_for_state(&instance, "alice", Some(ConnectionState::Lost)).await;

    instance.registry.send_to("alice", notice(1)).await.unwrap();
    instance
        .registry
        .broadcast(WireMessage::new("announcement", json!("hi")))
        .await
        .unwrap();
    instance.registry.send_to("alice", notice(2)).await.unwrap();

    let mut resumed = instance.login("alice").await;

    let replayed: Vec<(String, serde_json::Value)> = [
        next_non_guest(&mut resumed).await,
        next_non_guest(&mut resumed).await,
        next_non_guest(&mut resumed).await,
    ]
    .into_iter()
    .map(|m| (m.command, m.data))
    .collect();
    assert_eq!(
        replayed,
        [
            ("notice".to_string(), json!(1)),
            ("announcement".to_string(), json!("hi")),
            ("notice".to_string(), json!(2)),
        ]
    );

    assert_eq!(
        infra.store.list_len(&keys::lost_queue("alice")).await.unwrap(),
        0
    );
    assert!(infra
        .store
        .get(&keys::lost_marker("alice"))
        .await
        .unwrap()
        .is_none());
    assert!(is_online(&infra, "alice").await);
}

#[tokio::test(start_paused = true)]
async fn test_booth_events_reach_lost_participant_resuming_elsewhere() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    infra.add_participant("bob", &[("b1", 600)]);
    let first = infra.instance("booth-a");
    let second = infra.instance("booth-b");
    let alice = first.login("alice").await;
    let _bob = second.login("bob").await;

    alice.close().await;
    wait_for_state(&first, "alice", Some(ConnectionState::Lost)).await;
    second
        .waitlist
        .add_user("bob", AddUserOptions::default())
        .await
        .unwrap();
    // Let booth-a work through the bus fan-out.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut resumed = second.login("alice").await;

    let advance = resumed.expect_command("advance").await;
    assert_eq!(advance["userID"], "bob");
    assert_eq!(
        infra.store.list_len(&keys::lost_queue("alice")).await.unwrap(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_grace_expiry_takes_participant_offline_and_drops_backlog() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    infra.add_participant("bob", &[]);
    let instance = infra.instance("booth-1");
    let mut bob = instance.login("bob").await;
    let alice = instance.login("alice").await;

    alice.close().await;
    instance.registry.send_to("alice", notice(1)).await.unwrap();
    tokio::time::sleep(GRACE_ELAPSED).await;

    let left = bob.expect_command("leave").await;
    assert_eq!(left["userID"], "alice");
    assert!(!is_online(&infra, "alice").await);
    assert_eq!(
        infra.store.list_len(&keys::lost_queue("alice")).await.unwrap(),
        0
    );
    assert_eq!(instance.registry.lookup_user("alice").await.unwrap(), None);

    // Coming back now is a fresh arrival, not a resume.
    let _alice = instance.login("alice").await;
    let joined = bob.expect_command("join").await;
    assert_eq!(joined["userID"], "alice");
}

#[tokio::test(start_paused = true)]
async fn test_performer_dropping_for_good_is_skipped() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[("a1", 600)]);
    infra.add_participant("bob", &[("b1", 600)]);
    let instance = infra.instance("booth-1");
    let alice = instance.login("alice").await;
    let _bob = instance.login("bob").await;
    for id in ["alice", "bob"] {
        instance
            .waitlist
            .add_user(id, AddUserOptions::default())
            .await
            .unwrap();
    }

    alice.close().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("alice"));

    tokio::time::sleep(GRACE_ELAPSED).await;
    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("bob"));
    assert!(instance.waitlist.ordered_ids().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_session_resumes_on_another_instance() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    let first = infra.instance("booth-a");
    let second = infra.instance("booth-b");
    let alice = first.login("alice").await;

    alice.close().await;
    wait_for_state(&first, "alice", Some(ConnectionState::Lost)).await;
    first.registry.send_to("alice", notice(7)).await.unwrap();
    // The send is buffered by the time the registry answers.
    first.registry.status().await.unwrap();

    let mut resumed = second.login("alice").await;
    let buffered = resumed.next_message().await;
    assert_eq!((buffered.command.as_str(), buffered.data), ("notice", json!(7)));

    wait_for_state(&first, "alice", None).await;
    assert_eq!(
        infra
            .store
            .hash_get(keys::SESSION_OWNERS, "alice")
            .await
            .unwrap()
            .as_deref(),
        Some("booth-b")
    );

    // Anything booth-a still routes to alice is neither queued nor lost
    // into a queue nobody drains.
    first.registry.send_to("alice", notice(8)).await.unwrap();
    first.registry.status().await.unwrap();
    assert_eq!(
        infra.store.list_len(&keys::lost_queue("alice")).await.unwrap(),
        0
    );

    // The old instance's grace timer must not take alice offline.
    tokio::time::sleep(GRACE_ELAPSED).await;
    assert!(is_online(&infra, "alice").await);
    assert_eq!(
        second.registry.lookup_user("alice").await.unwrap(),
        Some(ConnectionState::Authenticated)
    );
}

#[tokio::test]
async fn test_send_after_session_claimed_elsewhere_is_dropped() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    let instance = infra.instance("booth-a");
    let alice = instance.login("alice").await;
    alice.close().await;
    wait_for_state(&instance, "alice", Some(ConnectionState::Lost)).await;

    // booth-b took the session but its resume notice has not arrived.
    claim_elsewhere(&infra, "alice", "booth-b").await;
    instance.registry.send_to("alice", notice(1)).await.unwrap();
    instance
        .registry
        .broadcast(WireMessage::new("announcement", json!("hi")))
        .await
        .unwrap();
    instance.registry.status().await.unwrap();

    assert_eq!(
        infra.store.list_len(&keys::lost_queue("alice")).await.unwrap(),
        0
    );
    assert_eq!(instance.registry.lookup_user("alice").await.unwrap(), None);
    assert!(is_online(&infra, "alice").await);
}

#[tokio::test(start_paused = true)]
async fn test_grace_expiry_spares_session_claimed_elsewhere() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    infra.add_participant("bob", &[]);
    let instance = infra.instance("booth-a");
    let mut bob = instance.login("bob").await;
    let alice = instance.login("alice").await;
    alice.close().await;
    wait_for_state(&instance, "alice", Some(ConnectionState::Lost)).await;

    claim_elsewhere(&infra, "alice", "booth-b").await;
    tokio::time::sleep(GRACE_ELAPSED).await;

    assert_eq!(instance.registry.lookup_user("alice").await.unwrap(), None);
    assert!(is_online(&infra, "alice").await);
    assert_eq!(
        infra
            .store
            .hash_get(keys::SESSION_OWNERS, "alice")
            .await
            .unwrap()
            .as_deref(),
        Some("booth-b")
    );
    assert!(bob.drain().iter().all(|m| m.command != "leave"));
}

#[tokio::test(start_paused = true)]
async fn test_restart_restores_owned_sessions_as_lost() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    infra.add_participant("carol", &[]);
    let crashed = infra.instance("booth-a");
    let _alice = crashed.login("alice").await;
    let _carol = crashed.login("carol").await;
    crashed.shutdown();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let restarted = infra.instance("booth-a");
    let bystander = infra.instance("booth-b");

    assert_eq!(
        restarted.registry.lookup_user("alice").await.unwrap(),
        Some(ConnectionState::Lost)
    );
    assert_eq!(bystander.registry.lookup_user("alice").await.unwrap(), None);

    let _alice = restarted.login("alice").await;
    tokio::time::sleep(GRACE_ELAPSED).await;

    assert!(is_online(&infra, "alice").await);
    assert!(!is_online(&infra, "carol").await);
}

// ============================================================================
// Bans, chat, votes
// ============================================================================

#[tokio::test]
async fn test_ban_closes_connection_and_blocks_login() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    infra.add_participant("bob", &[]);
    let instance = infra.instance("booth-1");
    let mut alice = instance.login("alice").await;
    let mut bob = instance.login("bob").await;

    infra.directory.update_user("alice", |u| u.banned = true).unwrap();
    infra
        .bus
        .publish_action(ServerAction::UserBan {
            user_id: "alice".to_string(),
            moderator_id: "mod".to_string(),
        })
        .await
        .unwrap();

    alice.expect_close().await;
    let banned = bob.expect_command("ban").await;
    assert_eq!(banned["userID"], "alice");
    let left = bob.expect_command("leave").await;
    assert_eq!(left["userID"], "alice");
    assert!(!is_online(&infra, "alice").await);

    let token = instance.auth.create_auth_token("alice").await.unwrap();
    let mut retry = instance.connect().await;
    retry.send_raw(&token).await;
    retry.expect_command("error").await;
    assert_eq!(instance.registry.lookup_user("alice").await.unwrap(), None);
}

#[tokio::test]
async fn test_chat_is_trimmed_truncated_and_fanned_out() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    infra.add_participant("bob", &[]);
    let first = infra.instance("booth-1");
    let second = infra.instance("booth-2");
    let alice = first.login("alice").await;
    let mut bob = second.login("bob").await;

    alice.send("sendChat", json!("  hello  ")).await;
    let chat = bob.expect_command("chatMessage").await;
    assert_eq!(chat["userID"], "alice");
    assert_eq!(chat["message"], "hello");
    assert!(chat["id"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(chat["timestamp"].as_i64().is_some());

    alice.send("sendChat", json!("   ")).await;
    alice.send("sendChat", json!("x".repeat(CHAT_MAX_LENGTH + 100))).await;
    let chat = bob.expect_command("chatMessage").await;
    assert_eq!(chat["message"].as_str().unwrap().len(), CHAT_MAX_LENGTH);
}

#[tokio::test]
async fn test_chat_needs_permission_and_no_mute() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    infra.directory.put_user(UserRecord::new("carol", "carol")).unwrap();
    let instance = infra.instance("booth-1");
    let mut alice = instance.login("alice").await;
    let mut carol = instance.login("carol").await;

    carol.send("sendChat", json!("hi")).await;
    carol.expect_command("error").await;

    infra.directory.update_user("alice", |u| u.muted = true).unwrap();
    alice.send("sendChat", json!("hi")).await;
    alice.expect_command("error").await;
}

#[tokio::test]
async fn test_votes_reach_every_instance() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[("a1", 600)]);
    infra.add_participant("bob", &[]);
    infra.add_participant("carol", &[]);
    let first = infra.instance("booth-1");
    let second = infra.instance("booth-2");
    let alice = first.login("alice").await;
    let mut carol = first.login("carol").await;
    let mut bob = second.login("bob").await;
    first
        .waitlist
        .add_user("alice", AddUserOptions::default())
        .await
        .unwrap();

    bob.send("vote", json!(1)).await;
    let vote = carol.expect_command("vote").await;
    assert_eq!(vote, json!({ "userID": "bob", "value": 1 }));

    // The performer's own vote is dropped without an error.
    alice.send("vote", json!(1)).await;
    first.registry.status().await.unwrap();

    bob.send("vote", json!(2)).await;
    bob.expect_command("error").await;

    bob.send("vote", json!(-1)).await;
    let vote = carol.expect_command("vote").await;
    assert_eq!(vote, json!({ "userID": "bob", "value": -1 }));
}

#[tokio::test]
async fn test_logout_leaves_waitlist() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[("a1", 600)]);
    infra.add_participant("bob", &[("b1", 600)]);
    let instance = infra.instance("booth-1");
    let mut alice = instance.login("alice").await;
    let mut bob = instance.login("bob").await;
    for id in ["bob", "alice"] {
        instance
            .waitlist
            .add_user(id, AddUserOptions::default())
            .await
            .unwrap();
    }

    alice.send("logout", json!(null)).await;

    alice.expect_close().await;
    let left = bob.expect_command("leave").await;
    assert_eq!(left["userID"], "alice");
    bob.expect_command("waitlistLeave").await;
    assert!(instance.waitlist.ordered_ids().await.unwrap().is_empty());
    assert!(!is_online(&infra, "alice").await);
}

// ============================================================================
// Guests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_guest_count_spans_instances() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    let first = infra.instance("booth-a");
    let second = infra.instance("booth-b");
    let mut observer = first.login("alice").await;

    let _g1 = first.connect().await;
    let _g2 = first.connect().await;
    let g3 = second.connect().await;

    while observer.expect_command("guests").await != json!(3) {}

    g3.close().await;
    while observer.expect_command("guests").await != json!(2) {}
}

#[tokio::test(start_paused = true)]
async fn test_crashed_instance_guests_age_out_of_total() {
    let infra = TestInfra::new();
    infra
        .store
        .set(&keys::guest_count("booth-gone"), "5", Some(Duration::from_secs(15)))
        .await
        .unwrap();
    infra
        .store
        .set_add(keys::GUEST_INSTANCES, "booth-gone")
        .await
        .unwrap();
    let instance = infra.instance("booth-a");
    let _guest = instance.connect().await;

    wait_for_guest_total(&infra, 6).await;
    assert!(infra
        .store
        .time_to_live(&keys::guest_count("booth-a"))
        .unwrap()
        .is_some());

    // The next refresh after booth-gone's count expires drops it.
    wait_for_guest_total(&infra, 1).await;
    assert!(!infra
        .store
        .set_contains(keys::GUEST_INSTANCES, "booth-gone")
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_guest_count_published_once_per_change() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    let first = infra.instance("booth-a");
    let second = infra.instance("booth-b");
    let _third = infra.instance("booth-c");
    let mut observer = first.login("alice").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    observer.drain();

    let _guest = second.connect().await;
    // Spans two refreshes on every instance.
    tokio::time::sleep(Duration::from_secs(25)).await;

    let counts: Vec<_> = observer
        .drain()
        .into_iter()
        .filter(|m| m.command == "guests")
        .map(|m| m.data)
        .collect();
    assert_eq!(counts, [json!(1)]);
}

// ============================================================================
// Verbatim broadcasts
// ============================================================================

#[tokio::test]
async fn test_bus_broadcast_reaches_every_live_connection() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[]);
    let first = infra.instance("booth-1");
    let second = infra.instance("booth-2");
    let mut alice = first.login("alice").await;
    let mut guest = second.connect().await;

    infra
        .bus
        .publish_broadcast(WireMessage::new("motd", json!("welcome")))
        .await
        .unwrap();

    assert_eq!(alice.expect_command("motd").await, json!("welcome"));
    assert_eq!(guest.expect_command("motd").await, json!("welcome"));
}
