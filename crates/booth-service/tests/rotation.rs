//! Booth rotation across instances sharing one store and bus.
//!
//! Drives the waitlist and scheduler directly and checks what connected
//! clients observe.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use booth_service::booth::AdvanceOptions;
use booth_service::errors::BoothError;
use booth_service::store::{keys, StateStore};
use booth_service::waitlist::AddUserOptions;
use booth_test_utils::{TestInfra, TestInstance};
use serde_json::json;

async fn join(instance: &TestInstance, user_id: &str) {
    instance
        .waitlist
        .add_user(user_id, AddUserOptions::default())
        .await
        .unwrap();
}

/// The performer is never queued, and nobody is queued twice.
async fn assert_waitlist_invariant(instance: &TestInstance) {
    let waitlist = instance.waitlist.ordered_ids().await.unwrap();
    if let Some(dj) = instance.booth.current_dj().await.unwrap() {
        assert!(!waitlist.contains(&dj), "performer {dj} is queued: {waitlist:?}");
    }
    let mut unique = waitlist.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), waitlist.len(), "duplicate entries: {waitlist:?}");
}

// ============================================================================
// Rotation
// ============================================================================

#[tokio::test]
async fn test_first_join_starts_the_booth() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[("a1", 180)]);
    let instance = infra.instance("booth-1");
    let mut observer = instance.login("alice").await;

    join(&instance, "alice").await;

    let joined = observer.expect_command("waitlistJoin").await;
    assert_eq!(joined["userID"], "alice");
    let advance = observer.expect_command("advance").await;
    assert_eq!(advance["userID"], "alice");
    assert_eq!(advance["media"]["id"], "a1");
    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("alice"));
    assert!(instance.waitlist.ordered_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_full_rotation_returns_to_first_performer() {
    let infra = TestInfra::new();
    for id in ["alice", "bob", "carol"] {
        let (first, second) = (format!("{id}-1"), format!("{id}-2"));
        infra.add_participant(id, &[(first.as_str(), 180), (second.as_str(), 180)]);
    }
    let instance = infra.instance("booth-1");
    for id in ["alice", "bob", "carol"] {
        join(&instance, id).await;
    }
    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("alice"));
    assert_eq!(instance.waitlist.ordered_ids().await.unwrap(), ["bob", "carol"]);

    let mut performers = Vec::new();
    for _ in 0..3 {
        let play = instance
            .booth
            .advance(AdvanceOptions::default())
            .await
            .unwrap()
            .unwrap();
        performers.push((play.user_id, play.media.id));
        assert_waitlist_invariant(&instance).await;
    }

    assert_eq!(
        performers,
        [
            ("bob".to_string(), "bob-1".to_string()),
            ("carol".to_string(), "carol-1".to_string()),
            ("alice".to_string(), "alice-2".to_string()),
        ]
    );
    assert_eq!(instance.waitlist.ordered_ids().await.unwrap(), ["bob", "carol"]);

    let history = instance.booth.recent_history(10).await.unwrap();
    assert_eq!(history.len(), 4);
    assert!(history.iter().skip(1).all(|record| record.is_sealed()));
}

#[tokio::test]
async fn test_performer_with_emptied_playlist_leaves_rotation() {
    let infra = TestInfra::new();
    for id in ["dave", "alice", "bob", "carol"] {
        let track = format!("{id}-1");
        infra.add_participant(id, &[(track.as_str(), 180)]);
    }
    let instance = infra.instance("booth-1");
    for id in ["dave", "alice", "bob", "carol"] {
        join(&instance, id).await;
    }
    assert_eq!(instance.waitlist.ordered_ids().await.unwrap(), ["alice", "bob", "carol"]);

    infra.set_tracks("dave", &[]);
    let play = instance
        .booth
        .advance(AdvanceOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(play.user_id, "alice");
    assert_eq!(instance.waitlist.ordered_ids().await.unwrap(), ["bob", "carol"]);
}

#[tokio::test]
async fn test_instances_share_one_booth() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[("a1", 180)]);
    infra.add_participant("bob", &[("b1", 180)]);
    let first = infra.instance("booth-1");
    let second = infra.instance("booth-2");
    let mut watcher = second.login("bob").await;

    join(&first, "alice").await;
    join(&second, "bob").await;

    assert_eq!(second.booth.current_dj().await.unwrap().as_deref(), Some("alice"));
    assert_eq!(first.waitlist.ordered_ids().await.unwrap(), ["bob"]);

    second.booth.advance(AdvanceOptions::default()).await.unwrap();
    assert_eq!(first.booth.current_dj().await.unwrap().as_deref(), Some("bob"));
    assert_eq!(first.waitlist.ordered_ids().await.unwrap(), ["alice"]);

    let advance = watcher.expect_command("advance").await;
    assert_eq!(advance["userID"], "alice");
    let advance = watcher.expect_command("advance").await;
    assert_eq!(advance["userID"], "bob");
}

#[tokio::test]
async fn test_advance_fails_fast_while_another_instance_holds_the_lease() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[("a1", 180)]);
    infra.add_participant("bob", &[("b1", 180)]);
    let instance = infra.instance("booth-1");
    join(&instance, "alice").await;
    join(&instance, "bob").await;

    assert!(infra
        .store
        .acquire_lease(keys::ADVANCE_LEASE, "other-instance", Duration::from_secs(5))
        .await
        .unwrap());

    let result = instance.booth.advance(AdvanceOptions::default()).await;
    assert!(matches!(result, Err(BoothError::AdvanceInProgress)));
    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("alice"));
    assert_eq!(instance.waitlist.ordered_ids().await.unwrap(), ["bob"]);

    infra
        .store
        .release_lease(keys::ADVANCE_LEASE, "other-instance")
        .await
        .unwrap();
    instance.booth.advance(AdvanceOptions::default()).await.unwrap();
    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("bob"));
}

#[tokio::test(start_paused = true)]
async fn test_play_timer_rotates_performers() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[("a1", 60)]);
    infra.add_participant("bob", &[("b1", 90)]);
    let instance = infra.instance("booth-1");
    join(&instance, "alice").await;
    join(&instance, "bob").await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("bob"));
    assert_waitlist_invariant(&instance).await;

    tokio::time::sleep(Duration::from_secs(91)).await;
    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("alice"));
    assert_eq!(instance.waitlist.ordered_ids().await.unwrap(), ["bob"]);
}

// ============================================================================
// Waitlist
// ============================================================================

#[tokio::test]
async fn test_leaving_performer_is_not_requeued() {
    let infra = TestInfra::new();
    infra.add_participant("alice", &[("a1", 180)]);
    infra.add_participant("bob", &[("b1", 180)]);
    let instance = infra.instance("booth-1");
    join(&instance, "alice").await;
    join(&instance, "bob").await;

    assert!(instance.booth.skip_if_current("alice").await.unwrap());

    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("bob"));
    assert!(instance.waitlist.ordered_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_move_to_same_place_publishes_nothing() {
    let infra = TestInfra::new();
    infra.add_moderator("mod");
    for id in ["alice", "bob", "carol", "dave"] {
        infra.add_participant(id, &[(format!("{id}-1").as_str(), 180)]);
    }
    let instance = infra.instance("booth-1");
    for id in ["alice", "bob", "carol", "dave"] {
        join(&instance, id).await;
    }
    let mut observer = instance.login("mod").await;

    assert!(!instance.waitlist.move_user("carol", 1, "mod").await.unwrap());
    assert!(instance.waitlist.move_user("dave", 0, "mod").await.unwrap());

    // The first move left no trace; the next message is the real move.
    let moved = observer.expect_command("waitlistMove").await;
    assert_eq!(moved["userID"], "dave");
    assert_eq!(moved["position"], 0);
    assert_eq!(moved["waitlist"], json!(["dave", "bob", "carol"]));
}

#[tokio::test]
async fn test_locked_waitlist_rejects_regular_joins() {
    let infra = TestInfra::new();
    infra.add_moderator("mod");
    infra.add_participant("alice", &[("a1", 180)]);
    infra.add_participant("bob", &[("b1", 180)]);
    let instance = infra.instance("booth-1");
    let mut observer = instance.login("alice").await;

    instance.waitlist.lock("mod").await.unwrap();
    let locked = observer.expect_command("waitlistLock").await;
    assert_eq!(locked["locked"], true);

    let result = instance
        .waitlist
        .add_user("alice", AddUserOptions::default())
        .await;
    assert!(matches!(result, Err(BoothError::PermissionDenied(_))));

    // A moderator holding force-join rights still gets people in.
    instance
        .waitlist
        .add_user("bob", AddUserOptions::by_moderator("mod", None))
        .await
        .unwrap();
    assert_eq!(instance.booth.current_dj().await.unwrap().as_deref(), Some("bob"));

    instance.waitlist.unlock("mod").await.unwrap();
    join(&instance, "alice").await;
    assert_eq!(instance.waitlist.ordered_ids().await.unwrap(), ["alice"]);
}
