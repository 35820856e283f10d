//! Cross-crate collaboration scenarios against the in-memory backend

use pretty_assertions::assert_eq;
use smartpin_geometry::NormalizedPoint;
use smartpin_harness::ExpectedState;
use smartpin_model::{ScopeId, Status, UserId};
use smartpin_sync::{
    BatchItem, ChannelState, Edit, Intent, MarkerChanges, MutationState, SubscriptionHandle, SyncClient, SyncError,
    Target, ValidationFailure,
};
use smartpin_test_utils::{
    assert_no_placeholders, assert_rollups_consistent, base_layer, client_for, closure_photo, eventually, marker_at,
    scope, seeded_server, MemoryClient, MemoryServer,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn live_client(server: &Arc<MemoryServer>, user: &str) -> (SyncClient, MemoryClient, SubscriptionHandle) {
    let (client, connection) = client_for(server, user);
    let handle = client.open_scope(&scope()).await;
    tokio::time::timeout(WAIT, handle.wait_for_state(ChannelState::Live))
        .await
        .expect("subscription went live");
    (client, connection, handle)
}

async fn converged(server: &Arc<MemoryServer>, client: &SyncClient) -> Vec<String> {
    let mut last = Vec::new();
    let settled = eventually(WAIT, || {
        let expected = ExpectedState::from_records(&server.records(&scope()));
        last = expected.diff(&client.snapshot(&scope()));
        last.is_empty()
    })
    .await;
    if settled {
        Vec::new()
    } else {
        last
    }
}

#[tokio::test]
async fn offline_and_remote_creates_converge_after_reconnect() {
    let server = seeded_server();
    let (alice, _, alice_handle) = live_client(&server, "alice").await;
    let (bob, _, _) = live_client(&server, "bob").await;

    alice.set_online(false);
    tokio::time::timeout(WAIT, alice_handle.wait_for_state(ChannelState::Degraded))
        .await
        .unwrap();

    let mine = alice.mutate(&scope(), marker_at(0.2, 0.2)).unwrap();
    let theirs = bob.mutate(&scope(), marker_at(0.8, 0.8)).unwrap();
    assert_eq!(mine.outcome().await.unwrap().state, MutationState::Committed);
    assert_eq!(theirs.outcome().await.unwrap().state, MutationState::Committed);

    // Bob's marker cannot reach alice while she is offline
    assert_eq!(alice.snapshot(&scope()).marker_count(), 1);

    alice.set_online(true);
    assert_eq!(converged(&server, &alice).await, Vec::<String>::new());
    assert_eq!(converged(&server, &bob).await, Vec::<String>::new());
    assert_eq!(alice.snapshot(&scope()).marker_count(), 2);
}

#[tokio::test]
async fn rejected_create_restores_the_prior_snapshot() {
    let server = seeded_server();
    let (alice, connection, _) = live_client(&server, "alice").await;
    let before = alice.snapshot(&scope());

    connection.reject_next("quota exceeded");
    let pending = alice.mutate(&scope(), marker_at(0.4, 0.6)).unwrap();
    assert_eq!(alice.snapshot(&scope()).marker_count(), 1);

    let err = pending.outcome().await.unwrap_err();
    assert_eq!(
        err,
        SyncError::CommitRejected {
            reason: "quota exceeded".into()
        }
    );
    assert!(err.rolled_back());
    assert_eq!(alice.snapshot(&scope()), before);
}

#[tokio::test]
async fn closing_a_child_needs_a_closure_photo() {
    let server = seeded_server();
    let (alice, _, _) = live_client(&server, "alice").await;

    let marker = alice.mutate(&scope(), marker_at(0.5, 0.5)).unwrap();
    let marker_id = marker.local_id().unwrap();
    marker.outcome().await.unwrap();
    let child = alice
        .mutate(&scope(), Intent::create_child(marker_id, Vec::new()))
        .unwrap();
    let child_id = child.local_id().unwrap();
    child.outcome().await.unwrap();

    let before = alice.snapshot(&scope());
    let close = Intent::StatusTransition {
        target: Target::Child(child_id),
        to: Status::Closed,
    };
    let err = alice.mutate(&scope(), close.clone()).unwrap_err();
    assert_eq!(err.validation(), Some(&ValidationFailure::MissingClosurePhoto(child_id)));
    assert_eq!(alice.snapshot(&scope()), before);

    let attach = Intent::Update(Edit::Child {
        id: child_id,
        changes: smartpin_sync::ChildChanges {
            severity: None,
            add_photos: vec![closure_photo()],
        },
    });
    alice.mutate(&scope(), attach).unwrap().outcome().await.unwrap();
    alice.mutate(&scope(), close).unwrap().outcome().await.unwrap();

    let snapshot = alice.snapshot(&scope());
    assert_eq!(snapshot.child(&child_id).unwrap().status, Status::Closed);
    assert_eq!(snapshot.marker(&marker_id).unwrap().rollup.closed, 1);
    assert_rollups_consistent(&snapshot);
}

#[tokio::test]
async fn batches_apply_all_or_nothing() {
    let server = seeded_server();
    let (alice, connection, _) = live_client(&server, "alice").await;

    let mut ids = Vec::new();
    for x in [0.1, 0.5, 0.9] {
        let pending = alice.mutate(&scope(), marker_at(x, 0.5)).unwrap();
        ids.push(pending.local_id().unwrap());
        pending.outcome().await.unwrap();
    }
    let before = alice.snapshot(&scope());

    let moves = |y: f64| {
        ids.iter()
            .map(|id| {
                BatchItem::Update(Edit::Marker {
                    id: *id,
                    changes: MarkerChanges::moved_to(NormalizedPoint::new(0.5, y)),
                })
            })
            .collect::<Vec<_>>()
    };

    let mut invalid = moves(0.25);
    invalid.push(BatchItem::Update(Edit::Marker {
        id: ids[0],
        changes: MarkerChanges::moved_to(NormalizedPoint::new(2.0, 0.0)),
    }));
    assert!(alice.mutate_batch(&scope(), invalid).is_err());
    assert_eq!(alice.snapshot(&scope()), before);

    connection.reject_next("conflict");
    let rejected = alice.mutate_batch(&scope(), moves(0.75)).unwrap();
    assert!(alice.snapshot(&scope()).markers().all(|m| m.position.y == 0.75));
    assert!(rejected.outcome().await.unwrap_err().rolled_back());
    assert_eq!(alice.snapshot(&scope()), before);

    let accepted = alice.mutate_batch(&scope(), moves(0.75)).unwrap();
    assert_eq!(accepted.outcome().await.unwrap().acks.len(), 3);
    assert_eq!(converged(&server, &alice).await, Vec::<String>::new());
    assert!(server.records(&scope()).markers.iter().all(|m| m.position.y == 0.75));
}

#[tokio::test]
async fn own_echo_never_duplicates_the_placeholder() {
    let server = seeded_server();
    let (alice, connection, _) = live_client(&server, "alice").await;

    connection.hold_commits();
    let pending = alice.mutate(&scope(), marker_at(0.3, 0.3)).unwrap();
    let local = pending.local_id().unwrap();
    let placeholder = alice.snapshot(&scope());
    assert!(placeholder.marker(&local).unwrap().id.is_placeholder());

    connection.release_commits();
    pending.outcome().await.unwrap();
    assert_eq!(converged(&server, &alice).await, Vec::<String>::new());

    let snapshot = alice.snapshot(&scope());
    assert_eq!(snapshot.marker_count(), 1);
    let promoted = snapshot.marker(&local).unwrap();
    assert!(!promoted.id.is_placeholder());
    assert_eq!(promoted.seq, server.records(&scope()).markers[0].seq);
}

#[tokio::test]
async fn duplicate_delivery_is_harmless() {
    let server = seeded_server();
    let (alice, _, _) = live_client(&server, "alice").await;
    let (bob, bob_connection, _) = live_client(&server, "bob").await;
    bob_connection.duplicate_delivery(true);

    let marker = alice.mutate(&scope(), marker_at(0.6, 0.4)).unwrap();
    let marker_id = marker.local_id().unwrap();
    marker.outcome().await.unwrap();
    for _ in 0..2 {
        alice
            .mutate(&scope(), Intent::create_child(marker_id, vec![closure_photo()]))
            .unwrap()
            .outcome()
            .await
            .unwrap();
    }

    assert_eq!(converged(&server, &bob).await, Vec::<String>::new());
    let snapshot = bob.snapshot(&scope());
    assert_eq!(snapshot.marker_count(), 1);
    assert_eq!(snapshot.child_count(), 2);
    assert_rollups_consistent(&snapshot);
    assert_no_placeholders(&snapshot);
}

#[tokio::test]
async fn remote_children_share_one_code_sequence() {
    let server = seeded_server();
    let (alice, _, _) = live_client(&server, "alice").await;
    let (bob, _, _) = live_client(&server, "bob").await;

    let marker = alice.mutate(&scope(), marker_at(0.5, 0.5)).unwrap();
    marker.outcome().await.unwrap();
    assert_eq!(converged(&server, &bob).await, Vec::<String>::new());
    let on_bob = bob.snapshot(&scope()).markers().next().unwrap().id.local;
    let on_alice = alice.snapshot(&scope()).markers().next().unwrap().id.local;

    let a = alice.mutate(&scope(), Intent::create_child(on_alice, Vec::new())).unwrap();
    let b = bob.mutate(&scope(), Intent::create_child(on_bob, Vec::new())).unwrap();
    a.outcome().await.unwrap();
    b.outcome().await.unwrap();

    assert_eq!(converged(&server, &alice).await, Vec::<String>::new());
    assert_eq!(converged(&server, &bob).await, Vec::<String>::new());
    let mut codes: Vec<String> = alice
        .snapshot(&scope())
        .children()
        .map(|c| c.code.to_string())
        .collect();
    codes.sort();
    assert_eq!(codes, vec!["1.1".to_string(), "1.2".to_string()]);
}

#[tokio::test]
async fn switching_scope_stops_merging_the_old_one() {
    let server = seeded_server();
    let other = ScopeId::new("roof-2");
    server.put_layer(&other, base_layer());
    let (alice, _, _) = live_client(&server, "alice").await;

    let handle = alice.open_scope(&other).await;
    tokio::time::timeout(WAIT, handle.wait_for_state(ChannelState::Live))
        .await
        .unwrap();
    assert_eq!(server.subscriber_count(&scope()), 0);
    assert_eq!(server.subscriber_count(&other), 1);

    let before = alice.snapshot(&scope());
    server
        .commit_direct(
            &scope(),
            smartpin_sync::CommitRequest {
                client_ref: smartpin_model::LocalId::new(),
                op: smartpin_sync::CommitOp::CreateMarker {
                    layer: "base".into(),
                    position: NormalizedPoint::new(0.5, 0.5),
                    severity: smartpin_model::Severity::High,
                },
            },
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.snapshot(&scope()), before);
    assert_eq!(alice.hub().current().await.unwrap().scope(), &other);
}

#[tokio::test]
async fn cursors_and_previews_reach_other_users() {
    let server = seeded_server();
    let (_alice, _, alice_handle) = live_client(&server, "alice").await;
    let (_bob, _, bob_handle) = live_client(&server, "bob").await;
    let alice_id = UserId::new("alice");

    for x in [0.1, 0.2, 0.3] {
        alice_handle
            .cursor()
            .move_to(NormalizedPoint::new(x, 0.5), Some("pin".into()))
            .unwrap();
    }
    let landed = eventually(WAIT, || {
        bob_handle
            .presence()
            .get(&alice_id)
            .and_then(|p| p.cursor)
            .is_some_and(|at| at == NormalizedPoint::new(0.3, 0.5))
    })
    .await;
    assert!(landed);
    assert!(alice_handle.presence().get(&alice_id).is_none());

    let stroke = vec![NormalizedPoint::new(0.1, 0.1), NormalizedPoint::new(0.2, 0.2)];
    alice_handle.publish_preview(stroke.clone()).await.unwrap();
    assert!(eventually(WAIT, || bob_handle.presence().preview(&alice_id) == Some(stroke.clone())).await);

    alice_handle.publish_preview(Vec::new()).await.unwrap();
    assert!(eventually(WAIT, || bob_handle.presence().preview(&alice_id).is_none()).await);
}

#[tokio::test]
async fn degraded_channel_resyncs_when_it_returns() {
    let server = seeded_server();
    let (alice, alice_connection, alice_handle) = live_client(&server, "alice").await;
    let (bob, _, bob_handle) = live_client(&server, "bob").await;
    bob_handle.announce(Some("pin".into())).await.unwrap();
    assert!(eventually(WAIT, || !alice_handle.presence().is_empty()).await);

    alice_connection.set_channel_available(false);
    tokio::time::timeout(WAIT, alice_handle.wait_for_state(ChannelState::Degraded))
        .await
        .unwrap();
    assert!(alice_handle.presence().is_empty());
    assert_eq!(
        alice_handle.cursor().move_to(NormalizedPoint::new(0.5, 0.5), None),
        Err(SyncError::ChannelDegraded)
    );

    bob.mutate(&scope(), marker_at(0.7, 0.3)).unwrap().outcome().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(alice.snapshot(&scope()).marker_count(), 0);

    alice_connection.set_channel_available(true);
    tokio::time::timeout(WAIT, alice_handle.wait_for_state(ChannelState::Live))
        .await
        .unwrap();
    assert_eq!(converged(&server, &alice).await, Vec::<String>::new());
    assert_eq!(alice.snapshot(&scope()).marker_count(), 1);
}

#[tokio::test]
async fn remote_delete_of_a_marker_removes_its_children() {
    let server = seeded_server();
    let (alice, _, _) = live_client(&server, "alice").await;
    let (bob, _, _) = live_client(&server, "bob").await;

    let marker = alice.mutate(&scope(), marker_at(0.5, 0.5)).unwrap();
    let marker_id = marker.local_id().unwrap();
    marker.outcome().await.unwrap();
    alice
        .mutate(&scope(), Intent::create_child(marker_id, Vec::new()))
        .unwrap()
        .outcome()
        .await
        .unwrap();
    assert_eq!(converged(&server, &bob).await, Vec::<String>::new());

    let on_bob = bob.snapshot(&scope()).markers().next().unwrap().id.local;
    bob.mutate(&scope(), Intent::Delete(Target::Marker(on_bob)))
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(converged(&server, &alice).await, Vec::<String>::new());
    let snapshot = alice.snapshot(&scope());
    assert_eq!(snapshot.marker_count(), 0);
    assert_eq!(snapshot.child_count(), 0);
}

#[tokio::test]
async fn remote_move_waits_behind_a_pending_delete() {
    let server = seeded_server();
    let (alice, alice_connection, _) = live_client(&server, "alice").await;
    let (bob, _, _) = live_client(&server, "bob").await;

    let created = bob.mutate(&scope(), marker_at(0.5, 0.5)).unwrap();
    let on_bob = created.local_id().unwrap();
    created.outcome().await.unwrap();
    assert_eq!(converged(&server, &alice).await, Vec::<String>::new());

    alice_connection.hold_commits();
    let on_alice = alice.snapshot(&scope()).markers().next().unwrap().id.local;
    let delete = alice
        .mutate(&scope(), Intent::Delete(Target::Marker(on_alice)))
        .unwrap();
    assert_eq!(alice.snapshot(&scope()).marker_count(), 0);

    let moved = Intent::Update(Edit::Marker {
        id: on_bob,
        changes: MarkerChanges::moved_to(NormalizedPoint::new(0.9, 0.5)),
    });
    bob.mutate(&scope(), moved).unwrap().outcome().await.unwrap();

    let parked = eventually(WAIT, || alice.pipeline().ledger().buffered_len() == 1).await;
    assert!(parked, "bob's move should wait behind alice's delete");
    assert_eq!(alice.snapshot(&scope()).marker_count(), 0);

    alice_connection.reject_next("marker is referenced by a report");
    alice_connection.release_commits();
    assert!(delete.outcome().await.unwrap_err().rolled_back());

    assert_eq!(converged(&server, &alice).await, Vec::<String>::new());
    let snapshot = alice.snapshot(&scope());
    assert_eq!(snapshot.marker_count(), 1);
    assert_eq!(snapshot.markers().next().unwrap().position.x, 0.9);
    assert!(alice.pipeline().ledger().is_idle());
    assert_no_placeholders(&snapshot);
}
