//! Integration tests for session setup faults and teardown.
//!
//! Teardown must release every resource exactly once whatever state the
//! session is in: idle, fully meshed, or with dials still in flight.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use call_engine::actors::{ConnectionPhase, EndReason, SessionEvent};
use call_engine::config::EngineConfig;
use call_engine::directory::DirectoryEntry;
use call_engine::errors::CallError;
use call_engine::link::{LinkEvent, LinkPrimitive};
use call_engine::media::{DeviceAvailability, SyntheticDevices, TrackKind};
use call_test_utils::{
    assert_eventually, fast_engine_config, ConsistencyCategory, TestParticipant, TestRoom,
};

// ============================================================================
// Setup Faults
// ============================================================================

#[tokio::test]
async fn test_denied_camera_fails_join_cleanly() {
    let mut room = TestRoom::new();
    let err = room
        .join_with_devices(
            TestParticipant::new("alice"),
            SyntheticDevices::new().with_camera(DeviceAvailability::Denied),
        )
        .await
        .unwrap_err();

    let err = err.downcast::<CallError>().unwrap();
    assert!(matches!(err, CallError::MediaAcquisition(_)));
    assert_eq!(
        err.user_message().as_deref(),
        Some("Camera or microphone access was denied")
    );
    assert_eq!(room.hub().endpoint_count(), 0);
    assert_eq!(room.directory().register_calls(), 0);
    assert!(room.members().is_empty());
}

#[tokio::test]
async fn test_missing_microphone_fails_join() {
    let mut room = TestRoom::new();
    let err = room
        .join_with_devices(
            TestParticipant::new("alice"),
            SyntheticDevices::new().with_microphone(DeviceAvailability::Missing),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast::<CallError>().unwrap(),
        CallError::MediaAcquisition(_)
    ));
    assert_eq!(room.hub().endpoint_count(), 0);
}

#[tokio::test]
async fn test_directory_outage_releases_media_and_endpoint() {
    let mut room = TestRoom::new();
    room.directory().fail_next_registrations(100);
    let devices = SyntheticDevices::new();

    let err = room
        .join_with_devices(TestParticipant::new("alice"), devices)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast::<CallError>().unwrap(),
        CallError::DirectoryUnavailable(_)
    ));

    assert_eq!(
        room.directory().register_calls(),
        fast_engine_config().register_attempts as usize
    );
    assert_eq!(room.hub().endpoint_count(), 0);
    assert!(room.directory().entries(room.room_id()).is_empty());
}

#[tokio::test]
async fn test_flaky_directory_join_succeeds_after_retry() {
    let mut room = TestRoom::new();
    room.directory().fail_next_registrations(2);

    let alice = room.join(TestParticipant::new("alice")).await.unwrap();
    assert_eq!(room.directory().register_calls(), 3);
    assert_eq!(room.directory().entries(room.room_id()).len(), 1);
    assert!(alice.is_live());

    room.stop_all().await;
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_stop_releases_everything_once() {
    let mut room = TestRoom::new();
    let alice = room.join(TestParticipant::new("alice")).await.unwrap();
    let bob = room.join(TestParticipant::new("bob")).await.unwrap();
    room.wait_for_full_mesh().await.unwrap();
    alice.start_share().await.unwrap();
    let mut events = alice.subscribe();

    alice.stop().await.unwrap();
    alice.stop().await.unwrap();
    assert!(!alice.is_live());

    let devices = room.devices("alice");
    for kind in [TrackKind::Audio, TrackKind::Video, TrackKind::Screen] {
        assert_eq!(devices.live_tracks(kind), 0, "{kind:?} still live");
    }
    assert_eq!(room.directory().deregister_calls(), 1);
    assert!(room
        .directory()
        .entries(room.room_id())
        .iter()
        .all(|e| e.participant_id != "alice"));
    assert_eq!(room.hub().endpoint_count(), 1);

    let mut ended = 0;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Ended { reason } = event {
            assert_eq!(reason, EndReason::Left);
            ended += 1;
        }
    }
    assert_eq!(ended, 1);

    // The remaining peer notices and drops the link
    assert_eventually(ConsistencyCategory::Teardown, || async {
        let snapshot = bob.snapshot().await.unwrap();
        snapshot.connected().count() == 0 && snapshot.presenter.is_none()
    })
    .await
    .unwrap();
    assert_eq!(room.hub().connection_count(), 0);

    room.stop_all().await;
}

#[tokio::test]
async fn test_stop_during_pending_dial() {
    let config = EngineConfig {
        dial_timeout: Duration::from_secs(30),
        ..fast_engine_config()
    };
    let mut room = TestRoom::with_config(config);
    let alice = room.join(TestParticipant::new("alice")).await.unwrap();

    // An endpoint that never answers
    let mut silent = room.hub().open_endpoint("silent").await.unwrap();
    room.directory().insert(
        room.room_id(),
        DirectoryEntry {
            participant_id: "silent".to_string(),
            display_name: "Silent".to_string(),
            link_address: Some(silent.address.clone()),
        },
    );
    let offer = silent.incoming.recv().await.unwrap();
    assert_eq!(&offer.remote, alice.link_address());
    let phase = alice
        .snapshot()
        .await
        .unwrap()
        .feeds
        .into_iter()
        .find(|f| f.link_address == silent.address)
        .map(|f| f.phase);
    assert_eq!(phase, Some(ConnectionPhase::Dialing));

    tokio::time::timeout(Duration::from_secs(1), alice.stop())
        .await
        .expect("stop must not wait for the pending dial")
        .unwrap();

    // Answering the abandoned dial establishes nothing
    assert!(room.hub().answer(offer, &bundle()).await.is_err());
    assert_eq!(room.hub().connection_count(), 0);
    assert!(room
        .directory()
        .entries(room.room_id())
        .iter()
        .all(|e| e.participant_id == "silent"));
    assert_eq!(room.devices("alice").live_tracks(TrackKind::Video), 0);

    room.stop_all().await;
}

#[tokio::test]
async fn test_stop_right_after_answer_closes_remote_side() {
    // Repeat to cover every interleaving of the settled dial and the stop
    for _ in 0..20 {
        let mut room = TestRoom::new();
        let alice = room.join(TestParticipant::new("alice")).await.unwrap();

        let mut remote = room.hub().open_endpoint("remote").await.unwrap();
        room.directory().insert(
            room.room_id(),
            DirectoryEntry {
                participant_id: "remote".to_string(),
                display_name: "Remote".to_string(),
                link_address: Some(remote.address.clone()),
            },
        );
        let offer = remote.incoming.recv().await.unwrap();
        let mut answered = room.hub().answer(offer, &bundle()).await.unwrap();

        alice.stop().await.unwrap();

        let closed = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                match answered.events.recv().await {
                    Some(LinkEvent::Closed) | None => return,
                    Some(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "remote side never saw the link close");
        assert_eq!(room.hub().connection_count(), 0);

        room.stop_all().await;
    }
}

#[tokio::test]
async fn test_stop_declines_queued_inbound_dials() {
    let mut room = TestRoom::new();
    let alice = room.join(TestParticipant::new("alice")).await.unwrap();
    let caller = room.hub().open_endpoint("caller").await.unwrap();

    alice.stop().await.unwrap();

    // The endpoint is gone, so new dials fail fast
    let result = room
        .hub()
        .dial(&caller.address, alice.link_address(), &bundle())
        .await;
    assert!(result.is_err());
    assert_eq!(room.hub().connection_count(), 0);

    room.stop_all().await;
}

#[tokio::test]
async fn test_stop_all_cleans_up_full_mesh() {
    let mut room = TestRoom::new();
    for id in ["alice", "bob", "carol", "dave"] {
        room.join(TestParticipant::new(id)).await.unwrap();
    }
    room.wait_for_full_mesh().await.unwrap();
    assert_eq!(room.hub().connection_count(), 6);

    room.stop_all().await;

    assert_eq!(room.hub().connection_count(), 0);
    assert_eq!(room.hub().endpoint_count(), 0);
    assert!(room.directory().entries(room.room_id()).is_empty());
    assert!(room.members().iter().all(|m| m.is_finished()));
    for id in ["alice", "bob", "carol", "dave"] {
        let devices = room.devices(id);
        assert_eq!(devices.live_tracks(TrackKind::Audio), 0);
        assert_eq!(devices.live_tracks(TrackKind::Video), 0);
    }
}

#[tokio::test]
async fn test_handle_survives_session_end() {
    let mut room = TestRoom::new();
    let alice = room.join(TestParticipant::new("alice")).await.unwrap();
    room.stop_all().await;

    assert!(matches!(alice.toggle_audio().await, Err(CallError::SessionEnded)));
    assert!(matches!(alice.snapshot().await, Err(CallError::SessionEnded)));
    alice.stop().await.unwrap();
}

fn bundle() -> call_engine::media::MediaBundle {
    use call_engine::media::{MediaBundle, MediaTrack};
    MediaBundle {
        audio: MediaTrack::new(TrackKind::Audio),
        video: MediaTrack::new(TrackKind::Video),
    }
}
