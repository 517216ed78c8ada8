//! Integration tests for the meeting clock.
//!
//! Run with a paused tokio clock; timers auto-advance whenever every task is
//! idle, so a five-second meeting finishes instantly.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use call_engine::actors::{EndReason, SessionEvent};
use call_engine::clock::ClockPhase;
use call_engine::config::EngineConfig;
use call_engine::errors::CallError;
use call_test_utils::{
    assert_eventually, fast_engine_config, ConsistencyCategory, TestParticipant, TestRoom,
};
use tokio::sync::broadcast;

/// Fast links, but fewer discovery ticks over long virtual runs.
fn clock_room() -> TestRoom {
    TestRoom::with_config(EngineConfig {
        discovery_interval: Duration::from_millis(500),
        ..fast_engine_config()
    })
}

/// Drain everything buffered so far.
fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

async fn wait_for_end(events: &mut broadcast::Receiver<SessionEvent>) -> EndReason {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Ok(SessionEvent::Ended { reason }) = events.recv().await {
                return reason;
            }
        }
    })
    .await
    .expect("session should end")
}

#[tokio::test(start_paused = true)]
async fn test_time_limit_ends_every_session() {
    let mut room = clock_room();
    let host = room
        .join(
            TestParticipant::new("host")
                .host()
                .with_budget(5)
                .with_meeting("meeting-1"),
        )
        .await
        .unwrap();
    let guest = room
        .join(TestParticipant::new("guest").with_budget(5))
        .await
        .unwrap();
    let mut host_events = host.subscribe();
    let mut guest_events = guest.subscribe();

    assert_eq!(wait_for_end(&mut host_events).await, EndReason::TimeLimit);
    assert_eq!(wait_for_end(&mut guest_events).await, EndReason::TimeLimit);
    assert!(!host.is_live());
    assert!(!guest.is_live());

    // Reaching zero is final
    assert!(matches!(host.extend(10).await, Err(CallError::SessionEnded)));
    assert!(matches!(
        host.start_share().await,
        Err(CallError::SessionEnded)
    ));

    // Only the host writes the completion record
    let completions = room.records().completions();
    assert_eq!(completions.len(), 1);
    let record = completions.first().unwrap();
    assert_eq!(record.id, "meeting-1");
    assert_eq!(record.actual_duration_minutes, 1);

    assert!(room.directory().entries(room.room_id()).is_empty());
    assert_eq!(room.hub().connection_count(), 0);
    assert_eq!(room.hub().endpoint_count(), 0);

    room.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_warning_fires_once_per_extension() {
    let mut room = clock_room();
    let host = room
        .join(
            TestParticipant::new("host")
                .host()
                .with_budget(301)
                .with_meeting("meeting-1"),
        )
        .await
        .unwrap();
    let guest = room
        .join(TestParticipant::new("guest").with_budget(301))
        .await
        .unwrap();
    let mut host_events = host.subscribe();
    let mut guest_events = guest.subscribe();

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    let warnings: Vec<u64> = drain(&mut host_events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::TimeWarning { remaining_seconds } => Some(remaining_seconds),
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec![300]);

    let snapshot = host.snapshot().await.unwrap();
    assert_eq!(snapshot.clock.phase, ClockPhase::WarningIssued);
    assert!(snapshot.clock.warning_fired);
    assert_eq!(snapshot.clock.remaining_seconds, Some(291));

    // Guests count down but never warn
    assert!(!drain(&mut guest_events)
        .iter()
        .any(|e| matches!(e, SessionEvent::TimeWarning { .. })));
    assert!(matches!(
        guest.extend(5).await,
        Err(CallError::PermissionDenied(_))
    ));

    // 301s + 5min rounds up to 11 minutes
    assert_eq!(host.extend(5).await.unwrap(), 11);
    let snapshot = host.snapshot().await.unwrap();
    assert_eq!(snapshot.clock.phase, ClockPhase::Running);
    assert!(!snapshot.clock.warning_fired);
    assert_eventually(ConsistencyCategory::StateSync, || async {
        room.records()
            .duration_updates()
            .iter()
            .any(|u| u.id == "meeting-1" && u.duration_minutes == 11)
    })
    .await
    .unwrap();

    // Re-armed: fires again once 300s remain
    tokio::time::sleep(Duration::from_secs(295)).await;
    let warnings = drain(&mut host_events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::TimeWarning { .. }))
        .count();
    assert_eq!(warnings, 1);
    assert!(host.is_live());

    room.stop_all().await;
    assert_eq!(room.records().completions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_meeting_never_expires() {
    let mut room = clock_room();
    let host = room
        .join(TestParticipant::new("host").host())
        .await
        .unwrap();
    let mut events = host.subscribe();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(host.is_live());
    assert!(drain(&mut events)
        .iter()
        .all(|e| !matches!(e, SessionEvent::TimeWarning { .. } | SessionEvent::Ended { .. })));

    let snapshot = host.snapshot().await.unwrap();
    assert_eq!(snapshot.clock.remaining_seconds, None);
    assert!(snapshot.clock.elapsed_seconds >= 119);
    assert!(matches!(
        host.extend(5).await,
        Err(CallError::InvalidRequest(_))
    ));

    room.stop_all().await;
}
