//! Multi-session room harness.
//!
//! Every member of a `TestRoom` shares one in-memory directory, one loopback
//! link hub and one meeting-record store, and owns its own synthetic devices.
//! Sessions run under a room-wide cancellation token so a dropped room never
//! leaves actors behind.

use crate::eventual::{assert_eventually, ConsistencyCategory};
use crate::fixtures::{fast_engine_config, TestParticipant};
use call_engine::actors::{SessionActor, SessionDeps, SessionHandle};
use call_engine::config::EngineConfig;
use call_engine::directory::mock::MockDirectory;
use call_engine::link::MemoryLinkHub;
use call_engine::media::SyntheticDevices;
use call_engine::records::mock::MockMeetingRecords;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long `stop_all` waits for one session task.
const MEMBER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// One joined session.
pub struct RoomMember {
    /// Handle to the running session.
    pub handle: SessionHandle,
    /// The member's capture devices.
    pub devices: Arc<SyntheticDevices>,
    task: Option<JoinHandle<()>>,
}

impl RoomMember {
    /// True once the session task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// N sessions in one room.
pub struct TestRoom {
    room_id: String,
    directory: Arc<MockDirectory>,
    hub: MemoryLinkHub,
    records: Arc<MockMeetingRecords>,
    config: EngineConfig,
    shutdown: CancellationToken,
    members: Vec<RoomMember>,
}

impl TestRoom {
    /// Empty room using [`fast_engine_config`].
    pub fn new() -> Self {
        Self::with_config(fast_engine_config())
    }

    /// Empty room with explicit engine timings.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            room_id: format!("room-{}", uuid::Uuid::new_v4()),
            directory: Arc::new(MockDirectory::new()),
            hub: MemoryLinkHub::new(),
            records: Arc::new(MockMeetingRecords::new()),
            config,
            shutdown: CancellationToken::new(),
            members: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The shared directory.
    pub fn directory(&self) -> &Arc<MockDirectory> {
        &self.directory
    }

    /// The shared link hub.
    pub fn hub(&self) -> &MemoryLinkHub {
        &self.hub
    }

    /// The shared meeting-record store.
    pub fn records(&self) -> &Arc<MockMeetingRecords> {
        &self.records
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a session for `participant` with default devices.
    pub async fn join(&mut self, participant: TestParticipant) -> anyhow::Result<SessionHandle> {
        self.join_with_devices(participant, SyntheticDevices::new())
            .await
    }

    /// Start a session for `participant` with the given devices.
    pub async fn join_with_devices(
        &mut self,
        participant: TestParticipant,
        devices: SyntheticDevices,
    ) -> anyhow::Result<SessionHandle> {
        let devices = Arc::new(devices);
        let deps = SessionDeps {
            directory: self.directory.clone(),
            link: Arc::new(self.hub.clone()),
            devices: devices.clone(),
            records: Some(self.records.clone()),
        };

        let (handle, task) = SessionActor::start(
            participant.params(&self.room_id),
            deps,
            self.config.clone(),
            self.shutdown.child_token(),
        )
        .await?;

        self.members.push(RoomMember {
            handle: handle.clone(),
            devices,
            task: Some(task),
        });
        Ok(handle)
    }

    /// Member by participant id.
    pub fn member(&self, participant_id: &str) -> Option<&RoomMember> {
        self.members
            .iter()
            .find(|m| m.handle.participant_id() == participant_id)
    }

    /// Session handle by participant id.
    ///
    /// # Panics
    ///
    /// Panics if nobody with that id joined.
    pub fn handle(&self, participant_id: &str) -> SessionHandle {
        self.member(participant_id)
            .map(|m| m.handle.clone())
            .unwrap_or_else(|| panic!("no member {participant_id} in room"))
    }

    /// Devices by participant id.
    ///
    /// # Panics
    ///
    /// Panics if nobody with that id joined.
    pub fn devices(&self, participant_id: &str) -> Arc<SyntheticDevices> {
        self.member(participant_id)
            .map(|m| m.devices.clone())
            .unwrap_or_else(|| panic!("no member {participant_id} in room"))
    }

    pub fn members(&self) -> &[RoomMember] {
        &self.members
    }

    /// Wait until every live member is Connected to every other live member
    /// and has received each one's participant state.
    pub async fn wait_for_full_mesh(&self) -> Result<(), String> {
        let handles: Vec<SessionHandle> = self
            .members
            .iter()
            .map(|m| m.handle.clone())
            .filter(SessionHandle::is_live)
            .collect();
        let ids: Vec<String> = handles
            .iter()
            .map(|h| h.participant_id().to_string())
            .collect();

        assert_eventually(ConsistencyCategory::MeshFormation, || {
            let handles = handles.clone();
            let ids = ids.clone();
            async move {
                for handle in &handles {
                    let Ok(snapshot) = handle.snapshot().await else {
                        return false;
                    };
                    if snapshot.connected().count() != handles.len() - 1 {
                        return false;
                    }
                    let synced = ids
                        .iter()
                        .filter(|id| id.as_str() != handle.participant_id())
                        .all(|id| snapshot.state_of(id).is_some());
                    if !synced {
                        return false;
                    }
                }
                true
            }
        })
        .await
    }

    /// Stop every member and wait for the session tasks to exit.
    pub async fn stop_all(&mut self) {
        for member in &self.members {
            let _ = member.handle.stop().await;
        }
        for member in &mut self.members {
            if let Some(task) = member.task.take() {
                let _ = tokio::time::timeout(MEMBER_STOP_TIMEOUT, task).await;
            }
        }
    }
}

impl Default for TestRoom {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestRoom {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
