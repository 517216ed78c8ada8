//! Pre-configured test data fixtures for call engine testing.

use call_engine::actors::SessionParams;
use call_engine::config::EngineConfig;
use std::time::Duration;

/// Engine timings scaled down for tests.
///
/// Discovery every 20ms, short backoff and track-update delays, denylist
/// entries that never expire unless a test sets a TTL.
#[must_use]
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        discovery_interval: Duration::from_millis(20),
        register_attempts: 3,
        register_backoff: Duration::from_millis(5),
        denylist_ttl: None,
        warning_threshold_seconds: 300,
        track_update_delay: Duration::from_millis(20),
        track_update_resend: Duration::from_millis(40),
        track_replace_timeout: Duration::from_millis(500),
        dial_timeout: Duration::from_millis(500),
    }
}

/// Test participant fixture.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    /// Participant ID.
    pub participant_id: String,
    /// Display name.
    pub display_name: String,
    /// Whether this participant hosts the meeting.
    pub is_host: bool,
    /// Meeting duration budget in seconds (0 = unlimited).
    pub duration_budget_seconds: u64,
    /// External meeting record ID.
    pub meeting_id: Option<String>,
}

impl TestParticipant {
    /// Create a non-host participant with no time limit.
    #[must_use]
    pub fn new(participant_id: impl Into<String>) -> Self {
        let participant_id = participant_id.into();
        Self {
            display_name: format!("Test {participant_id}"),
            participant_id,
            is_host: false,
            duration_budget_seconds: 0,
            meeting_id: None,
        }
    }

    /// Make this participant the host.
    #[must_use]
    pub fn host(mut self) -> Self {
        self.is_host = true;
        self
    }

    /// Set the duration budget.
    #[must_use]
    pub fn with_budget(mut self, seconds: u64) -> Self {
        self.duration_budget_seconds = seconds;
        self
    }

    /// Attach an external meeting record.
    #[must_use]
    pub fn with_meeting(mut self, meeting_id: impl Into<String>) -> Self {
        self.meeting_id = Some(meeting_id.into());
        self
    }

    /// Session parameters for `room_id`.
    #[must_use]
    pub fn params(&self, room_id: &str) -> SessionParams {
        SessionParams {
            room_id: room_id.to_string(),
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            duration_budget_seconds: self.duration_budget_seconds,
            is_host: self.is_host,
            meeting_id: self.meeting_id.clone(),
        }
    }
}
