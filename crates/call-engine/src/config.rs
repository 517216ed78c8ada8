//! Call engine configuration.
//!
//! Configuration is loaded from environment variables. Engine timings are
//! grouped in [`EngineConfig`], which tests construct directly.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP timeout for directory and meeting-record calls.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Default discovery poll interval.
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 2_000;

/// Default number of registration attempts before setup fails.
pub const DEFAULT_REGISTER_ATTEMPTS: u32 = 3;

/// Default denylist entry lifetime. Zero means entries never expire.
pub const DEFAULT_DENYLIST_TTL_SECONDS: u64 = 30;

/// Default host warning threshold before expiry.
pub const DEFAULT_WARNING_THRESHOLD_SECONDS: u64 = 300;

/// Default delay before the first `track-update` notification.
pub const DEFAULT_TRACK_UPDATE_DELAY_MS: u64 = 500;

/// Default delay before the `track-update` resend.
pub const DEFAULT_TRACK_UPDATE_RESEND_MS: u64 = 1_000;

/// Default bound on a single peer's track replacement.
pub const DEFAULT_TRACK_REPLACE_TIMEOUT_MS: u64 = 5_000;

/// Default bound on an outgoing dial.
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 10_000;

/// Default number of loopback participants the developer binary starts.
pub const DEFAULT_LOCAL_PARTICIPANTS: usize = 2;

/// Base delay for registration retry backoff.
pub const REGISTER_BACKOFF_BASE_MS: u64 = 200;

/// Timings and limits used by a running session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between roster fetches.
    pub discovery_interval: Duration,

    /// Registration attempts before `DirectoryUnavailable` (minimum 1).
    pub register_attempts: u32,

    /// Base delay for registration backoff, doubled per attempt.
    pub register_backoff: Duration,

    /// Lifetime of a denylist entry. `None` keeps entries for the whole session.
    pub denylist_ttl: Option<Duration>,

    /// Remaining-time threshold for the host warning, in seconds.
    pub warning_threshold_seconds: u64,

    /// Delay before the first `track-update` notification.
    pub track_update_delay: Duration,

    /// Delay between the first `track-update` and its resend.
    pub track_update_resend: Duration,

    /// Bound on a single peer's track replacement.
    pub track_replace_timeout: Duration,

    /// Bound on an outgoing dial.
    pub dial_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_millis(DEFAULT_DISCOVERY_INTERVAL_MS),
            register_attempts: DEFAULT_REGISTER_ATTEMPTS,
            register_backoff: Duration::from_millis(REGISTER_BACKOFF_BASE_MS),
            denylist_ttl: ttl_from_seconds(DEFAULT_DENYLIST_TTL_SECONDS),
            warning_threshold_seconds: DEFAULT_WARNING_THRESHOLD_SECONDS,
            track_update_delay: Duration::from_millis(DEFAULT_TRACK_UPDATE_DELAY_MS),
            track_update_resend: Duration::from_millis(DEFAULT_TRACK_UPDATE_RESEND_MS),
            track_replace_timeout: Duration::from_millis(DEFAULT_TRACK_REPLACE_TIMEOUT_MS),
            dial_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
        }
    }
}

fn ttl_from_seconds(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the signaling directory.
    pub directory_url: String,

    /// Base URL of the meeting-record service, if records are kept.
    pub meeting_records_url: Option<String>,

    /// Timeout for every HTTP call.
    pub http_timeout: Duration,

    /// Session timings.
    pub engine: EngineConfig,

    /// Room the developer binary joins (generated when unset).
    pub room_id: String,

    /// Loopback participants started by the developer binary.
    pub local_participants: usize,

    /// Duration budget for the developer binary's sessions (0 = unlimited).
    pub duration_seconds: u64,

    /// Meeting record id for the developer binary's host session.
    pub meeting_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let directory_url = vars
            .get("CALL_DIRECTORY_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("CALL_DIRECTORY_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let meeting_records_url = vars
            .get("CALL_MEETING_RECORDS_URL")
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches('/').to_string());

        let http_timeout_ms = parse_or(vars, "CALL_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS)?;
        let discovery_interval_ms = parse_or(
            vars,
            "CALL_DISCOVERY_INTERVAL_MS",
            DEFAULT_DISCOVERY_INTERVAL_MS,
        )?;
        if discovery_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "CALL_DISCOVERY_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        let register_attempts: u32 =
            parse_or(vars, "CALL_REGISTER_ATTEMPTS", DEFAULT_REGISTER_ATTEMPTS)?;
        if register_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "CALL_REGISTER_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let denylist_ttl_seconds = parse_or(
            vars,
            "CALL_DENYLIST_TTL_SECONDS",
            DEFAULT_DENYLIST_TTL_SECONDS,
        )?;
        let warning_threshold_seconds = parse_or(
            vars,
            "CALL_WARNING_THRESHOLD_SECONDS",
            DEFAULT_WARNING_THRESHOLD_SECONDS,
        )?;
        let track_update_delay_ms = parse_or(
            vars,
            "CALL_TRACK_UPDATE_DELAY_MS",
            DEFAULT_TRACK_UPDATE_DELAY_MS,
        )?;
        let track_update_resend_ms = parse_or(
            vars,
            "CALL_TRACK_UPDATE_RESEND_MS",
            DEFAULT_TRACK_UPDATE_RESEND_MS,
        )?;
        let track_replace_timeout_ms = parse_or(
            vars,
            "CALL_TRACK_REPLACE_TIMEOUT_MS",
            DEFAULT_TRACK_REPLACE_TIMEOUT_MS,
        )?;
        let dial_timeout_ms = parse_or(vars, "CALL_DIAL_TIMEOUT_MS", DEFAULT_DIAL_TIMEOUT_MS)?;

        // Developer binary settings
        let room_id = vars.get("CALL_ROOM_ID").cloned().unwrap_or_else(|| {
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("room-{short_suffix}")
        });
        let local_participants = parse_or(
            vars,
            "CALL_LOCAL_PARTICIPANTS",
            DEFAULT_LOCAL_PARTICIPANTS,
        )?;
        let duration_seconds = parse_or(vars, "CALL_DURATION_SECONDS", 0)?;
        let meeting_id = vars.get("CALL_MEETING_ID").filter(|s| !s.is_empty()).cloned();

        Ok(Config {
            directory_url,
            meeting_records_url,
            http_timeout: Duration::from_millis(http_timeout_ms),
            engine: EngineConfig {
                discovery_interval: Duration::from_millis(discovery_interval_ms),
                register_attempts,
                register_backoff: Duration::from_millis(REGISTER_BACKOFF_BASE_MS),
                denylist_ttl: ttl_from_seconds(denylist_ttl_seconds),
                warning_threshold_seconds,
                track_update_delay: Duration::from_millis(track_update_delay_ms),
                track_update_resend: Duration::from_millis(track_update_resend_ms),
                track_replace_timeout: Duration::from_millis(track_replace_timeout_ms),
                dial_timeout: Duration::from_millis(dial_timeout_ms),
            },
            room_id,
            local_participants,
            duration_seconds,
            meeting_id,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}
