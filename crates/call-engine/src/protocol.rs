//! Data-link wire protocol.
//!
//! JSON text frames. Control frames carry a `type` field:
//!
//! ```text
//! {"type":"state","senderId":..,"linkAddress":..,"audioEnabled":..,"videoEnabled":..,"screenSharing":..}
//! {"type":"track-update","senderId":..,"linkAddress":..}
//! ```
//!
//! Any untyped frame with the chat shape is a chat message.

use crate::chat::ChatMessage;
use crate::link::LinkAddress;
use crate::state::ParticipantState;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender's full media state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFrame {
    pub sender_id: String,
    pub link_address: LinkAddress,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

impl From<StateFrame> for ParticipantState {
    fn from(frame: StateFrame) -> Self {
        ParticipantState {
            participant_id: frame.sender_id,
            link_address: frame.link_address,
            audio_enabled: frame.audio_enabled,
            video_enabled: frame.video_enabled,
            screen_sharing: frame.screen_sharing,
        }
    }
}

impl From<&ParticipantState> for StateFrame {
    fn from(state: &ParticipantState) -> Self {
        StateFrame {
            sender_id: state.participant_id.clone(),
            link_address: state.link_address.clone(),
            audio_enabled: state.audio_enabled,
            video_enabled: state.video_enabled,
            screen_sharing: state.screen_sharing,
        }
    }
}

/// Instructs the receiver to rebind its video sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackUpdateFrame {
    pub sender_id: String,
    pub link_address: LinkAddress,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ControlFrame {
    State(StateFrame),
    TrackUpdate(TrackUpdateFrame),
}

/// Every frame the data link carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    State(StateFrame),
    TrackUpdate(TrackUpdateFrame),
    Chat(ChatMessage),
}

impl DataFrame {
    /// Label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            DataFrame::State(_) => "state",
            DataFrame::TrackUpdate(_) => "track_update",
            DataFrame::Chat(_) => "chat",
        }
    }
}

/// Malformed data-link payloads. Dropped, never fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Unknown control frame type: {0}")]
    UnknownType(String),

    #[error("Frame does not match any known shape: {0}")]
    Malformed(String),

    #[error("Frame could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Serialize a frame for the data link.
pub fn encode(frame: &DataFrame) -> Result<Bytes, ProtocolError> {
    let bytes = match frame {
        DataFrame::State(state) => serde_json::to_vec(&ControlFrame::State(state.clone())),
        DataFrame::TrackUpdate(update) => {
            serde_json::to_vec(&ControlFrame::TrackUpdate(update.clone()))
        }
        DataFrame::Chat(message) => serde_json::to_vec(message),
    }
    .map_err(ProtocolError::Encode)?;
    Ok(Bytes::from(bytes))
}

/// Parse one data-link frame.
pub fn decode(bytes: &[u8]) -> Result<DataFrame, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(ProtocolError::InvalidJson)?;

    match value.get("type") {
        Some(serde_json::Value::String(kind)) if kind == "state" || kind == "track-update" => {
            let control: ControlFrame = serde_json::from_value(value)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            Ok(match control {
                ControlFrame::State(state) => DataFrame::State(state),
                ControlFrame::TrackUpdate(update) => DataFrame::TrackUpdate(update),
            })
        }
        Some(other) => Err(ProtocolError::UnknownType(match other {
            serde_json::Value::String(s) => s.clone(),
            v => v.to_string(),
        })),
        None => serde_json::from_value::<ChatMessage>(value)
            .map(DataFrame::Chat)
            .map_err(|e| ProtocolError::Malformed(e.to_string())),
    }
}
