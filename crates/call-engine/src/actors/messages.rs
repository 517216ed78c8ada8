//! Message types for actor communication.
//!
//! Callers reach the session through [`SessionMessage`] with `oneshot` replies.
//! Everything that happens off the actor task (roster fetches, dials, link
//! events, timers) comes back as an [`EngineEvent`] on one internal channel,
//! so the session actor is the single dispatcher.

use crate::chat::ChatMessage;
use crate::directory::{DirectoryEntry, DirectoryError};
use crate::errors::CallError;
use crate::link::{EstablishedLink, LinkAddress, LinkError};
use crate::media::{MediaStream, MediaTrack};
use crate::protocol::DataFrame;
use crate::state::ParticipantState;
use crate::view::SessionSnapshot;
use std::fmt;
use tokio::sync::oneshot;

/// Messages sent to `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Flip the local audio flag. Replies with the new value.
    ToggleAudio {
        respond_to: oneshot::Sender<Result<bool, CallError>>,
    },

    /// Flip the local video flag. Replies with the new value.
    ToggleVideo {
        respond_to: oneshot::Sender<Result<bool, CallError>>,
    },

    StartShare {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    StopShare {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Send a chat message. Replies with the locally echoed message.
    SendChat {
        text: String,
        respond_to: oneshot::Sender<Result<ChatMessage, CallError>>,
    },

    SetChatVisible {
        visible: bool,
    },

    /// Host-only. Replies with the new total duration in minutes.
    Extend {
        minutes: u64,
        respond_to: oneshot::Sender<Result<u64, CallError>>,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },

    Stop {
        reason: EndReason,
        respond_to: oneshot::Sender<()>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Send a frame over the data link.
    Send { frame: DataFrame },

    /// Swap the outgoing video track.
    ReplaceTrack {
        track: MediaTrack,
        respond_to: oneshot::Sender<Result<(), LinkError>>,
    },
}

/// Internal events, all handled on the session actor.
#[derive(Debug)]
pub enum EngineEvent {
    /// A roster fetch finished.
    Roster(Result<Vec<DirectoryEntry>, DirectoryError>),

    /// A dial or answer finished.
    LinkSettled {
        address: LinkAddress,
        attempt: u64,
        result: Result<EstablishedLink, LinkError>,
    },

    /// The connection actor is running and the remote media is available.
    MediaReceived {
        address: LinkAddress,
        connection_id: u64,
        stream: MediaStream,
    },

    DataLinkOpened {
        address: LinkAddress,
        connection_id: u64,
    },

    DataMessage {
        address: LinkAddress,
        connection_id: u64,
        frame: DataFrame,
    },

    /// Normal close by the remote side.
    LinkClosed {
        address: LinkAddress,
        connection_id: u64,
    },

    LinkError {
        address: LinkAddress,
        connection_id: u64,
        error: LinkError,
    },

    /// A scheduled `track-update` notification is due.
    TrackUpdateDue { epoch: u64, attempt: u8 },

    /// The screen track ended outside the engine.
    ScreenEnded { epoch: u64 },
}

/// Events published to subscribers (the rendering layer).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerConnected {
        link_address: LinkAddress,
        stream: MediaStream,
    },
    PeerDisconnected {
        link_address: LinkAddress,
    },
    ParticipantStateChanged(ParticipantState),
    /// Rebind the video sink to the freshest track on this stream.
    RebindVideo {
        link_address: LinkAddress,
        stream: MediaStream,
    },
    ChatReceived(ChatMessage),
    /// Host only.
    TimeWarning {
        remaining_seconds: u64,
    },
    /// The local share stopped without a `stop_share` call.
    ShareEnded,
    /// Terminal fault, surfaced once.
    Error {
        message: String,
    },
    Ended {
        reason: EndReason,
    },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Which side dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Lifecycle of one Connection.
///
/// `Failed` and `Closed` are terminal. A Connection reaching either is
/// removed from the table at once, so snapshots never report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Address known, no link attempt.
    Discovered,
    Dialing,
    Connected,
    Failed,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `stop()` was called.
    Left,
    /// The meeting clock expired.
    TimeLimit,
}

impl EndReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EndReason::Left => "left",
            EndReason::TimeLimit => "time-limit",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
