//! Call engine error types.
//!
//! Only setup faults and screen-share faults carry a user-facing message.
//! Peer churn never reaches the user; it is logged and absorbed per Connection.

use crate::directory::DirectoryError;
use crate::media::MediaError;
use thiserror::Error;

/// Engine-level error type returned by [`crate::actors::SessionHandle`] operations.
#[derive(Debug, Error)]
pub enum CallError {
    /// Local capture devices are unavailable or access was denied at start.
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(MediaError),

    /// The signaling directory could not be reached to register the session.
    #[error("Signaling directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The link primitive could not open a local endpoint.
    #[error("Link endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    /// The user refused the screen-capture prompt.
    #[error("Screen capture denied")]
    ScreenCaptureDenied,

    /// No screen-capture source exists on this platform.
    #[error("Screen capture unavailable")]
    ScreenCaptureUnavailable,

    /// Operation restricted to the meeting host.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Request arguments are not acceptable in the current state.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The session has already ended.
    #[error("Session has ended")]
    SessionEnded,

    /// Setup was cancelled before the session went live.
    #[error("Session setup cancelled")]
    Cancelled,

    /// Internal plumbing failure (closed channel, dropped responder).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Message suitable for showing to the local user, if this fault is user-visible.
    ///
    /// Returns `None` for faults that are logged but never surfaced.
    #[must_use]
    pub fn user_message(&self) -> Option<String> {
        match self {
            CallError::MediaAcquisition(MediaError::Denied(_)) => {
                Some("Camera or microphone access was denied".to_string())
            }
            CallError::MediaAcquisition(MediaError::Unavailable(_)) => {
                Some("No camera or microphone is available".to_string())
            }
            CallError::DirectoryUnavailable(_) | CallError::EndpointUnavailable(_) => {
                Some("Could not join the call, please try again".to_string())
            }
            CallError::ScreenCaptureDenied => Some("Screen sharing was not allowed".to_string()),
            CallError::ScreenCaptureUnavailable => {
                Some("Screen sharing is not available on this device".to_string())
            }
            CallError::PermissionDenied(msg) | CallError::InvalidRequest(msg) => Some(msg.clone()),
            CallError::SessionEnded
            | CallError::Cancelled
            | CallError::Internal(_) => None,
        }
    }

    /// Map a screen-capture failure onto the share-specific variants.
    #[must_use]
    pub fn from_screen_capture(err: MediaError) -> Self {
        match err {
            MediaError::Denied(_) => CallError::ScreenCaptureDenied,
            MediaError::Unavailable(_) => CallError::ScreenCaptureUnavailable,
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        CallError::MediaAcquisition(err)
    }
}

impl From<DirectoryError> for CallError {
    fn from(err: DirectoryError) -> Self {
        CallError::DirectoryUnavailable(err.to_string())
    }
}
