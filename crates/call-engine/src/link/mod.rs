//! Link primitive seam.
//!
//! A link is an unreliable async handshake that yields a bidirectional media
//! channel plus an ordered, reliable data link between two endpoints. The
//! engine only sees the traits below; [`memory::MemoryLinkHub`] is the
//! in-process implementation.

pub mod memory;

pub use memory::MemoryLinkHub;

use crate::media::{MediaBundle, MediaStream, MediaTrack};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque, session-scoped address of a link endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkAddress(String);

impl LinkAddress {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LinkAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Link failures, classified by how the engine reacts to them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Remote endpoint is not registered or has gone away.
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    /// Remote endpoint refused the dial.
    #[error("Dial declined by peer")]
    Declined,

    /// Handshake did not complete in time.
    #[error("Link operation timed out")]
    Timeout,

    /// Momentary network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Signaling backend failure. Not retried.
    #[error("Signaling server error: {0}")]
    Server(String),

    /// The link was closed normally.
    #[error("Link closed")]
    Closed,
}

impl LinkError {
    /// Expected peer churn: absorbed silently and denylisted.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::PeerUnavailable(_)
                | LinkError::Declined
                | LinkError::Timeout
                | LinkError::Network(_)
        )
    }

    /// Backend failure surfaced once to the user.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkError::Server(_))
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            LinkError::PeerUnavailable(_) => "peer_unavailable",
            LinkError::Declined => "declined",
            LinkError::Timeout => "timeout",
            LinkError::Network(_) => "network",
            LinkError::Server(_) => "server",
            LinkError::Closed => "closed",
        }
    }
}

/// Events delivered per established link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// One data-link frame, in send order.
    Data(Bytes),
    /// The remote side closed the link.
    Closed,
    /// The link failed.
    Error(LinkError),
}

/// Outgoing media half of an established link.
#[async_trait]
pub trait MediaChannel: Send + Sync {
    /// Swap the outgoing video track. The previous track is no longer sent.
    async fn replace_video_track(&self, track: MediaTrack) -> Result<(), LinkError>;

    /// Video track currently being sent.
    fn outgoing_video(&self) -> Option<MediaTrack>;

    /// Tear the link down. Idempotent.
    async fn close(&self);
}

/// Ordered, reliable side channel.
#[async_trait]
pub trait DataLink: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<(), LinkError>;

    async fn close(&self);
}

/// A link that finished its handshake.
pub struct EstablishedLink {
    pub remote: LinkAddress,
    pub media: Arc<dyn MediaChannel>,
    /// What the remote side is sending, always the freshest track.
    pub remote_stream: MediaStream,
    pub events: mpsc::Receiver<LinkEvent>,
}

impl fmt::Debug for EstablishedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedLink")
            .field("remote", &self.remote)
            .field("remote_stream", &self.remote_stream)
            .finish_non_exhaustive()
    }
}

/// An inbound dial awaiting `answer` or `decline`.
pub struct IncomingLink {
    pub remote: LinkAddress,
    pub local: LinkAddress,
    /// Implementation-specific handshake state.
    pub payload: Box<dyn Any + Send>,
}

impl fmt::Debug for IncomingLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingLink")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// A local endpoint and its stream of inbound dials.
#[derive(Debug)]
pub struct LocalEndpoint {
    pub address: LinkAddress,
    pub incoming: mpsc::Receiver<IncomingLink>,
}

/// Transport able to connect two endpoints.
#[async_trait]
pub trait LinkPrimitive: Send + Sync {
    async fn open_endpoint(&self, participant_id: &str) -> Result<LocalEndpoint, LinkError>;

    async fn dial(
        &self,
        local: &LinkAddress,
        remote: &LinkAddress,
        media: &MediaBundle,
    ) -> Result<EstablishedLink, LinkError>;

    async fn answer(
        &self,
        incoming: IncomingLink,
        media: &MediaBundle,
    ) -> Result<EstablishedLink, LinkError>;

    async fn decline(&self, incoming: IncomingLink);

    async fn open_data_link(
        &self,
        local: &LinkAddress,
        remote: &LinkAddress,
    ) -> Result<Arc<dyn DataLink>, LinkError>;

    async fn close_endpoint(&self, local: &LinkAddress);
}
