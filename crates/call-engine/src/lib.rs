//! Call Engine Library
//!
//! Full-mesh, peer-to-peer group call engine. Every participant holds a
//! direct link to every other participant; there is no media relay.
//!
//! - Discovery of peers through a room-scoped signaling directory
//! - Idempotent dial-or-skip mesh construction with glare resolution
//! - Media state synchronization over per-link data channels
//! - Screen-share track substitution with `track-update` notifications
//! - Text chat over the same data channels
//! - Host-controlled meeting clock with warning, extend and end
//!
//! # Architecture
//!
//! ```text
//! SessionHandle ──mpsc──> SessionActor ──> ConnectionActor (per peer link)
//!                              │                 │
//!                              │<──EngineEvent───┘
//!                              ├── SignalingDirectory (HTTP)
//!                              ├── LinkPrimitive (MemoryLinkHub in-process)
//!                              ├── MediaDevices
//!                              └── MeetingRecords (HTTP, optional)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Session and connection actors
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types with user-facing messages
//! - [`link`] - Link primitive seam and in-process hub
//! - [`media`] - Tracks, streams and capture devices
//! - [`protocol`] - Data-link wire format

pub mod actors;
pub mod chat;
pub mod clock;
pub mod config;
pub mod directory;
pub mod errors;
pub mod link;
pub mod media;
pub mod observability;
pub mod protocol;
pub mod records;
pub mod screen_share;
pub mod state;
pub mod view;
