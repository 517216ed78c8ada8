//! Actor model implementation for the call engine.
//!
//! ```text
//! SessionActor (one per joined room)
//! ├── owns connections, roster, participant states, denylist, chat, clock
//! ├── spawns roster fetches, dials, answers and timers as tasks
//! └── supervises N ConnectionActors
//!     └── ConnectionActor (one per established peer link)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single dispatcher**: Link events, roster results and timers all arrive
//!   as `EngineEvent`s on one channel handled by the session actor
//! - **CancellationToken propagation**: Connection actors and spawned tasks
//!   observe the session token, so late completions never touch session state
//! - **Stale events are dropped**: every event carries the connection id it was
//!   produced for
//!
//! # Modules
//!
//! - [`session`] - `SessionActor` and its handle
//! - [`connection`] - `ConnectionActor` per peer link
//! - [`messages`] - Message and event types

pub mod connection;
pub mod messages;
pub mod session;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionHandle};
pub use messages::*;
pub use session::{SessionActor, SessionDeps, SessionHandle, SessionParams};
