//! Observability for the call engine.
//!
//! Logging uses `tracing` with per-component targets:
//!
//! | Target | Component |
//! |--------|-----------|
//! | `call.session` | Session actor: discovery, state sync, share, chat, clock |
//! | `call.connection` | Per-peer connection actors |
//! | `call.directory` | Signaling directory client |
//! | `call.link` | Link primitive implementations |
//! | `call.records` | Meeting record client |
//!
//! Peer identities and link addresses are logged; chat text never is.

pub mod metrics;
