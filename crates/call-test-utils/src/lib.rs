//! # Call Test Utilities
//!
//! Shared test utilities for the call engine.
//!
//! This crate provides:
//! - Multi-session harness (`TestRoom`): N sessions sharing one in-memory
//!   directory and one loopback link hub, each with its own synthetic devices
//! - Participant fixtures (`TestParticipant`) and a fast `EngineConfig`
//! - Polling assertions for asynchronous mesh behavior (`assert_eventually`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let mut room = TestRoom::new();
//!     room.join(TestParticipant::new("alice")).await?;
//!     room.join(TestParticipant::new("bob")).await?;
//!
//!     room.wait_for_full_mesh().await.expect("mesh should form");
//!     room.stop_all().await;
//!     Ok(())
//! }
//! ```

pub mod eventual;
pub mod fixtures;
pub mod harness;

// Re-export commonly used items
pub use eventual::{assert_eventually, ConsistencyCategory};
pub use fixtures::{fast_engine_config, TestParticipant};
pub use harness::{RoomMember, TestRoom};
