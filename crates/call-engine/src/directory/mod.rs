//! Signaling directory client.
//!
//! The directory is a room-scoped registry mapping participant identity to a
//! link address. Every call is best-effort and idempotent.

pub mod http_client;

pub use http_client::HttpDirectory;

use crate::link::LinkAddress;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One participant as listed by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub participant_id: String,

    #[serde(default)]
    pub display_name: String,

    /// Absent until the participant has registered an endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_address: Option<LinkAddress>,
}

/// Body of `POST /participants`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub room_id: String,
    pub participant_id: String,
    pub link_address: LinkAddress,
    pub display_name: String,
}

/// Body of `GET /participants`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RosterResponse {
    #[serde(default)]
    pub participants: Vec<DirectoryEntry>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// Network failure or 5xx.
    #[error("Directory unreachable: {0}")]
    Unavailable(String),

    /// 4xx response.
    #[error("Directory rejected request with status {0}")]
    Rejected(u16),

    /// Body did not parse.
    #[error("Invalid directory response: {0}")]
    InvalidResponse(String),
}

/// Room registry consumed by the session.
#[async_trait]
pub trait SignalingDirectory: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<(), DirectoryError>;

    async fn roster(&self, room_id: &str) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    async fn deregister(&self, room_id: &str, participant_id: &str) -> Result<(), DirectoryError>;
}

/// In-memory directory for tests and the loopback harness.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// Shared room registry with failure switches and call counters.
    #[derive(Default)]
    pub struct MockDirectory {
        rooms: Mutex<HashMap<String, Vec<DirectoryEntry>>>,
        register_failures: AtomicU32,
        roster_failing: AtomicBool,
        register_calls: AtomicUsize,
        roster_calls: AtomicUsize,
        deregister_calls: AtomicUsize,
    }

    impl MockDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `n` registrations.
        pub fn fail_next_registrations(&self, n: u32) {
            self.register_failures.store(n, Ordering::SeqCst);
        }

        /// Make roster fetches fail until switched back.
        pub fn set_roster_failing(&self, failing: bool) {
            self.roster_failing.store(failing, Ordering::SeqCst);
        }

        /// Insert or replace an entry directly.
        pub fn insert(&self, room_id: &str, entry: DirectoryEntry) {
            upsert(self.rooms().entry(room_id.to_string()).or_default(), entry);
        }

        /// Remove an entry directly.
        pub fn remove(&self, room_id: &str, participant_id: &str) {
            if let Some(entries) = self.rooms().get_mut(room_id) {
                entries.retain(|e| e.participant_id != participant_id);
            }
        }

        /// Current entries for `room_id`, in registration order.
        pub fn entries(&self, room_id: &str) -> Vec<DirectoryEntry> {
            self.rooms().get(room_id).cloned().unwrap_or_default()
        }

        pub fn register_calls(&self) -> usize {
            self.register_calls.load(Ordering::SeqCst)
        }

        pub fn roster_calls(&self) -> usize {
            self.roster_calls.load(Ordering::SeqCst)
        }

        pub fn deregister_calls(&self) -> usize {
            self.deregister_calls.load(Ordering::SeqCst)
        }

        fn rooms(&self) -> MutexGuard<'_, HashMap<String, Vec<DirectoryEntry>>> {
            self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    fn upsert(entries: &mut Vec<DirectoryEntry>, entry: DirectoryEntry) {
        match entries
            .iter_mut()
            .find(|e| e.participant_id == entry.participant_id)
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    #[async_trait]
    impl SignalingDirectory for MockDirectory {
        async fn register(&self, registration: &Registration) -> Result<(), DirectoryError> {
            self.register_calls.fetch_add(1, Ordering::SeqCst);

            let failing = self
                .register_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(DirectoryError::Unavailable(
                    "Mock directory error".to_string(),
                ));
            }

            self.insert(
                &registration.room_id,
                DirectoryEntry {
                    participant_id: registration.participant_id.clone(),
                    display_name: registration.display_name.clone(),
                    link_address: Some(registration.link_address.clone()),
                },
            );
            Ok(())
        }

        async fn roster(&self, room_id: &str) -> Result<Vec<DirectoryEntry>, DirectoryError> {
            self.roster_calls.fetch_add(1, Ordering::SeqCst);

            if self.roster_failing.load(Ordering::SeqCst) {
                return Err(DirectoryError::Unavailable(
                    "Mock directory error".to_string(),
                ));
            }
            Ok(self.entries(room_id))
        }

        async fn deregister(
            &self,
            room_id: &str,
            participant_id: &str,
        ) -> Result<(), DirectoryError> {
            self.deregister_calls.fetch_add(1, Ordering::SeqCst);
            self.remove(room_id, participant_id);
            Ok(())
        }
    }
}
