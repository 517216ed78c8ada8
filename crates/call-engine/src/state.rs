//! Participant media state.
//!
//! One authoritative entry per remote link address, last write wins. At most
//! one entry is flagged as screen sharing: applying a sharing entry clears the
//! flag everywhere else.

use crate::link::LinkAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Media flags of one participant as last reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    pub participant_id: String,
    pub link_address: LinkAddress,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

/// The local participant's own flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
        }
    }
}

impl LocalMediaState {
    #[must_use]
    pub fn to_participant_state(
        self,
        participant_id: &str,
        link_address: &LinkAddress,
    ) -> ParticipantState {
        ParticipantState {
            participant_id: participant_id.to_string(),
            link_address: link_address.clone(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            screen_sharing: self.screen_sharing,
        }
    }
}

/// Result of applying one remote state.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Applied {
    /// Whether the entry differs from what was stored.
    pub changed: bool,
    /// Entries whose sharing flag was cleared by this update.
    pub cleared: Vec<ParticipantState>,
}

/// Remote participant states keyed by link address.
#[derive(Debug, Default, Clone)]
pub struct ParticipantStates {
    entries: BTreeMap<LinkAddress, ParticipantState>,
}

impl ParticipantStates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert `state`, enforcing single-presenter exclusivity.
    pub fn apply(&mut self, state: ParticipantState) -> Applied {
        let mut next = self.entries.clone();
        let mut cleared = Vec::new();

        if state.screen_sharing {
            for (address, entry) in &mut next {
                if *address != state.link_address && entry.screen_sharing {
                    entry.screen_sharing = false;
                    cleared.push(entry.clone());
                }
            }
        }

        let changed = next.get(&state.link_address) != Some(&state);
        next.insert(state.link_address.clone(), state);
        self.entries = next;

        Applied { changed, cleared }
    }

    /// Clear the sharing flag on every entry. Returns the entries changed.
    pub fn clear_sharing(&mut self) -> Vec<ParticipantState> {
        let mut next = self.entries.clone();
        let mut cleared = Vec::new();
        for entry in next.values_mut().filter(|e| e.screen_sharing) {
            entry.screen_sharing = false;
            cleared.push(entry.clone());
        }
        self.entries = next;
        cleared
    }

    pub fn remove(&mut self, address: &LinkAddress) -> Option<ParticipantState> {
        self.entries.remove(address)
    }

    #[must_use]
    pub fn get(&self, address: &LinkAddress) -> Option<&ParticipantState> {
        self.entries.get(address)
    }

    pub fn values(&self) -> impl Iterator<Item = &ParticipantState> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
