//! UI-facing derived state.
//!
//! Presenter and unread count are pure functions of the data model. The
//! snapshot types are what [`crate::actors::SessionHandle::snapshot`] returns.

use crate::actors::messages::{ConnectionPhase, Direction};
use crate::chat::ChatMessage;
use crate::clock::ClockSnapshot;
use crate::link::LinkAddress;
use crate::media::MediaStream;
use crate::state::{LocalMediaState, ParticipantState};

/// The participant currently presenting, if any.
///
/// Exclusivity is enforced when states are applied; the first sharing entry
/// is returned.
pub fn presenter<'a, I>(states: I) -> Option<&'a ParticipantState>
where
    I: IntoIterator<Item = &'a ParticipantState>,
{
    states.into_iter().find(|s| s.screen_sharing)
}

/// Remote messages appended after the seen mark.
#[must_use]
pub fn unread_count(transcript: &[ChatMessage], seen_through: usize, local_id: &str) -> usize {
    transcript
        .get(seen_through..)
        .map_or(0, |unseen| unseen.iter().filter(|m| m.sender_id != local_id).count())
}

/// Rendering view of one remote link address.
#[derive(Debug, Clone)]
pub struct RemoteFeed {
    pub link_address: LinkAddress,
    pub participant_id: Option<String>,
    pub display_name: Option<String>,
    /// `None` while the address is only known from the roster.
    pub direction: Option<Direction>,
    pub phase: ConnectionPhase,
    /// Live media handle; present once Connected.
    pub stream: Option<MediaStream>,
    pub state: Option<ParticipantState>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub room_id: String,
    pub participant_id: String,
    pub link_address: LinkAddress,
    pub live: bool,
    pub local: LocalMediaState,
    pub feeds: Vec<RemoteFeed>,
    pub presenter: Option<ParticipantState>,
    pub transcript: Vec<ChatMessage>,
    pub unread: usize,
    pub clock: ClockSnapshot,
    pub denylisted: usize,
}

impl SessionSnapshot {
    /// Feeds in the Connected phase.
    pub fn connected(&self) -> impl Iterator<Item = &RemoteFeed> {
        self.feeds
            .iter()
            .filter(|f| f.phase == ConnectionPhase::Connected)
    }

    /// Remote state reported by `participant_id`.
    #[must_use]
    pub fn state_of(&self, participant_id: &str) -> Option<&ParticipantState> {
        self.feeds
            .iter()
            .filter_map(|f| f.state.as_ref())
            .find(|s| s.participant_id == participant_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn state(id: &str, sharing: bool) -> ParticipantState {
        ParticipantState {
            participant_id: id.to_string(),
            link_address: LinkAddress::from(id),
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: sharing,
        }
    }

    #[test]
    fn test_presenter_is_the_sharing_entry() {
        let states = [state("a", false), state("b", true), state("c", false)];
        assert_eq!(presenter(&states).unwrap().participant_id, "b");

        let nobody = [state("a", false)];
        assert!(presenter(&nobody).is_none());
    }

    #[test]
    fn test_unread_ignores_own_and_seen_messages() {
        let transcript = vec![
            ChatMessage::new("them", "Them", "one"),
            ChatMessage::new("me", "Me", "two"),
            ChatMessage::new("them", "Them", "three"),
        ];
        assert_eq!(unread_count(&transcript, 0, "me"), 2);
        assert_eq!(unread_count(&transcript, 1, "me"), 1);
        assert_eq!(unread_count(&transcript, 3, "me"), 0);
        assert_eq!(unread_count(&transcript, 10, "me"), 0);
    }
}
