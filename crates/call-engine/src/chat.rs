//! Chat transcript.
//!
//! Messages are kept in local receipt order. There is no global order across
//! peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// New message with a generated id, stamped now.
    #[must_use]
    pub fn new(sender_id: &str, sender_name: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Local transcript plus view bookkeeping.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
    ids: HashSet<String>,
    visible: bool,
    /// Transcript length the user has seen.
    seen_through: usize,
}

impl ChatLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Returns false if its id is already in the transcript.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        if self.visible {
            self.seen_through = self.messages.len();
        }
        true
    }

    /// Show or hide the chat view. Showing it marks everything as seen.
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        if visible {
            self.seen_through = self.messages.len();
        }
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn seen_through(&self) -> usize {
        self.seen_through
    }
}
