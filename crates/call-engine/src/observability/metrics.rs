//! Metrics definitions for the call engine.
//!
//! All metrics follow Prometheus naming conventions:
//! - `call_` prefix
//! - `_total` suffix for counters
//!
//! The library only records through the `metrics` facade. Installing a
//! recorder is left to the embedding application.
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `outcome`: connected, declined, peer_unavailable, timeout, network, server, closed, stale
//! - `kind`: state, track_update, chat
//! - `direction`: sent, received
//! - `reason`: left, time-limit

use metrics::{counter, gauge};

/// Record the outcome of a dial or answer.
///
/// Metric: `call_dials_total`
/// Labels: `outcome`
pub fn record_dial(outcome: &'static str) {
    counter!("call_dials_total", "outcome" => outcome).increment(1);
}

/// Set the number of Connected links held by one session.
///
/// Metric: `call_connections_active`
/// Labels: none
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic mesh sizes
    #[allow(clippy::cast_precision_loss)]
    gauge!("call_connections_active").set(count as f64);
}

/// Record a data-link frame.
///
/// Metric: `call_data_frames_total`
/// Labels: `kind`, `direction`
pub fn record_data_frame(kind: &'static str, direction: &'static str) {
    counter!("call_data_frames_total", "kind" => kind, "direction" => direction).increment(1);
}

/// Record a malformed data-link payload.
///
/// Metric: `call_protocol_faults_total`
/// Labels: none
pub fn record_protocol_fault() {
    counter!("call_protocol_faults_total").increment(1);
}

/// Record one per-peer track replacement.
///
/// Metric: `call_track_replacements_total`
/// Labels: `outcome` (success, error)
pub fn record_track_replacement(outcome: &'static str) {
    counter!("call_track_replacements_total", "outcome" => outcome).increment(1);
}

/// Record a chat message.
///
/// Metric: `call_chat_messages_total`
/// Labels: `direction` (sent, received)
pub fn record_chat_message(direction: &'static str) {
    counter!("call_chat_messages_total", "direction" => direction).increment(1);
}

/// Record a session ending.
///
/// Metric: `call_sessions_ended_total`
/// Labels: `reason`
pub fn record_session_ended(reason: &'static str) {
    counter!("call_sessions_ended_total", "reason" => reason).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        // No recorder installed: every call must be a silent no-op
        record_dial("connected");
        record_dial("declined");
        set_connections_active(3);
        record_data_frame("state", "sent");
        record_data_frame("chat", "received");
        record_protocol_fault();
        record_track_replacement("success");
        record_track_replacement("error");
        record_chat_message("sent");
        record_session_ended("time-limit");
    }
}
