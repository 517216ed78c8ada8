//! Screen-share track substitution.
//!
//! The session owns one [`ShareState`]. Starting or stopping a share swaps the
//! outgoing video on every Connection concurrently via [`replace_on_all`], then
//! schedules `track-update` notifications per [`TrackUpdatePolicy`]. Each
//! start or stop bumps the share epoch so stale notifications are dropped.

use crate::actors::connection::ConnectionHandle;
use crate::link::{LinkAddress, LinkError};
use crate::media::MediaTrack;
use crate::observability::metrics;
use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, warn};

/// Which track is outgoing and under which epoch.
#[derive(Debug, Default)]
pub struct ShareState {
    epoch: u64,
    screen: Option<MediaTrack>,
}

impl ShareState {
    #[must_use]
    pub fn is_sharing(&self) -> bool {
        self.screen.is_some()
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    #[must_use]
    pub fn screen_track(&self) -> Option<&MediaTrack> {
        self.screen.as_ref()
    }

    /// Record `screen` as outgoing. Returns the new epoch.
    pub fn begin(&mut self, screen: MediaTrack) -> u64 {
        self.epoch += 1;
        self.screen = Some(screen);
        self.epoch
    }

    /// Clear the share. Returns the screen track, which the caller stops.
    pub fn end(&mut self) -> Option<MediaTrack> {
        self.epoch += 1;
        self.screen.take()
    }
}

/// Send-wait-resend schedule for `track-update` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackUpdatePolicy {
    pub first_delay: Duration,
    pub resend_delay: Duration,
}

impl TrackUpdatePolicy {
    /// `(attempt, delay since previous step)` pairs.
    #[must_use]
    pub fn schedule(&self) -> [(u8, Duration); 2] {
        [(1, self.first_delay), (2, self.resend_delay)]
    }
}

/// Replace the outgoing video on every connection concurrently.
///
/// Each replacement is bounded by `timeout`. Failures are logged and returned
/// per peer; one slow or failing peer never blocks the others.
pub async fn replace_on_all(
    connections: Vec<ConnectionHandle>,
    track: &MediaTrack,
    timeout: Duration,
) -> Vec<(LinkAddress, Result<(), LinkError>)> {
    let replacements = connections.into_iter().map(|handle| {
        let track = track.clone();
        async move {
            let result = match tokio::time::timeout(timeout, handle.replace_track(track)).await {
                Ok(result) => result,
                Err(_) => Err(LinkError::Timeout),
            };
            (handle.link_address().clone(), result)
        }
    });

    let results = join_all(replacements).await;
    for (address, result) in &results {
        match result {
            Ok(()) => {
                metrics::record_track_replacement("success");
                debug!(
                    target: "call.session",
                    link_address = %address,
                    track_id = %track.id(),
                    "Outgoing video replaced"
                );
            }
            Err(e) => {
                metrics::record_track_replacement("error");
                warn!(
                    target: "call.session",
                    link_address = %address,
                    error = %e,
                    "Track replacement failed for peer"
                );
            }
        }
    }
    results
}
