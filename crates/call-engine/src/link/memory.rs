//! In-process link hub.
//!
//! Endpoints live in one shared table. A dial enqueues an [`IncomingLink`] on
//! the callee and waits for `answer` or `decline`. Each established pair is two
//! [`LinkHalf`] values sharing a closed flag. A half's outgoing video is
//! mirrored into the stream the other side reads, with no notification.

use super::{
    DataLink, EstablishedLink, IncomingLink, LinkAddress, LinkError, LinkEvent, LinkPrimitive,
    LocalEndpoint, MediaChannel,
};
use crate::media::{MediaBundle, MediaStream, MediaTrack};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Buffer for pending inbound dials per endpoint.
const ENDPOINT_CHANNEL_BUFFER: usize = 64;

/// Buffer for link events per side.
const LINK_EVENT_CHANNEL_BUFFER: usize = 256;

type HalfKey = (LinkAddress, LinkAddress);

#[derive(Default)]
struct HubState {
    endpoints: HashMap<LinkAddress, mpsc::Sender<IncomingLink>>,
    /// Keyed by `(local, remote)` of the half.
    halves: HashMap<HalfKey, Arc<LinkHalf>>,
    dial_faults: HashMap<LinkAddress, LinkError>,
    replace_faults: HashSet<LinkAddress>,
}

fn lock(state: &Mutex<HubState>) -> MutexGuard<'_, HubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory transport. Clones share the same endpoint table.
#[derive(Clone, Default)]
pub struct MemoryLinkHub {
    state: Arc<Mutex<HubState>>,
    next_endpoint: Arc<AtomicU64>,
}

struct DialOffer {
    audio: MediaTrack,
    video: MediaTrack,
    reply: oneshot::Sender<Result<PendingCaller, LinkError>>,
}

struct CallerSide {
    half: Arc<LinkHalf>,
    remote_stream: MediaStream,
    events: mpsc::Receiver<LinkEvent>,
}

/// Answered caller side in flight to the dialer. Closes the link if the
/// dialer is gone before taking it.
struct PendingCaller(Option<CallerSide>);

impl PendingCaller {
    fn take(mut self) -> Option<CallerSide> {
        self.0.take()
    }
}

impl Drop for PendingCaller {
    fn drop(&mut self) {
        if let Some(side) = self.0.take() {
            side.half.abandon();
        }
    }
}

/// One side of an established pair.
struct LinkHalf {
    local: LinkAddress,
    remote: LinkAddress,
    outgoing: Mutex<MediaTrack>,
    /// The stream the remote side reads.
    seen_by_remote: MediaStream,
    /// Delivers events to the remote side.
    remote_events: mpsc::Sender<LinkEvent>,
    closed: Arc<AtomicBool>,
    hub: Weak<Mutex<HubState>>,
}

struct MemoryDataLink {
    remote_events: mpsc::Sender<LinkEvent>,
    link_closed: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MemoryLinkHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every dial to `remote` fail with `error` until cleared.
    pub fn fail_dials_to(&self, remote: &LinkAddress, error: LinkError) {
        lock(&self.state).dial_faults.insert(remote.clone(), error);
    }

    pub fn clear_dial_faults(&self) {
        lock(&self.state).dial_faults.clear();
    }

    /// Make track replacement towards `remote` fail.
    pub fn fail_track_replacement_to(&self, remote: &LinkAddress) {
        lock(&self.state).replace_faults.insert(remote.clone());
    }

    /// Deliver `error` to both sides of the pair `a`/`b`.
    pub fn inject_link_error(&self, a: &LinkAddress, b: &LinkAddress, error: LinkError) {
        let state = lock(&self.state);
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(half) = state.halves.get(&key) {
                let _ = half.remote_events.try_send(LinkEvent::Error(error.clone()));
            }
        }
    }

    /// Number of established pairs.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        lock(&self.state).halves.len() / 2
    }

    /// Number of open endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        lock(&self.state).endpoints.len()
    }

    /// Video tracks `local` is currently sending, one per established pair.
    #[must_use]
    pub fn outgoing_tracks(&self, local: &LinkAddress) -> Vec<MediaTrack> {
        lock(&self.state)
            .halves
            .iter()
            .filter(|((from, _), _)| from == local)
            .filter_map(|(_, half)| half.outgoing_video())
            .collect()
    }
}

#[async_trait]
impl LinkPrimitive for MemoryLinkHub {
    async fn open_endpoint(&self, participant_id: &str) -> Result<LocalEndpoint, LinkError> {
        let n = self.next_endpoint.fetch_add(1, Ordering::SeqCst);
        let address = LinkAddress::new(format!("mem-{n:04}-{participant_id}"));
        let (tx, incoming) = mpsc::channel(ENDPOINT_CHANNEL_BUFFER);
        lock(&self.state).endpoints.insert(address.clone(), tx);

        debug!(target: "call.link", address = %address, "Endpoint opened");
        Ok(LocalEndpoint { address, incoming })
    }

    async fn dial(
        &self,
        local: &LinkAddress,
        remote: &LinkAddress,
        media: &MediaBundle,
    ) -> Result<EstablishedLink, LinkError> {
        let callee = {
            let state = lock(&self.state);
            if let Some(fault) = state.dial_faults.get(remote) {
                return Err(fault.clone());
            }
            state
                .endpoints
                .get(remote)
                .cloned()
                .ok_or_else(|| LinkError::PeerUnavailable(remote.to_string()))?
        };

        let (reply, answer) = oneshot::channel();
        let offer = DialOffer {
            audio: media.audio.clone(),
            video: media.video.clone(),
            reply,
        };
        callee
            .send(IncomingLink {
                remote: local.clone(),
                local: remote.clone(),
                payload: Box::new(offer),
            })
            .await
            .map_err(|_| LinkError::PeerUnavailable(remote.to_string()))?;

        // A dropped offer counts as a decline
        let side = answer
            .await
            .map_err(|_| LinkError::Declined)??
            .take()
            .ok_or(LinkError::Closed)?;
        Ok(EstablishedLink {
            remote: remote.clone(),
            media: side.half,
            remote_stream: side.remote_stream,
            events: side.events,
        })
    }

    async fn answer(
        &self,
        incoming: IncomingLink,
        media: &MediaBundle,
    ) -> Result<EstablishedLink, LinkError> {
        let offer = incoming
            .payload
            .downcast::<DialOffer>()
            .map_err(|_| LinkError::Network("unrecognized handshake".to_string()))?;
        if offer.reply.is_closed() {
            return Err(LinkError::PeerUnavailable(incoming.remote.to_string()));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let (to_caller, caller_events) = mpsc::channel(LINK_EVENT_CHANNEL_BUFFER);
        let (to_callee, callee_events) = mpsc::channel(LINK_EVENT_CHANNEL_BUFFER);
        let caller_sees = MediaStream::new(Some(media.audio.clone()), Some(media.video.clone()));
        let callee_sees = MediaStream::new(Some(offer.audio.clone()), Some(offer.video.clone()));

        let caller_half = Arc::new(LinkHalf {
            local: incoming.remote.clone(),
            remote: incoming.local.clone(),
            outgoing: Mutex::new(offer.video.clone()),
            seen_by_remote: callee_sees.clone(),
            remote_events: to_callee,
            closed: Arc::clone(&closed),
            hub: Arc::downgrade(&self.state),
        });
        let callee_half = Arc::new(LinkHalf {
            local: incoming.local.clone(),
            remote: incoming.remote.clone(),
            outgoing: Mutex::new(media.video.clone()),
            seen_by_remote: caller_sees.clone(),
            remote_events: to_caller,
            closed,
            hub: Arc::downgrade(&self.state),
        });

        {
            let mut state = lock(&self.state);
            state
                .halves
                .insert(caller_half.key(), Arc::clone(&caller_half));
            state
                .halves
                .insert(callee_half.key(), Arc::clone(&callee_half));
        }

        let sent = offer.reply.send(Ok(PendingCaller(Some(CallerSide {
            half: caller_half,
            remote_stream: caller_sees,
            events: caller_events,
        }))));
        if sent.is_err() {
            callee_half.detach();
            return Err(LinkError::PeerUnavailable(incoming.remote.to_string()));
        }

        Ok(EstablishedLink {
            remote: incoming.remote,
            media: callee_half,
            remote_stream: callee_sees,
            events: callee_events,
        })
    }

    async fn decline(&self, incoming: IncomingLink) {
        if let Ok(offer) = incoming.payload.downcast::<DialOffer>() {
            let _ = offer.reply.send(Err(LinkError::Declined));
        }
    }

    async fn open_data_link(
        &self,
        local: &LinkAddress,
        remote: &LinkAddress,
    ) -> Result<Arc<dyn DataLink>, LinkError> {
        let state = lock(&self.state);
        let half = state
            .halves
            .get(&(local.clone(), remote.clone()))
            .ok_or_else(|| LinkError::PeerUnavailable(remote.to_string()))?;

        Ok(Arc::new(MemoryDataLink {
            remote_events: half.remote_events.clone(),
            link_closed: Arc::clone(&half.closed),
            open: AtomicBool::new(true),
        }))
    }

    async fn close_endpoint(&self, local: &LinkAddress) {
        if lock(&self.state).endpoints.remove(local).is_some() {
            debug!(target: "call.link", address = %local, "Endpoint closed");
        }
    }
}

impl LinkHalf {
    fn key(&self) -> HalfKey {
        (self.local.clone(), self.remote.clone())
    }

    /// Mark closed and drop both halves from the hub. Returns false if already closed.
    fn detach(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(hub) = self.hub.upgrade() {
            let mut state = lock(&hub);
            // A newer link between the same pair may own these keys
            for key in [self.key(), (self.remote.clone(), self.local.clone())] {
                let same_link = state
                    .halves
                    .get(&key)
                    .is_some_and(|half| Arc::ptr_eq(&half.closed, &self.closed));
                if same_link {
                    state.halves.remove(&key);
                }
            }
        }
        true
    }

    /// Close without awaiting buffer space, for drop paths.
    fn abandon(&self) {
        if self.detach() {
            let _ = self.remote_events.try_send(LinkEvent::Closed);
            debug!(
                target: "call.link",
                local = %self.local,
                remote = %self.remote,
                "Abandoned link closed"
            );
        }
    }
}

#[async_trait]
impl MediaChannel for LinkHalf {
    async fn replace_video_track(&self, track: MediaTrack) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let refused = match self.hub.upgrade() {
            Some(hub) => {
                let state = lock(&hub);
                state.replace_faults.contains(&self.remote)
            }
            None => false,
        };
        if refused {
            return Err(LinkError::Network("track replacement refused".to_string()));
        }

        *self.outgoing.lock().unwrap_or_else(PoisonError::into_inner) = track.clone();
        self.seen_by_remote.set_video(Some(track));
        Ok(())
    }

    fn outgoing_video(&self) -> Option<MediaTrack> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(
            self.outgoing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        )
    }

    async fn close(&self) {
        if self.detach() {
            let _ = self.remote_events.send(LinkEvent::Closed).await;
            debug!(
                target: "call.link",
                local = %self.local,
                remote = %self.remote,
                "Link closed"
            );
        }
    }
}

#[async_trait]
impl DataLink for MemoryDataLink {
    async fn send(&self, frame: Bytes) -> Result<(), LinkError> {
        if !self.open.load(Ordering::SeqCst) || self.link_closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.remote_events
            .send(LinkEvent::Data(frame))
            .await
            .map_err(|_| LinkError::Closed)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
