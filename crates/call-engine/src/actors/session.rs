//! `SessionActor` - one per joined room, owns every mutable table of a call.
//!
//! Each `SessionActor`:
//! - Owns the Connection table, peer roster, participant states, denylist,
//!   chat transcript, meeting clock and screen-share state
//! - Polls the signaling directory and dials every eligible peer
//! - Answers inbound dials, resolving glare by link address order
//! - Supervises one `ConnectionActor` per established link
//!
//! # Lifecycle
//!
//! 1. [`SessionActor::start`] captures media, opens the endpoint and registers
//! 2. The actor loop runs discovery and the clock until stopped
//! 3. Teardown closes every link, releases media and deregisters
//!
//! Every off-actor task (roster fetch, dial, answer, timers) reports back on
//! one internal event channel and checks the session token before doing so.

use crate::chat::{ChatLog, ChatMessage};
use crate::clock::{ClockTransition, MeetingClock};
use crate::config::EngineConfig;
use crate::directory::{DirectoryEntry, DirectoryError, Registration, SignalingDirectory};
use crate::errors::CallError;
use crate::link::{EstablishedLink, IncomingLink, LinkAddress, LinkError, LinkPrimitive};
use crate::media::{MediaBundle, MediaDevices, MediaStream, MediaTrack};
use crate::observability::metrics;
use crate::protocol::{DataFrame, StateFrame, TrackUpdateFrame};
use crate::records::{CompletionRecord, DurationUpdate, MeetingRecords};
use crate::screen_share::{replace_on_all, ShareState, TrackUpdatePolicy};
use crate::state::{LocalMediaState, ParticipantState, ParticipantStates};
use crate::view::{self, RemoteFeed, SessionSnapshot};

use super::connection::{ConnectionActor, ConnectionHandle};
use super::messages::{
    ConnectionPhase, Direction, EndReason, EngineEvent, SessionEvent, SessionMessage,
};

use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 100;

/// Buffer for internal engine events.
const ENGINE_EVENT_BUFFER: usize = 512;

/// Buffer for subscriber events. Slow subscribers see `Lagged`.
const SESSION_EVENT_BUFFER: usize = 256;

/// How long teardown waits for each connection actor.
const CONNECTION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity and budget of the local participant.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub room_id: String,
    pub participant_id: String,
    pub display_name: String,
    /// Zero means unlimited.
    pub duration_budget_seconds: u64,
    pub is_host: bool,
    /// External meeting record, written by the host.
    pub meeting_id: Option<String>,
}

/// Collaborators injected into a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub directory: Arc<dyn SignalingDirectory>,
    pub link: Arc<dyn LinkPrimitive>,
    pub devices: Arc<dyn MediaDevices>,
    pub records: Option<Arc<dyn MeetingRecords>>,
}

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
    room_id: String,
    participant_id: String,
    link_address: LinkAddress,
}

impl SessionHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Local link address registered in the directory.
    #[must_use]
    pub fn link_address(&self) -> &LinkAddress {
        &self.link_address
    }

    /// False once teardown has begun.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Flip the local audio flag and broadcast state. Returns the new value.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(|respond_to| SessionMessage::ToggleAudio { respond_to })
            .await?
    }

    /// Flip the local video flag and broadcast state. Returns the new value.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|respond_to| SessionMessage::ToggleVideo { respond_to })
            .await?
    }

    /// Start sharing the screen on every connection.
    ///
    /// Fails with `ScreenCaptureDenied` or `ScreenCaptureUnavailable`, leaving
    /// state unchanged. A no-op while already sharing.
    pub async fn start_share(&self) -> Result<(), CallError> {
        self.request(|respond_to| SessionMessage::StartShare { respond_to })
            .await?
    }

    /// Stop sharing and restore the camera. A no-op while not sharing.
    pub async fn stop_share(&self) -> Result<(), CallError> {
        self.request(|respond_to| SessionMessage::StopShare { respond_to })
            .await?
    }

    /// Send a chat message. The returned message is already in the transcript.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatMessage, CallError> {
        let text = text.into();
        self.request(|respond_to| SessionMessage::SendChat { text, respond_to })
            .await?
    }

    /// Show or hide the chat view.
    pub async fn set_chat_visible(&self, visible: bool) -> Result<(), CallError> {
        self.sender
            .send(SessionMessage::SetChatVisible { visible })
            .await
            .map_err(|_| CallError::SessionEnded)
    }

    /// Host-only. Returns the new total duration in minutes.
    pub async fn extend(&self, minutes: u64) -> Result<u64, CallError> {
        self.request(|respond_to| SessionMessage::Extend {
            minutes,
            respond_to,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, CallError> {
        self.request(|respond_to| SessionMessage::GetSnapshot { respond_to })
            .await
    }

    /// Leave the call. Safe to call repeatedly and after the session ended.
    pub async fn stop(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionMessage::Stop {
                reason: EndReason::Left,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        // A dropped responder means teardown already ran
        let _ = rx.await;
        Ok(())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| CallError::SessionEnded)?;

        rx.await.map_err(|_| CallError::SessionEnded)
    }
}

/// One row of the Connection table.
#[derive(Debug)]
struct ConnectionEntry {
    /// Dial attempt id, reused as the connection actor id.
    id: u64,
    direction: Direction,
    phase: ConnectionPhase,
    handle: Option<ConnectionHandle>,
    stream: Option<MediaStream>,
    /// Cancels the in-flight dial or answer.
    dial_cancel: Option<CancellationToken>,
    actor_task: Option<JoinHandle<()>>,
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    params: SessionParams,
    deps: SessionDeps,
    config: EngineConfig,
    local_address: LinkAddress,
    incoming: mpsc::Receiver<IncomingLink>,
    incoming_open: bool,
    receiver: mpsc::Receiver<SessionMessage>,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,
    broadcaster: broadcast::Sender<SessionEvent>,
    /// Session-live flag. Connection actors get child tokens.
    cancel_token: CancellationToken,

    /// Local capture. `video` is the camera track, stopped while sharing.
    media: MediaBundle,
    local: LocalMediaState,
    share: ShareState,
    track_updates: TrackUpdatePolicy,

    /// Latest roster, keyed by participant id.
    peers: BTreeMap<String, DirectoryEntry>,
    connections: BTreeMap<LinkAddress, ConnectionEntry>,
    states: ParticipantStates,
    denylist: HashMap<LinkAddress, Instant>,
    chat: ChatLog,
    clock: MeetingClock,

    next_connection_id: u64,
    roster_in_flight: bool,
    terminal_error_reported: bool,
    ended: bool,
}

impl SessionActor {
    /// Join a room.
    ///
    /// Captures local media, opens a link endpoint and registers it in the
    /// directory, then spawns the actor. If `cancel_token` fires during setup,
    /// completed steps are undone and `CallError::Cancelled` is returned.
    /// After setup the actor runs under a child of `cancel_token`.
    #[instrument(
        skip_all,
        name = "call.session.start",
        fields(room_id = %params.room_id, participant_id = %params.participant_id)
    )]
    pub async fn start(
        params: SessionParams,
        deps: SessionDeps,
        config: EngineConfig,
        cancel_token: CancellationToken,
    ) -> Result<(SessionHandle, JoinHandle<()>), CallError> {
        if cancel_token.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let captured = tokio::select! {
            () = cancel_token.cancelled() => return Err(CallError::Cancelled),
            captured = deps.devices.capture_user_media() => captured,
        };
        let media = captured.map_err(|e| {
            warn!(target: "call.session", error = %e, "Local media capture failed");
            CallError::MediaAcquisition(e)
        })?;

        let opened = tokio::select! {
            () = cancel_token.cancelled() => None,
            opened = deps.link.open_endpoint(&params.participant_id) => Some(opened),
        };
        let endpoint = match opened {
            Some(Ok(endpoint)) => endpoint,
            Some(Err(e)) => {
                warn!(target: "call.session", error = %e, "Failed to open link endpoint");
                media.stop();
                return Err(CallError::EndpointUnavailable(e.to_string()));
            }
            None => {
                media.stop();
                return Err(CallError::Cancelled);
            }
        };

        let registration = Registration {
            room_id: params.room_id.clone(),
            participant_id: params.participant_id.clone(),
            link_address: endpoint.address.clone(),
            display_name: params.display_name.clone(),
        };
        if let Err(e) =
            register_with_retry(deps.directory.as_ref(), &registration, &config, &cancel_token)
                .await
        {
            let may_be_registered = matches!(e, CallError::Cancelled);
            abandon_setup(&deps, &media, &registration, may_be_registered).await;
            return Err(e);
        }
        if cancel_token.is_cancelled() {
            abandon_setup(&deps, &media, &registration, true).await;
            return Err(CallError::Cancelled);
        }

        info!(
            target: "call.session",
            room_id = %params.room_id,
            participant_id = %params.participant_id,
            link_address = %endpoint.address,
            "Session registered"
        );

        Ok(Self::spawn(
            params,
            deps,
            config,
            endpoint.address,
            endpoint.incoming,
            media,
            cancel_token.child_token(),
        ))
    }

    fn spawn(
        params: SessionParams,
        deps: SessionDeps,
        config: EngineConfig,
        local_address: LinkAddress,
        incoming: mpsc::Receiver<IncomingLink>,
        media: MediaBundle,
        cancel_token: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(ENGINE_EVENT_BUFFER);
        let (broadcaster, _) = broadcast::channel(SESSION_EVENT_BUFFER);

        let handle = SessionHandle {
            sender,
            cancel_token: cancel_token.clone(),
            events: broadcaster.clone(),
            room_id: params.room_id.clone(),
            participant_id: params.participant_id.clone(),
            link_address: local_address.clone(),
        };

        let clock = MeetingClock::new(
            params.duration_budget_seconds,
            params.is_host,
            config.warning_threshold_seconds,
        );
        let track_updates = TrackUpdatePolicy {
            first_delay: config.track_update_delay,
            resend_delay: config.track_update_resend,
        };

        let actor = Self {
            params,
            deps,
            config,
            local_address,
            incoming,
            incoming_open: true,
            receiver,
            events_tx,
            events_rx,
            broadcaster,
            cancel_token,
            media,
            local: LocalMediaState::default(),
            share: ShareState::default(),
            track_updates,
            peers: BTreeMap::new(),
            connections: BTreeMap::new(),
            states: ParticipantStates::new(),
            denylist: HashMap::new(),
            chat: ChatLog::new(),
            clock,
            next_connection_id: 0,
            roster_in_flight: false,
            terminal_error_reported: false,
            ended: false,
        };

        let task_handle = tokio::spawn(actor.run());
        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "call.session",
        fields(
            room_id = %self.params.room_id,
            participant_id = %self.params.participant_id
        )
    )]
    async fn run(mut self) {
        info!(
            target: "call.session",
            link_address = %self.local_address,
            is_host = self.params.is_host,
            "SessionActor started"
        );

        let mut discovery = tokio::time::interval(self.config.discovery_interval);
        let second = Duration::from_secs(1);
        let mut clock_tick = tokio::time::interval_at(Instant::now() + second, second);
        self.clock.start();

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "call.session",
                        "SessionActor received cancellation signal"
                    );
                    self.teardown(EndReason::Left).await;
                    break;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => {
                            debug!(target: "call.session", "All session handles dropped");
                            self.teardown(EndReason::Left).await;
                            break;
                        }
                    }
                }

                // Internal events
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }

                // Inbound dials
                inbound = self.incoming.recv(), if self.incoming_open => {
                    match inbound {
                        Some(incoming) => self.handle_incoming(incoming).await,
                        None => self.incoming_open = false,
                    }
                }

                _ = discovery.tick() => {
                    self.request_roster();
                }

                _ = clock_tick.tick() => {
                    if self.handle_clock_tick().await {
                        break;
                    }
                }
            }
        }

        info!(
            target: "call.session",
            link_address = %self.local_address,
            elapsed_seconds = self.clock.elapsed_seconds(),
            "SessionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::ToggleAudio { respond_to } => {
                let enabled = !self.local.audio_enabled;
                self.local.audio_enabled = enabled;
                self.media.audio.set_enabled(enabled);
                self.broadcast_state().await;
                let _ = respond_to.send(Ok(enabled));
            }

            SessionMessage::ToggleVideo { respond_to } => {
                let enabled = !self.local.video_enabled;
                self.local.video_enabled = enabled;
                self.media.video.set_enabled(enabled);
                self.broadcast_state().await;
                let _ = respond_to.send(Ok(enabled));
            }

            SessionMessage::StartShare { respond_to } => {
                let result = self.start_share().await;
                let _ = respond_to.send(result);
            }

            SessionMessage::StopShare { respond_to } => {
                self.stop_share().await;
                let _ = respond_to.send(Ok(()));
            }

            SessionMessage::SendChat { text, respond_to } => {
                let result = self.send_chat(text).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::SetChatVisible { visible } => {
                self.chat.set_visible(visible);
            }

            SessionMessage::Extend {
                minutes,
                respond_to,
            } => {
                let result = self.extend(minutes);
                let _ = respond_to.send(result);
            }

            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            SessionMessage::Stop { reason, respond_to } => {
                self.teardown(reason).await;
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Roster(result) => self.apply_roster(result).await,

            EngineEvent::LinkSettled {
                address,
                attempt,
                result,
            } => self.handle_link_settled(address, attempt, result).await,

            EngineEvent::MediaReceived {
                address,
                connection_id,
                stream,
            } => self.handle_media_received(&address, connection_id, stream),

            EngineEvent::DataLinkOpened {
                address,
                connection_id,
            } => {
                // Full state on open so the peer converges without a toggle
                if let Some(handle) = self.current_handle(&address, connection_id) {
                    if let Err(e) = handle.send(self.local_state_frame()).await {
                        debug!(target: "call.session", error = %e, "Initial state send failed");
                    }
                }
            }

            EngineEvent::DataMessage {
                address,
                connection_id,
                frame,
            } => {
                if self.current_handle(&address, connection_id).is_some() {
                    self.handle_frame(&address, frame).await;
                }
            }

            EngineEvent::LinkClosed {
                address,
                connection_id,
            } => {
                if self.current_handle(&address, connection_id).is_some() {
                    debug!(target: "call.session", link_address = %address, "Peer closed link");
                    self.remove_connection(&address);
                }
            }

            EngineEvent::LinkError {
                address,
                connection_id,
                error,
            } => {
                if self.current_handle(&address, connection_id).is_some() {
                    self.remove_connection(&address);
                    self.absorb_link_error(&address, &error);
                }
            }

            EngineEvent::TrackUpdateDue { epoch, attempt } => {
                if self.share.is_current(epoch) {
                    debug!(
                        target: "call.session",
                        epoch = epoch,
                        attempt = attempt,
                        "Sending track-update"
                    );
                    self.broadcast(DataFrame::TrackUpdate(TrackUpdateFrame {
                        sender_id: self.params.participant_id.clone(),
                        link_address: self.local_address.clone(),
                    }))
                    .await;
                }
            }

            EngineEvent::ScreenEnded { epoch } => {
                if self.share.is_current(epoch) && self.share.is_sharing() {
                    info!(target: "call.session", "Screen capture ended outside the session");
                    self.stop_share().await;
                    self.emit(SessionEvent::ShareEnded);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    fn request_roster(&mut self) {
        if self.roster_in_flight {
            return;
        }
        self.roster_in_flight = true;

        let directory = Arc::clone(&self.deps.directory);
        let room_id = self.params.room_id.clone();
        let events = self.events_tx.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel_token.cancelled() => return,
                result = directory.roster(&room_id) => result,
            };
            if !cancel_token.is_cancelled() {
                let _ = events.send(EngineEvent::Roster(result)).await;
            }
        });
    }

    async fn apply_roster(&mut self, result: Result<Vec<DirectoryEntry>, DirectoryError>) {
        self.roster_in_flight = false;
        let entries = match result {
            Ok(entries) => entries,
            Err(e) => {
                warn!(target: "call.session", error = %e, "Roster fetch failed, skipping tick");
                return;
            }
        };

        let peers: BTreeMap<String, DirectoryEntry> = entries
            .into_iter()
            .filter(|e| {
                e.participant_id != self.params.participant_id
                    && e.link_address.as_ref() != Some(&self.local_address)
            })
            .map(|e| (e.participant_id.clone(), e))
            .collect();
        self.peers = peers;
        self.prune_denylist();

        let eligible: Vec<LinkAddress> = self
            .peers
            .values()
            .filter_map(|p| p.link_address.clone())
            .filter(|address| {
                !self.connections.contains_key(address) && !self.denylist.contains_key(address)
            })
            .collect();

        for address in eligible {
            self.dial(address);
        }
    }

    fn prune_denylist(&mut self) {
        let Some(ttl) = self.config.denylist_ttl else {
            return;
        };
        let kept: HashMap<LinkAddress, Instant> = self
            .denylist
            .iter()
            .filter(|(_, at)| at.elapsed() < ttl)
            .map(|(address, at)| (address.clone(), *at))
            .collect();
        self.denylist = kept;
    }

    fn next_id(&mut self) -> u64 {
        self.next_connection_id += 1;
        self.next_connection_id
    }

    fn dial(&mut self, remote: LinkAddress) {
        let attempt = self.next_id();
        debug!(
            target: "call.session",
            link_address = %remote,
            attempt = attempt,
            "Dialing peer"
        );

        let link = Arc::clone(&self.deps.link);
        let local = self.local_address.clone();
        let bundle = self.outgoing_bundle();
        let events = self.events_tx.clone();
        let dial_cancel = self.cancel_token.child_token();
        let cancel_token = dial_cancel.clone();
        let timeout = self.config.dial_timeout;
        let address = remote.clone();
        tokio::spawn(async move {
            let dialing = link.dial(&local, &address, &bundle);
            settle_attempt(dialing, timeout, &events, &cancel_token, &address, attempt).await;
        });

        self.connections.insert(
            remote,
            ConnectionEntry {
                id: attempt,
                direction: Direction::Outgoing,
                phase: ConnectionPhase::Dialing,
                handle: None,
                stream: None,
                dial_cancel: Some(dial_cancel),
                actor_task: None,
            },
        );
    }

    async fn handle_incoming(&mut self, incoming: IncomingLink) {
        let remote = incoming.remote.clone();
        if self.cancel_token.is_cancelled() {
            self.deps.link.decline(incoming).await;
            return;
        }

        let accept = match self.connections.get(&remote) {
            None => true,
            Some(entry)
                if entry.phase == ConnectionPhase::Dialing
                    && entry.direction == Direction::Outgoing =>
            {
                // Glare: the larger address keeps its own dial
                self.local_address < remote
            }
            Some(_) => false,
        };

        if !accept {
            debug!(target: "call.session", link_address = %remote, "Declining inbound dial");
            metrics::record_dial("declined");
            self.deps.link.decline(incoming).await;
            return;
        }

        if let Some(replaced) = self.connections.remove(&remote) {
            debug!(
                target: "call.session",
                link_address = %remote,
                "Inbound dial wins glare, abandoning own dial"
            );
            if let Some(dial_cancel) = replaced.dial_cancel {
                dial_cancel.cancel();
            }
        }
        if self.denylist.remove(&remote).is_some() {
            debug!(target: "call.session", link_address = %remote, "Peer is back, lifting denylist");
        }

        let attempt = self.next_id();
        let link = Arc::clone(&self.deps.link);
        let bundle = self.outgoing_bundle();
        let events = self.events_tx.clone();
        let dial_cancel = self.cancel_token.child_token();
        let cancel_token = dial_cancel.clone();
        let timeout = self.config.dial_timeout;
        let address = remote.clone();
        tokio::spawn(async move {
            let answering = link.answer(incoming, &bundle);
            settle_attempt(answering, timeout, &events, &cancel_token, &address, attempt).await;
        });

        self.connections.insert(
            remote,
            ConnectionEntry {
                id: attempt,
                direction: Direction::Incoming,
                phase: ConnectionPhase::Dialing,
                handle: None,
                stream: None,
                dial_cancel: Some(dial_cancel),
                actor_task: None,
            },
        );
    }

    async fn handle_link_settled(
        &mut self,
        address: LinkAddress,
        attempt: u64,
        result: Result<EstablishedLink, LinkError>,
    ) {
        let current = self
            .connections
            .get(&address)
            .is_some_and(|e| e.id == attempt && e.phase == ConnectionPhase::Dialing);
        if !current {
            metrics::record_dial("stale");
            if let Ok(link) = result {
                debug!(target: "call.session", link_address = %address, "Closing superseded link");
                link.media.close().await;
            }
            return;
        }

        let link = match result {
            Ok(link) => link,
            Err(error) => {
                metrics::record_dial(error.kind());
                self.connections.remove(&address);
                self.absorb_link_error(&address, &error);
                return;
            }
        };

        metrics::record_dial("connected");

        // A share may have started while this link was being set up
        let outgoing = self.outgoing_video();
        if link.media.outgoing_video().as_ref() != Some(&outgoing) {
            if let Err(e) = link.media.replace_video_track(outgoing).await {
                warn!(
                    target: "call.session",
                    link_address = %address,
                    error = %e,
                    "Failed to align outgoing video on new link"
                );
            }
        }

        let (handle, actor_task) = ConnectionActor::spawn(
            link,
            attempt,
            self.local_address.clone(),
            Arc::clone(&self.deps.link),
            self.events_tx.clone(),
            self.cancel_token.child_token(),
        );
        if let Some(entry) = self.connections.get_mut(&address) {
            entry.handle = Some(handle);
            entry.actor_task = Some(actor_task);
            entry.dial_cancel = None;
        }
    }

    fn handle_media_received(
        &mut self,
        address: &LinkAddress,
        connection_id: u64,
        stream: MediaStream,
    ) {
        let Some(entry) = self
            .connections
            .get_mut(address)
            .filter(|e| e.id == connection_id)
        else {
            return;
        };
        entry.phase = ConnectionPhase::Connected;
        entry.stream = Some(stream.clone());

        info!(
            target: "call.session",
            link_address = %address,
            direction = ?entry.direction,
            "Peer connected"
        );
        self.emit(SessionEvent::PeerConnected {
            link_address: address.clone(),
            stream,
        });
        self.update_connection_gauge();
    }

    fn remove_connection(&mut self, address: &LinkAddress) {
        let Some(entry) = self.connections.remove(address) else {
            return;
        };
        if let Some(dial_cancel) = &entry.dial_cancel {
            dial_cancel.cancel();
        }
        if let Some(handle) = &entry.handle {
            handle.cancel();
        }
        let was_connected = entry.phase == ConnectionPhase::Connected;
        self.states.remove(address);

        if was_connected {
            self.emit(SessionEvent::PeerDisconnected {
                link_address: address.clone(),
            });
        }
        self.update_connection_gauge();
    }

    /// Transient errors denylist the address; terminal ones surface once.
    fn absorb_link_error(&mut self, address: &LinkAddress, error: &LinkError) {
        if error.is_terminal() {
            warn!(
                target: "call.session",
                link_address = %address,
                error = %error,
                "Signaling failure on peer link"
            );
            if !self.terminal_error_reported {
                self.terminal_error_reported = true;
                self.emit(SessionEvent::Error {
                    message: "Connection to the call service failed".to_string(),
                });
            }
            return;
        }

        debug!(
            target: "call.session",
            link_address = %address,
            error = %error,
            "Peer unreachable, denylisting"
        );
        self.denylist.insert(address.clone(), Instant::now());
    }

    // ------------------------------------------------------------------------
    // State sync and chat
    // ------------------------------------------------------------------------

    async fn handle_frame(&mut self, address: &LinkAddress, frame: DataFrame) {
        match frame {
            DataFrame::State(state) => {
                let mut state = ParticipantState::from(state);
                // Keyed by the link the frame arrived on
                state.link_address = address.clone();
                let sharing = state.screen_sharing;

                let applied = self.states.apply(state.clone());
                if applied.changed {
                    self.emit(SessionEvent::ParticipantStateChanged(state));
                }
                for cleared in applied.cleared {
                    self.emit(SessionEvent::ParticipantStateChanged(cleared));
                }

                // Newest presenter wins
                if sharing && self.share.is_sharing() {
                    info!(
                        target: "call.session",
                        link_address = %address,
                        "Remote peer started presenting, yielding screen share"
                    );
                    self.stop_share().await;
                    self.emit(SessionEvent::ShareEnded);
                }
            }

            DataFrame::TrackUpdate(_) => {
                if let Some(stream) = self
                    .connections
                    .get(address)
                    .and_then(|e| e.stream.clone())
                {
                    self.emit(SessionEvent::RebindVideo {
                        link_address: address.clone(),
                        stream,
                    });
                }
            }

            DataFrame::Chat(message) => {
                if self.chat.append(message.clone()) {
                    metrics::record_chat_message("received");
                    self.emit(SessionEvent::ChatReceived(message));
                }
            }
        }
    }

    async fn send_chat(&mut self, text: String) -> Result<ChatMessage, CallError> {
        if text.trim().is_empty() {
            return Err(CallError::InvalidRequest(
                "Chat message is empty".to_string(),
            ));
        }

        let message = ChatMessage::new(
            &self.params.participant_id,
            &self.params.display_name,
            &text,
        );
        self.chat.append(message.clone());
        metrics::record_chat_message("sent");

        self.broadcast(DataFrame::Chat(message.clone())).await;
        Ok(message)
    }

    fn local_participant_state(&self) -> ParticipantState {
        self.local
            .to_participant_state(&self.params.participant_id, &self.local_address)
    }

    fn local_state_frame(&self) -> DataFrame {
        DataFrame::State(StateFrame::from(&self.local_participant_state()))
    }

    async fn broadcast_state(&self) {
        self.broadcast(self.local_state_frame()).await;
    }

    /// Send `frame` on every connection with a running actor.
    async fn broadcast(&self, frame: DataFrame) {
        for handle in self.connection_handles() {
            if let Err(e) = handle.send(frame.clone()).await {
                debug!(
                    target: "call.session",
                    link_address = %handle.link_address(),
                    error = %e,
                    "Broadcast to peer failed"
                );
            }
        }
    }

    fn connection_handles(&self) -> Vec<ConnectionHandle> {
        self.connections
            .values()
            .filter_map(|e| e.handle.clone())
            .collect()
    }

    fn current_handle(&self, address: &LinkAddress, connection_id: u64) -> Option<ConnectionHandle> {
        self.connections
            .get(address)
            .filter(|e| e.id == connection_id)
            .and_then(|e| e.handle.clone())
    }

    // ------------------------------------------------------------------------
    // Screen share
    // ------------------------------------------------------------------------

    /// Video track new and existing links should be sending.
    fn outgoing_video(&self) -> MediaTrack {
        self.share
            .screen_track()
            .cloned()
            .unwrap_or_else(|| self.media.video.clone())
    }

    fn outgoing_bundle(&self) -> MediaBundle {
        MediaBundle {
            audio: self.media.audio.clone(),
            video: self.outgoing_video(),
        }
    }

    async fn start_share(&mut self) -> Result<(), CallError> {
        if self.share.is_sharing() {
            return Ok(());
        }

        let screen = self
            .deps
            .devices
            .capture_screen()
            .await
            .map_err(|e| {
                warn!(target: "call.session", error = %e, "Screen capture failed");
                CallError::from_screen_capture(e)
            })?;

        replace_on_all(
            self.connection_handles(),
            &screen,
            self.config.track_replace_timeout,
        )
        .await;

        let epoch = self.share.begin(screen.clone());
        self.media.video.stop();
        self.local.screen_sharing = true;
        for cleared in self.states.clear_sharing() {
            self.emit(SessionEvent::ParticipantStateChanged(cleared));
        }

        self.broadcast_state().await;
        self.schedule_track_updates(epoch);
        self.watch_screen(epoch, &screen);

        info!(
            target: "call.session",
            epoch = epoch,
            connections = self.connections.len(),
            "Screen share started"
        );
        Ok(())
    }

    async fn stop_share(&mut self) {
        let Some(screen) = self.share.end() else {
            return;
        };

        match self.deps.devices.capture_camera().await {
            Ok(camera) => {
                camera.set_enabled(self.local.video_enabled);
                replace_on_all(
                    self.connection_handles(),
                    &camera,
                    self.config.track_replace_timeout,
                )
                .await;
                self.media.video = camera;
            }
            Err(e) => {
                warn!(
                    target: "call.session",
                    error = %e,
                    "Camera re-acquisition failed, continuing without video"
                );
            }
        }
        screen.stop();

        self.local.screen_sharing = false;
        self.broadcast_state().await;
        self.schedule_track_updates(self.share.epoch());

        info!(target: "call.session", epoch = self.share.epoch(), "Screen share stopped");
    }

    /// Send-wait-resend `track-update` for `epoch`.
    fn schedule_track_updates(&self, epoch: u64) {
        let policy = self.track_updates;
        let events = self.events_tx.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            for (attempt, delay) in policy.schedule() {
                tokio::select! {
                    () = cancel_token.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if events
                    .send(EngineEvent::TrackUpdateDue { epoch, attempt })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
    }

    /// Report when the screen track ends outside the session.
    fn watch_screen(&self, epoch: u64, screen: &MediaTrack) {
        let ended = screen.ended_token();
        let events = self.events_tx.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel_token.cancelled() => {}
                () = ended.cancelled() => {
                    let _ = events.send(EngineEvent::ScreenEnded { epoch }).await;
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------------

    /// Returns true if the session ended.
    async fn handle_clock_tick(&mut self) -> bool {
        match self.clock.tick() {
            ClockTransition::None => false,
            ClockTransition::Warning { remaining_seconds } => {
                info!(
                    target: "call.session",
                    remaining_seconds = remaining_seconds,
                    "Meeting time running out"
                );
                self.emit(SessionEvent::TimeWarning { remaining_seconds });
                false
            }
            ClockTransition::Expired => {
                info!(
                    target: "call.session",
                    elapsed_seconds = self.clock.elapsed_seconds(),
                    "Meeting time limit reached"
                );
                self.teardown(EndReason::TimeLimit).await;
                true
            }
        }
    }

    fn extend(&mut self, minutes: u64) -> Result<u64, CallError> {
        let total_minutes = self.clock.extend(minutes)?;
        info!(
            target: "call.session",
            minutes = minutes,
            total_minutes = total_minutes,
            "Meeting extended"
        );

        if let (Some(records), Some(meeting_id)) =
            (self.deps.records.clone(), self.params.meeting_id.clone())
        {
            tokio::spawn(async move {
                let update = DurationUpdate {
                    id: meeting_id,
                    duration_minutes: total_minutes,
                };
                if let Err(e) = records.update_duration(&update).await {
                    warn!(target: "call.records", error = %e, "Failed to persist extension");
                }
            });
        }
        Ok(total_minutes)
    }

    // ------------------------------------------------------------------------
    // Snapshot and teardown
    // ------------------------------------------------------------------------

    fn snapshot(&self) -> SessionSnapshot {
        let peer_at = |address: &LinkAddress| {
            self.peers
                .values()
                .find(|p| p.link_address.as_ref() == Some(address))
        };

        let mut feeds: Vec<RemoteFeed> = self
            .connections
            .iter()
            .map(|(address, entry)| {
                let peer = peer_at(address);
                RemoteFeed {
                    link_address: address.clone(),
                    participant_id: peer.map(|p| p.participant_id.clone()),
                    display_name: peer.map(|p| p.display_name.clone()),
                    direction: Some(entry.direction),
                    phase: entry.phase,
                    stream: entry.stream.clone(),
                    state: self.states.get(address).cloned(),
                }
            })
            .collect();

        // Known addresses with no Connection (denylisted or not yet dialed)
        feeds.extend(
            self.peers
                .values()
                .filter_map(|p| p.link_address.as_ref().map(|a| (p, a)))
                .filter(|(_, address)| !self.connections.contains_key(*address))
                .map(|(peer, address)| RemoteFeed {
                    link_address: address.clone(),
                    participant_id: Some(peer.participant_id.clone()),
                    display_name: Some(peer.display_name.clone()),
                    direction: None,
                    phase: ConnectionPhase::Discovered,
                    stream: None,
                    state: None,
                }),
        );

        let local_state = self.local_participant_state();
        let presenter = view::presenter(std::iter::once(&local_state).chain(self.states.values()))
            .cloned();

        let denylisted = match self.config.denylist_ttl {
            Some(ttl) => self
                .denylist
                .values()
                .filter(|at| at.elapsed() < ttl)
                .count(),
            None => self.denylist.len(),
        };

        SessionSnapshot {
            room_id: self.params.room_id.clone(),
            participant_id: self.params.participant_id.clone(),
            link_address: self.local_address.clone(),
            live: !self.cancel_token.is_cancelled(),
            local: self.local,
            feeds,
            presenter,
            transcript: self.chat.messages().to_vec(),
            unread: view::unread_count(
                self.chat.messages(),
                self.chat.seen_through(),
                &self.params.participant_id,
            ),
            clock: self.clock.snapshot(),
            denylisted,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.broadcaster.send(event);
    }

    fn update_connection_gauge(&self) {
        let connected = self
            .connections
            .values()
            .filter(|e| e.phase == ConnectionPhase::Connected)
            .count();
        metrics::set_connections_active(connected);
    }

    /// Release everything the session holds. Runs once.
    async fn teardown(&mut self, reason: EndReason) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.cancel_token.cancel();

        // Links that settled but were never picked up
        self.events_rx.close();
        while let Ok(event) = self.events_rx.try_recv() {
            if let EngineEvent::LinkSettled {
                address,
                result: Ok(link),
                ..
            } = event
            {
                debug!(target: "call.session", link_address = %address, "Closing unclaimed link");
                link.media.close().await;
            }
        }

        info!(
            target: "call.session",
            reason = %reason,
            connections = self.connections.len(),
            "Tearing down session"
        );

        // Dial and answer tasks see the cancelled token and close what they produced
        let connections = std::mem::take(&mut self.connections);
        for entry in connections.values() {
            if let Some(handle) = &entry.handle {
                handle.cancel();
            }
        }
        for (address, entry) in connections {
            let Some(task) = entry.actor_task else {
                continue;
            };
            match tokio::time::timeout(CONNECTION_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "call.session",
                        link_address = %address,
                        error = ?e,
                        "Connection task failed during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "call.session",
                        link_address = %address,
                        "Connection shutdown timed out"
                    );
                }
            }
        }

        self.media.stop();
        if let Some(screen) = self.share.end() {
            screen.stop();
        }
        self.local.screen_sharing = false;

        self.deps.link.close_endpoint(&self.local_address).await;
        self.incoming.close();
        while let Ok(pending) = self.incoming.try_recv() {
            self.deps.link.decline(pending).await;
        }

        if let Err(e) = self
            .deps
            .directory
            .deregister(&self.params.room_id, &self.params.participant_id)
            .await
        {
            warn!(target: "call.session", error = %e, "Deregistration failed");
        }

        if let Some((records, record)) = self.completion_record() {
            if let Err(e) = records.complete(&record).await {
                warn!(target: "call.records", error = %e, "Failed to write completion record");
            }
        }

        self.clock.end();
        self.states = ParticipantStates::new();
        self.peers.clear();

        metrics::set_connections_active(0);
        metrics::record_session_ended(reason.as_str());
        self.emit(SessionEvent::Ended { reason });

        info!(target: "call.session", reason = %reason, "Session ended");
    }

    fn completion_record(&self) -> Option<(Arc<dyn MeetingRecords>, CompletionRecord)> {
        if !self.params.is_host {
            return None;
        }
        let records = self.deps.records.clone()?;
        let meeting_id = self.params.meeting_id.as_deref()?;
        let record =
            CompletionRecord::completed(meeting_id, self.clock.elapsed_seconds(), Utc::now());
        Some((records, record))
    }
}

/// Drive a dial or answer to completion and report it.
///
/// On cancellation the attempt is polled once more, so a link that completed
/// at the same moment is closed rather than dropped.
async fn settle_attempt<F>(
    attempt_future: F,
    timeout: Duration,
    events: &mpsc::Sender<EngineEvent>,
    cancel_token: &CancellationToken,
    address: &LinkAddress,
    attempt: u64,
) where
    F: Future<Output = Result<EstablishedLink, LinkError>>,
{
    let settling = tokio::time::timeout(timeout, attempt_future);
    tokio::pin!(settling);

    let result = tokio::select! {
        biased;
        settled = &mut settling => settled.unwrap_or(Err(LinkError::Timeout)),
        () = cancel_token.cancelled() => {
            if let Some(Ok(Ok(link))) = settling.as_mut().now_or_never() {
                link.media.close().await;
            }
            return;
        }
    };
    report_settled(events, cancel_token, address.clone(), attempt, result).await;
}

/// Hand a finished dial or answer to the session, or close it if nobody is
/// left to take it.
async fn report_settled(
    events: &mpsc::Sender<EngineEvent>,
    cancel_token: &CancellationToken,
    address: LinkAddress,
    attempt: u64,
    result: Result<EstablishedLink, LinkError>,
) {
    if cancel_token.is_cancelled() {
        if let Ok(link) = result {
            link.media.close().await;
        }
        return;
    }

    let event = EngineEvent::LinkSettled {
        address,
        attempt,
        result,
    };
    if let Err(mpsc::error::SendError(EngineEvent::LinkSettled {
        result: Ok(link), ..
    })) = events.send(event).await
    {
        link.media.close().await;
    }
}

/// Register with bounded retries and exponential backoff.
async fn register_with_retry(
    directory: &dyn SignalingDirectory,
    registration: &Registration,
    config: &EngineConfig,
    cancel_token: &CancellationToken,
) -> Result<(), CallError> {
    let attempts = config.register_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let backoff = config
                .register_backoff
                .saturating_mul(2u32.saturating_pow(attempt - 1));
            tokio::select! {
                () = cancel_token.cancelled() => return Err(CallError::Cancelled),
                () = tokio::time::sleep(backoff) => {}
            }
        }

        let result = tokio::select! {
            () = cancel_token.cancelled() => return Err(CallError::Cancelled),
            result = directory.register(registration) => result,
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    target: "call.session",
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %e,
                    "Directory registration failed"
                );
                last_error = Some(e);
            }
        }
    }

    Err(CallError::DirectoryUnavailable(
        last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string()),
    ))
}

/// Undo a partial setup.
async fn abandon_setup(
    deps: &SessionDeps,
    media: &MediaBundle,
    registration: &Registration,
    deregister: bool,
) {
    media.stop();
    deps.link.close_endpoint(&registration.link_address).await;
    if deregister {
        if let Err(e) = deps
            .directory
            .deregister(&registration.room_id, &registration.participant_id)
            .await
        {
            warn!(target: "call.session", error = %e, "Deregistration after aborted setup failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ClockPhase;
    use crate::directory::mock::MockDirectory;
    use crate::link::MemoryLinkHub;
    use crate::media::{DeviceAvailability, SyntheticDevices, TrackKind};
    use crate::records::mock::MockMeetingRecords;

    struct Fixture {
        directory: Arc<MockDirectory>,
        hub: MemoryLinkHub,
        devices: Arc<SyntheticDevices>,
        records: Arc<MockMeetingRecords>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                directory: Arc::new(MockDirectory::new()),
                hub: MemoryLinkHub::new(),
                devices: Arc::new(SyntheticDevices::new()),
                records: Arc::new(MockMeetingRecords::new()),
            }
        }

        fn deps(&self) -> SessionDeps {
            SessionDeps {
                directory: self.directory.clone(),
                link: Arc::new(self.hub.clone()),
                devices: self.devices.clone(),
                records: Some(self.records.clone()),
            }
        }
    }

    fn params(id: &str, budget: u64, is_host: bool) -> SessionParams {
        SessionParams {
            room_id: "room-1".to_string(),
            participant_id: id.to_string(),
            display_name: format!("User {id}"),
            duration_budget_seconds: budget,
            is_host,
            meeting_id: Some("meeting-1".to_string()),
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            discovery_interval: Duration::from_millis(50),
            register_backoff: Duration::from_millis(10),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_registers_and_stop_deregisters() {
        let fx = Fixture::new();
        let (handle, task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let entries = fx.directory.entries("room-1");
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries.first().unwrap().link_address.as_ref(),
            Some(handle.link_address())
        );
        assert!(handle.is_live());

        handle.stop().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());

        assert!(!handle.is_live());
        assert!(fx.directory.entries("room-1").is_empty());
        assert_eq!(fx.hub.endpoint_count(), 0);
        assert_eq!(fx.devices.live_tracks(TrackKind::Audio), 0);
        assert_eq!(fx.devices.live_tracks(TrackKind::Video), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fx = Fixture::new();
        let (handle, _task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut events = handle.subscribe();

        handle.stop().await.unwrap();
        handle.stop().await.unwrap();
        handle.stop().await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Ended {
                reason: EndReason::Left
            }
        ));
        assert_eq!(fx.directory.deregister_calls(), 1);
        assert!(matches!(
            handle.toggle_audio().await,
            Err(CallError::SessionEnded)
        ));
    }

    #[tokio::test]
    async fn test_start_fails_when_camera_denied() {
        let fx = Fixture {
            devices: Arc::new(SyntheticDevices::new().with_camera(DeviceAvailability::Denied)),
            ..Fixture::new()
        };

        let result = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await;

        let err = result.err().unwrap();
        assert!(matches!(err, CallError::MediaAcquisition(_)));
        assert!(err.user_message().is_some());
        assert_eq!(fx.directory.register_calls(), 0);
        assert_eq!(fx.hub.endpoint_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_retries_then_succeeds() {
        let fx = Fixture::new();
        fx.directory.fail_next_registrations(2);

        let (handle, _task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(fx.directory.register_calls(), 3);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_exhaustion_releases_everything() {
        let fx = Fixture::new();
        fx.directory.fail_next_registrations(10);

        let result = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(CallError::DirectoryUnavailable(_))));
        assert_eq!(fx.directory.register_calls(), 3);
        assert_eq!(fx.hub.endpoint_count(), 0);
        assert_eq!(fx.devices.live_tracks(TrackKind::Audio), 0);
        assert_eq!(fx.devices.live_tracks(TrackKind::Video), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_setup() {
        let fx = Fixture::new();
        fx.directory.fail_next_registrations(10);
        let cancel_token = CancellationToken::new();

        let start = tokio::spawn(SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            EngineConfig {
                register_attempts: 5,
                register_backoff: Duration::from_secs(1),
                ..fast_config()
            },
            cancel_token.clone(),
        ));

        // First attempt fails, setup is now in backoff
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel_token.cancel();

        let result = start.await.unwrap();
        assert!(matches!(result, Err(CallError::Cancelled)));
        assert_eq!(fx.hub.endpoint_count(), 0);
        assert!(fx.directory.entries("room-1").is_empty());
        assert_eq!(fx.devices.live_tracks(TrackKind::Video), 0);
    }

    #[tokio::test]
    async fn test_toggles_flip_local_state() {
        let fx = Fixture::new();
        let (handle, _task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!handle.toggle_audio().await.unwrap());
        assert!(!handle.toggle_video().await.unwrap());
        assert!(handle.toggle_video().await.unwrap());

        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.local.audio_enabled);
        assert!(snapshot.local.video_enabled);
        assert!(snapshot.presenter.is_none());

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_chat_echoes_locally() {
        let fx = Fixture::new();
        let (handle, _task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let sent = handle.send_chat("hello").await.unwrap();
        assert_eq!(sent.sender_id, "alice");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.transcript, vec![sent]);
        assert_eq!(snapshot.unread, 0);

        assert!(matches!(
            handle.send_chat("   ").await,
            Err(CallError::InvalidRequest(_))
        ));

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_share_denied_leaves_state_unchanged() {
        let fx = Fixture {
            devices: Arc::new(SyntheticDevices::new().with_screen(DeviceAvailability::Denied)),
            ..Fixture::new()
        };
        let (handle, _task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(
            handle.start_share().await,
            Err(CallError::ScreenCaptureDenied)
        ));
        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.local.screen_sharing);
        assert_eq!(fx.devices.live_tracks(TrackKind::Video), 1);

        // Stop while not sharing is a no-op
        handle.stop_share().await.unwrap();
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_share_swaps_camera_for_screen_and_back() {
        let fx = Fixture::new();
        let (handle, _task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        handle.start_share().await.unwrap();
        handle.start_share().await.unwrap();
        assert_eq!(fx.devices.live_tracks(TrackKind::Screen), 1);
        assert_eq!(fx.devices.live_tracks(TrackKind::Video), 0);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.presenter.unwrap().participant_id, "alice");

        handle.stop_share().await.unwrap();
        assert_eq!(fx.devices.live_tracks(TrackKind::Screen), 0);
        assert_eq!(fx.devices.live_tracks(TrackKind::Video), 1);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_os_ended_share_emits_share_ended() {
        let fx = Fixture::new();
        let (handle, _task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut events = handle.subscribe();

        handle.start_share().await.unwrap();
        fx.devices.end_screen_capture();

        let ended = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if matches!(events.recv().await, Ok(SessionEvent::ShareEnded)) {
                    break;
                }
            }
        })
        .await;
        assert!(ended.is_ok());
        assert!(!handle.snapshot().await.unwrap().local.screen_sharing);
        assert_eq!(fx.devices.live_tracks(TrackKind::Video), 1);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_extend_is_host_only() {
        let fx = Fixture::new();
        let (guest, _guest_task) = SessionActor::start(
            params("guest", 600, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(matches!(
            guest.extend(5).await,
            Err(CallError::PermissionDenied(_))
        ));

        let (host, _host_task) = SessionActor::start(
            params("host", 600, true),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(host.extend(5).await.unwrap(), 15);

        guest.stop().await.unwrap();
        host.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit_ends_session_and_writes_record() {
        let fx = Fixture::new();
        let (handle, task) = SessionActor::start(
            params("host", 5, true),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut events = handle.subscribe();

        let result = tokio::time::timeout(Duration::from_secs(10), task).await;
        assert!(result.is_ok());

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Ended { reason: r } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason, Some(EndReason::TimeLimit));
        assert!(!handle.is_live());
        assert!(matches!(handle.extend(1).await, Err(CallError::SessionEnded)));

        let completions = fx.records.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions.first().unwrap().actual_duration_minutes, 1);
        assert!(fx.directory.entries("room-1").is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_reports_running_clock() {
        let fx = Fixture::new();
        let (handle, _task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.clock.phase, ClockPhase::Running);
        assert!(snapshot.live);
        assert!(snapshot.feeds.is_empty());

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancellation_tears_down() {
        let fx = Fixture::new();
        let parent = CancellationToken::new();
        let (handle, task) = SessionActor::start(
            params("alice", 0, false),
            fx.deps(),
            fast_config(),
            parent.clone(),
        )
        .await
        .unwrap();

        parent.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(!handle.is_live());
        assert!(fx.directory.entries("room-1").is_empty());
        handle.stop().await.unwrap();
    }
}
