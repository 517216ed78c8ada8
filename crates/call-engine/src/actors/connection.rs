//! `ConnectionActor` - one per established peer link.
//!
//! Each `ConnectionActor`:
//! - Owns the link's media channel, its data link and the link event stream
//! - Decodes inbound data-link frames and forwards them to the session
//! - Sends frames and swaps the outgoing video track on request
//!
//! # Lifecycle
//!
//! 1. Spawned by the session when a dial or answer settles
//! 2. Reports `MediaReceived`, opens the data link, reports `DataLinkOpened`
//! 3. Runs until the link closes or errors, or the session cancels it

use crate::errors::CallError;
use crate::link::{
    DataLink, EstablishedLink, LinkAddress, LinkError, LinkEvent, LinkPrimitive, MediaChannel,
};
use crate::media::{MediaStream, MediaTrack};
use crate::observability::metrics;
use crate::protocol::{self, DataFrame};

use super::messages::{ConnectionMessage, EngineEvent};

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    link_address: LinkAddress,
    connection_id: u64,
}

impl ConnectionHandle {
    #[must_use]
    pub fn link_address(&self) -> &LinkAddress {
        &self.link_address
    }

    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Send a frame over the data link.
    pub async fn send(&self, frame: DataFrame) -> Result<(), CallError> {
        self.sender
            .send(ConnectionMessage::Send { frame })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))
    }

    /// Swap the outgoing video track and wait for the link to confirm.
    pub async fn replace_track(&self, track: MediaTrack) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::ReplaceTrack {
                track,
                respond_to: tx,
            })
            .await
            .map_err(|_| LinkError::Closed)?;

        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: u64,
    local_address: LinkAddress,
    remote_address: LinkAddress,
    media: Arc<dyn MediaChannel>,
    remote_stream: MediaStream,
    link_events: mpsc::Receiver<LinkEvent>,
    data: Option<Arc<dyn DataLink>>,
    primitive: Arc<dyn LinkPrimitive>,
    /// Session's internal event channel.
    events: mpsc::Sender<EngineEvent>,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Cancellation token (child of the session's token).
    cancel_token: CancellationToken,
    is_closing: bool,
}

impl ConnectionActor {
    /// Spawn a connection actor for an established link.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        link: EstablishedLink,
        connection_id: u64,
        local_address: LinkAddress,
        primitive: Arc<dyn LinkPrimitive>,
        events: mpsc::Sender<EngineEvent>,
        cancel_token: CancellationToken,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let link_address = link.remote.clone();

        let actor = Self {
            connection_id,
            local_address,
            remote_address: link.remote,
            media: link.media,
            remote_stream: link.remote_stream,
            link_events: link.events,
            data: None,
            primitive,
            events,
            receiver,
            cancel_token: cancel_token.clone(),
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionHandle {
            sender,
            cancel_token,
            link_address,
            connection_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "call.connection",
        fields(
            connection_id = self.connection_id,
            local = %self.local_address,
            remote = %self.remote_address
        )
    )]
    async fn run(mut self) {
        debug!(
            target: "call.connection",
            remote = %self.remote_address,
            "ConnectionActor started"
        );

        self.report(EngineEvent::MediaReceived {
            address: self.remote_address.clone(),
            connection_id: self.connection_id,
            stream: self.remote_stream.clone(),
        })
        .await;

        if !self.open_data_link().await {
            return;
        }

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "call.connection",
                        remote = %self.remote_address,
                        "ConnectionActor received cancellation signal"
                    );
                    self.graceful_close("cancelled").await;
                    break;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            self.graceful_close("handle dropped").await;
                            break;
                        }
                    }
                }

                // Handle link events
                event = self.link_events.recv() => {
                    match event {
                        Some(LinkEvent::Data(frame)) => self.handle_data(&frame).await,
                        Some(LinkEvent::Closed) | None => {
                            self.report(EngineEvent::LinkClosed {
                                address: self.remote_address.clone(),
                                connection_id: self.connection_id,
                            })
                            .await;
                            self.graceful_close("remote closed").await;
                            break;
                        }
                        Some(LinkEvent::Error(error)) => {
                            self.report(EngineEvent::LinkError {
                                address: self.remote_address.clone(),
                                connection_id: self.connection_id,
                                error,
                            })
                            .await;
                            self.graceful_close("link error").await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "call.connection",
            remote = %self.remote_address,
            connection_id = self.connection_id,
            "ConnectionActor stopped"
        );
    }

    /// Open the data link. Returns false if the actor should exit.
    async fn open_data_link(&mut self) -> bool {
        let opened = tokio::select! {
            () = self.cancel_token.cancelled() => {
                self.graceful_close("cancelled").await;
                return false;
            }
            opened = self.primitive.open_data_link(&self.local_address, &self.remote_address) => opened,
        };

        match opened {
            Ok(data) => {
                self.data = Some(data);
                self.report(EngineEvent::DataLinkOpened {
                    address: self.remote_address.clone(),
                    connection_id: self.connection_id,
                })
                .await;
                true
            }
            Err(error) => {
                warn!(
                    target: "call.connection",
                    remote = %self.remote_address,
                    error = %error,
                    "Failed to open data link"
                );
                self.report(EngineEvent::LinkError {
                    address: self.remote_address.clone(),
                    connection_id: self.connection_id,
                    error,
                })
                .await;
                self.graceful_close("data link failed").await;
                false
            }
        }
    }

    async fn handle_message(&mut self, message: ConnectionMessage) {
        match message {
            ConnectionMessage::Send { frame } => self.handle_send(&frame).await,

            ConnectionMessage::ReplaceTrack { track, respond_to } => {
                let result = if self.is_closing {
                    Err(LinkError::Closed)
                } else {
                    self.media.replace_video_track(track).await
                };
                let _ = respond_to.send(result);
            }
        }
    }

    async fn handle_send(&mut self, frame: &DataFrame) {
        if self.is_closing {
            warn!(
                target: "call.connection",
                remote = %self.remote_address,
                "Attempted to send frame while closing"
            );
            return;
        }
        let Some(data) = self.data.as_ref() else {
            debug!(target: "call.connection", "No data link yet, frame dropped");
            return;
        };

        let bytes = match protocol::encode(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(target: "call.connection", error = %e, "Failed to encode frame");
                return;
            }
        };

        match data.send(bytes).await {
            Ok(()) => metrics::record_data_frame(frame.kind(), "sent"),
            Err(e) => {
                warn!(
                    target: "call.connection",
                    remote = %self.remote_address,
                    frame_kind = frame.kind(),
                    error = %e,
                    "Data link send failed"
                );
            }
        }
    }

    async fn handle_data(&mut self, frame: &Bytes) {
        match protocol::decode(frame) {
            Ok(frame) => {
                metrics::record_data_frame(frame.kind(), "received");
                self.report(EngineEvent::DataMessage {
                    address: self.remote_address.clone(),
                    connection_id: self.connection_id,
                    frame,
                })
                .await;
            }
            Err(e) => {
                metrics::record_protocol_fault();
                warn!(
                    target: "call.connection",
                    remote = %self.remote_address,
                    error = %e,
                    frame_len = frame.len(),
                    "Dropping malformed data-link frame"
                );
            }
        }
    }

    /// Forward an event to the session. A gone session is not an error.
    async fn report(&self, event: EngineEvent) {
        if self.events.send(event).await.is_err() {
            debug!(
                target: "call.connection",
                remote = %self.remote_address,
                "Session no longer listening"
            );
        }
    }

    /// Gracefully close the connection.
    async fn graceful_close(&mut self, reason: &str) {
        if self.is_closing {
            return;
        }
        self.is_closing = true;

        debug!(
            target: "call.connection",
            remote = %self.remote_address,
            reason = %reason,
            "Closing connection"
        );

        if let Some(data) = self.data.take() {
            data.close().await;
        }
        self.media.close().await;
    }
}
