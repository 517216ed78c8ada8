//! Call Engine loopback harness
//!
//! Starts N local participants in one room against a real signaling
//! directory. Media is synthetic and links go through the in-process hub, so
//! the whole mesh runs in this process.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Build the directory client and, if configured, the meeting-record client
//! 3. Start one session per local participant (the first one hosts)
//! 4. Wait for Ctrl+C or for every session to end
//! 5. Stop every session

#![warn(clippy::pedantic)]

use std::sync::Arc;

use call_engine::actors::{SessionActor, SessionDeps, SessionEvent, SessionHandle, SessionParams};
use call_engine::config::Config;
use call_engine::directory::{HttpDirectory, SignalingDirectory};
use call_engine::link::MemoryLinkHub;
use call_engine::media::SyntheticDevices;
use call_engine::records::{HttpMeetingRecords, MeetingRecords};
use futures::future::join_all;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_engine=debug,call=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting call engine loopback harness");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        directory_url = %config.directory_url,
        room_id = %config.room_id,
        local_participants = config.local_participants,
        duration_seconds = config.duration_seconds,
        records_enabled = config.meeting_records_url.is_some(),
        "Configuration loaded successfully"
    );

    let directory: Arc<dyn SignalingDirectory> =
        Arc::new(HttpDirectory::new(config.directory_url.clone(), config.http_timeout)?);
    let records: Option<Arc<dyn MeetingRecords>> = match &config.meeting_records_url {
        Some(url) => Some(Arc::new(HttpMeetingRecords::new(
            url.clone(),
            config.http_timeout,
        )?)),
        None => None,
    };
    let hub = Arc::new(MemoryLinkHub::new());
    let shutdown_token = CancellationToken::new();

    let mut sessions: Vec<SessionHandle> = Vec::new();
    let mut tasks = Vec::new();
    for n in 1..=config.local_participants {
        let participant_id = format!("local-{n}");
        let params = SessionParams {
            room_id: config.room_id.clone(),
            participant_id: participant_id.clone(),
            display_name: format!("Local {n}"),
            duration_budget_seconds: config.duration_seconds,
            is_host: n == 1,
            meeting_id: config.meeting_id.clone(),
        };
        let deps = SessionDeps {
            directory: Arc::clone(&directory),
            link: hub.clone(),
            devices: Arc::new(SyntheticDevices::new()),
            records: records.clone(),
        };

        match SessionActor::start(params, deps, config.engine.clone(), shutdown_token.clone())
            .await
        {
            Ok((handle, task)) => {
                spawn_event_logger(&handle);
                sessions.push(handle);
                tasks.push(task);
            }
            Err(e) => {
                error!(participant_id = %participant_id, error = %e, "Failed to start session");
                shutdown_token.cancel();
                join_all(tasks).await;
                return Err(e.into());
            }
        }
    }

    info!(
        sessions = sessions.len(),
        "Call engine running - press Ctrl+C to shutdown"
    );
    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, leaving call...");
        }
        _ = join_all(tasks.iter_mut()) => {
            info!("All sessions ended");
        }
    }

    for handle in &sessions {
        if let Err(e) = handle.stop().await {
            warn!(participant_id = %handle.participant_id(), error = %e, "Session stop error");
        }
    }
    shutdown_token.cancel();

    info!("Call engine shutdown complete");
    Ok(())
}

/// Log the session events one participant would render.
fn spawn_event_logger(handle: &SessionHandle) {
    let participant_id = handle.participant_id().to_string();
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::PeerConnected { link_address, .. } => {
                    info!(participant_id = %participant_id, peer = %link_address, "Peer connected");
                }
                SessionEvent::PeerDisconnected { link_address } => {
                    info!(participant_id = %participant_id, peer = %link_address, "Peer left");
                }
                SessionEvent::TimeWarning { remaining_seconds } => {
                    warn!(
                        participant_id = %participant_id,
                        remaining_seconds = remaining_seconds,
                        "Meeting ending soon"
                    );
                }
                SessionEvent::Error { message } => {
                    error!(participant_id = %participant_id, message = %message, "Call error");
                }
                SessionEvent::Ended { reason } => {
                    info!(participant_id = %participant_id, reason = %reason, "Session ended");
                    break;
                }
                other => {
                    debug!(participant_id = %participant_id, event = ?other, "Session event");
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
