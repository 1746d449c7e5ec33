//! Consultation call client entry point
//!
//! Joins a room with synthetic media, logs session events, and ends the call
//! on Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Join as the patient through a local relay
//! cargo run --bin consult-call -- \
//!   --relay-url http://localhost:5000 \
//!   --token "$CONSULT_TOKEN" \
//!   --room room-42 --appointment appt-42 --role patient
//!
//! # Skip the WebSocket channel and poll only, with JSON logs
//! cargo run --bin consult-call -- --room room-42 --appointment appt-42 \
//!   --role doctor --no-primary --json-logs
//!
//! # Start from a TOML file; flags override it
//! cargo run --bin consult-call -- --config ./call.toml --room room-42 \
//!   --appointment appt-42 --role doctor
//! ```

use clap::Parser;
use consult_rtc::config::channel_url_for;
use consult_rtc::{
    CallConfig, CallSession, MediaConstraints, ParticipantContext, Role, RoomId, SessionEvent,
};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Consultation call client
///
/// Connects to the signaling relay, joins one consultation room and keeps
/// the call alive until interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay REST base URL
    #[arg(long, env = "CONSULT_RELAY_URL")]
    relay_url: Option<String>,

    /// Persistent channel URL (default: derived from the relay URL)
    #[arg(long, env = "CONSULT_CHANNEL_URL")]
    channel_url: Option<String>,

    /// Bearer token for the relay
    #[arg(long, env = "CONSULT_TOKEN")]
    token: Option<String>,

    /// Room identifier shared with the other participant
    #[arg(long, env = "CONSULT_ROOM")]
    room: String,

    /// Appointment the room belongs to
    #[arg(long, env = "CONSULT_APPOINTMENT")]
    appointment: String,

    /// Role to join as
    #[arg(long, value_enum, env = "CONSULT_ROLE")]
    role: RoleArg,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "CONSULT_STUN_SERVERS")]
    stun: Vec<String>,

    /// TOML configuration file
    #[arg(long, env = "CONSULT_CONFIG")]
    config: Option<PathBuf>,

    /// Join without a camera
    #[arg(long, default_value_t = false)]
    audio_only: bool,

    /// Never try the persistent channel
    #[arg(long, default_value_t = false)]
    no_primary: bool,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "CONSULT_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum RoleArg {
    Doctor,
    Patient,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Doctor => Role::Doctor,
            RoleArg::Patient => Role::Patient,
        }
    }
}

fn build_config(args: &Args) -> consult_rtc::Result<CallConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            CallConfig::from_file(path)?
        }
        None => CallConfig::default(),
    };

    // Explicit flags take precedence over the file
    if let Some(relay_url) = &args.relay_url {
        config.relay_url = relay_url.clone();
        config.channel_url = channel_url_for(relay_url);
    }
    if let Some(channel_url) = &args.channel_url {
        config.channel_url = channel_url.clone();
    }
    if let Some(token) = &args.token {
        config.token = token.clone();
    }
    if !args.stun.is_empty() {
        config.stun_servers = args.stun.clone();
    }
    if args.audio_only {
        config.media = MediaConstraints::audio_only();
    }
    if args.no_primary {
        config.transport.primary_enabled = false;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,consult_rtc=debug"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::LocalStream(media) => info!(
            stream = media.stream_id(),
            video = media.has_video(),
            "Local media ready"
        ),
        SessionEvent::RemoteStream(media) => info!(
            stream = ?media.stream_id(),
            tracks = media.tracks().len(),
            "Remote media updated"
        ),
        SessionEvent::PeerConnected => info!("Peer connected"),
        SessionEvent::PeerDisconnected { permanent } => {
            warn!(permanent, "Peer disconnected")
        }
        SessionEvent::Reconnecting => info!("Reconnecting"),
        SessionEvent::RemoteMediaState { kind, enabled } => {
            info!(%kind, enabled, "Peer toggled media")
        }
        SessionEvent::Error(message) => error!(%message, "Call error"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!(
        version = consult_rtc::version(),
        room = %args.room,
        role = ?args.role,
        "consult-call starting"
    );

    let config = build_config(&args)?;
    info!(
        relay_url = %config.relay_url,
        channel_url = %config.channel_url,
        primary = config.transport.primary_enabled,
        stun_servers = ?config.stun_servers,
        audio_only = !config.media.video,
        "Call configuration"
    );

    let session = CallSession::new(
        config,
        RoomId::new(args.room.clone()),
        ParticipantContext {
            appointment_id: args.appointment.clone(),
            role: args.role.into(),
        },
    )?;

    let mut events = session.subscribe();
    session.initialize().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, ending call");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.end_call().await;
    let stats = session.stats();
    info!(
        phase = %stats.phase,
        generation = stats.generation,
        transport = %stats.transport,
        "Call ended"
    );
    Ok(())
}
