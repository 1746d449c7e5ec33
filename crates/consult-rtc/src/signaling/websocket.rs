//! Persistent channel transport (WebSocket)
//!
//! One duplex connection per session. The relay requires an `authenticate`
//! handshake before it accepts room operations; the identity it returns is
//! ours for the rest of the session. A dropped connection is re-opened with
//! backoff, re-authenticated and re-joined to the current room.

use super::protocol::{
    ChannelEvent, JoinAck, ParticipantContext, ParticipantIdentity, RoomId, RoomStatus,
    SignalFrame, SignalingEnvelope,
};
use super::relay_api::RelayApi;
use super::{EventSender, SignalTransport, TransportEvent, TransportKind};
use crate::config::CallConfig;
use crate::peer::lifecycle::BackoffPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Persistent channel signaling transport
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

struct Inner {
    /// Channel URL (ws:// or wss://)
    url: String,

    /// Bearer token used in the `authenticate` handshake
    token: String,

    /// REST client for room status queries
    api: RelayApi,

    /// Inbound event sink
    events: EventSender,

    /// Time allowed for each handshake response
    handshake_timeout: Duration,

    /// Re-open policy after an unexpected drop
    reopen: BackoffPolicy,

    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    /// Outgoing frame sender of the current connection
    tx: Option<mpsc::UnboundedSender<Message>>,

    /// Identity returned by the last successful handshake
    identity: Option<ParticipantIdentity>,

    /// Room to re-join after a re-open
    room: Option<RoomId>,

    pending_auth: Option<oneshot::Sender<Result<ParticipantIdentity>>>,
    pending_join: Option<oneshot::Sender<Result<()>>>,

    /// Incremented per opened connection; readers of older ones stay quiet
    connection_id: u64,

    /// Set by `disconnect`; suppresses re-open
    closing: bool,

    /// Receiver task of the current connection; the sender task ends with `tx`
    reader: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Create a new persistent channel transport
    ///
    /// # Arguments
    ///
    /// * `config` - Call configuration (channel URL, token, timeouts)
    /// * `events` - Sink for inbound messages and presence events
    pub fn new(config: &CallConfig, events: EventSender) -> Result<Self> {
        let api = RelayApi::new(
            &config.relay_url,
            &config.token,
            config.transport.request_timeout(),
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                url: config.channel_url.clone(),
                token: config.token.clone(),
                api,
                events,
                handshake_timeout: config.transport.primary_connect_timeout(),
                reopen: config.transport.send_retry.clone(),
                state: Mutex::new(ChannelState::default()),
            }),
        })
    }

    /// Identity from the last handshake
    pub fn identity(&self) -> Option<ParticipantIdentity> {
        self.inner.state.lock().identity.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().tx.is_some()
    }
}

impl Inner {
    /// Open a connection, start its tasks and authenticate
    async fn open(self: &Arc<Self>) -> Result<ParticipantIdentity> {
        info!("Connecting to signaling channel: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = oneshot::channel();

        let connection_id = {
            let mut state = self.state.lock();
            if state.closing {
                return Err(Error::SessionEnded("Channel closed during connect".to_string()));
            }
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            state.connection_id += 1;
            state.tx = Some(tx.clone());
            state.pending_auth = Some(auth_tx);
            tokio::spawn(Self::sender_task(write, rx));
            state.reader = Some(tokio::spawn(Self::receiver_task(
                read,
                self.clone(),
                state.connection_id,
            )));
            state.connection_id
        };

        let frame = ChannelEvent::Authenticate {
            token: self.token.clone(),
        }
        .to_json()?;
        tx.send(Message::Text(frame))
            .map_err(|e| Error::WebSocketError(format!("Failed to send authenticate: {}", e)))?;

        let identity = match tokio::time::timeout(self.handshake_timeout, auth_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(Error::WebSocketError(
                    "Channel closed during authentication".to_string(),
                ))
            }
            Err(_) => {
                return Err(Error::OperationTimeout(
                    "No authentication response".to_string(),
                ))
            }
        };

        info!(
            "Signaling channel authenticated as {} ({}), connection {}",
            identity.user_id, identity.role, connection_id
        );
        self.state.lock().identity = Some(identity.clone());
        Ok(identity)
    }

    /// Sender task: forwards frames from the channel to the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: dispatches inbound frames until the socket ends
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        inner: Arc<Inner>,
        connection_id: u64,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if let Err(e) = inner.handle_frame(&text) {
                        warn!("Failed to handle signaling frame: {}", e);
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Signaling channel closed by relay");
                    break;
                }
                Err(e) => {
                    warn!("Signaling channel error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        debug!("Receiver task terminated");
        inner.connection_lost(connection_id);
    }

    fn handle_frame(&self, text: &str) -> Result<()> {
        let event = ChannelEvent::from_json(text)?;
        let mut state = self.state.lock();

        match event {
            ChannelEvent::Connected { sid } => {
                debug!("Channel session id: {:?}", sid);
            }
            ChannelEvent::Authenticated {
                user_id, user_role, ..
            } => {
                let identity = ParticipantIdentity {
                    user_id,
                    role: user_role,
                };
                if let Some(waiter) = state.pending_auth.take() {
                    let _ = waiter.send(Ok(identity));
                }
            }
            ChannelEvent::AuthError { error } => {
                warn!("Channel authentication rejected: {}", error);
                if let Some(waiter) = state.pending_auth.take() {
                    let _ = waiter.send(Err(Error::AuthenticationFailed(error)));
                }
            }
            ChannelEvent::RoomJoined { room_id, .. } => {
                debug!("Joined room {} on signaling channel", room_id);
                if let Some(waiter) = state.pending_join.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
            ChannelEvent::RoomError { error } => {
                warn!("Room operation rejected: {}", error);
                if let Some(waiter) = state.pending_join.take() {
                    let _ = waiter.send(Err(Error::RoomError(error)));
                }
            }
            ChannelEvent::WebrtcSignal(frame) => {
                let Some(me) = state.identity.as_ref() else {
                    debug!("Dropping signal received before authentication");
                    return Ok(());
                };
                if frame.signal.is_for(&me.user_id) {
                    let _ = self.events.send(TransportEvent::Message(frame.signal));
                }
            }
            ChannelEvent::UserJoined { user_id, user_role } => {
                let is_self = state.identity.as_ref().map(|me| me.user_id == user_id);
                if is_self != Some(true) {
                    info!("Participant {} ({}) joined", user_id, user_role);
                    let _ = self.events.send(TransportEvent::PeerJoined(ParticipantIdentity {
                        user_id,
                        role: user_role,
                    }));
                }
            }
            ChannelEvent::UserLeft { user_id } => {
                let is_self = state.identity.as_ref().map(|me| me.user_id == user_id);
                if is_self != Some(true) {
                    info!("Participant {} left", user_id);
                    let _ = self.events.send(TransportEvent::PeerLeft {
                        user_id,
                        role: None,
                    });
                }
            }
            ChannelEvent::SignalError { error } => {
                warn!("Relay rejected signal: {}", error);
            }
            other => {
                debug!("Ignoring client-bound frame {:?}", other);
            }
        }

        Ok(())
    }

    fn connection_lost(self: &Arc<Self>, connection_id: u64) {
        let mut state = self.state.lock();
        if state.connection_id != connection_id || state.closing {
            return;
        }
        state.tx = None;
        state.pending_auth = None;
        state.pending_join = None;
        drop(state);

        warn!("Signaling channel dropped, re-opening");
        tokio::spawn(Self::reopen_loop(self.clone()));
    }

    fn reopen_loop(inner: Arc<Inner>) -> BoxFuture<'static, ()> {
        async move {
            for attempt in 0..inner.reopen.max_attempts {
                tokio::time::sleep(inner.reopen.delay(attempt)).await;
                if inner.state.lock().closing {
                    return;
                }

                match inner.open().await {
                    Ok(_) => {
                        let room = inner.state.lock().room.clone();
                        if let Some(room) = room {
                            if let Err(e) = inner.send_frame(ChannelEvent::JoinRoom {
                                room_id: room.to_string(),
                            }) {
                                warn!("Failed to re-join {} after re-open: {}", room, e);
                            }
                        }
                        info!("Signaling channel re-opened after {} attempts", attempt + 1);
                        return;
                    }
                    Err(e) => {
                        warn!("Re-open attempt {} failed: {}", attempt + 1, e);
                    }
                }
            }
            if inner.state.lock().closing {
                return;
            }
            warn!(
                "Giving up re-opening signaling channel after {} attempts",
                inner.reopen.max_attempts
            );
            let _ = inner.events.send(TransportEvent::PrimaryLost);
        }
        .boxed()
    }

    fn send_frame(&self, event: ChannelEvent) -> Result<()> {
        let json = event.to_json()?;
        let state = self.state.lock();
        let tx = state
            .tx
            .as_ref()
            .ok_or_else(|| Error::WebSocketError("Signaling channel not connected".to_string()))?;
        tx.send(Message::Text(json))
            .map_err(|e| Error::WebSocketError(format!("Failed to queue frame: {}", e)))
    }
}

#[async_trait]
impl SignalTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Primary
    }

    async fn connect(&self) -> Result<()> {
        self.inner.state.lock().closing = false;
        self.inner.open().await.map(|_| ())
    }

    async fn join(&self, room: &RoomId, ctx: &ParticipantContext) -> Result<JoinAck> {
        let identity = self
            .identity()
            .ok_or_else(|| Error::RoomError("Not authenticated".to_string()))?;

        let (join_tx, join_rx) = oneshot::channel();
        self.inner.state.lock().pending_join = Some(join_tx);
        self.inner.send_frame(ChannelEvent::JoinRoom {
            room_id: room.to_string(),
        })?;

        match tokio::time::timeout(self.inner.handshake_timeout, join_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(Error::WebSocketError(
                    "Channel closed during room join".to_string(),
                ))
            }
            Err(_) => return Err(Error::OperationTimeout("No room_joined response".to_string())),
        }
        self.inner.state.lock().room = Some(room.clone());

        let peer_present = match self.inner.api.status(room).await {
            Ok(status) => status.is_present(ctx.role.counterpart()),
            Err(e) => {
                warn!("Room status unavailable after join: {}", e);
                false
            }
        };

        Ok(JoinAck {
            identity,
            peer_present,
        })
    }

    async fn leave(&self, room: &RoomId) -> Result<()> {
        self.inner.state.lock().room = None;
        self.inner.send_frame(ChannelEvent::LeaveRoom {
            room_id: room.to_string(),
        })
    }

    async fn send(&self, room: &RoomId, envelope: &SignalingEnvelope) -> Result<()> {
        self.inner
            .send_frame(ChannelEvent::WebrtcSignal(SignalFrame {
                room_id: Some(room.to_string()),
                target_id: envelope.target_id.clone(),
                from_user_id: None,
                from_user_role: None,
                signal: envelope.clone(),
            }))
    }

    async fn room_status(&self, room: &RoomId) -> Result<RoomStatus> {
        self.inner.api.status(room).await
    }

    async fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        state.closing = true;
        if let Some(tx) = state.tx.take() {
            let _ = tx.send(Message::Close(None));
        }
        state.pending_auth = None;
        state.pending_join = None;
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        debug!("Signaling channel disconnected");
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.closing = true;
        state.tx = None;
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
    }
}
