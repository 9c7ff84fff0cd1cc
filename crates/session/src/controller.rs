//! The session state machine.
//!
//! Every stimulus (signaling frames, link events, user commands) becomes an
//! [`Input`] consumed by one task, so state transitions never race.
//! [`SessionController::handle`] is the only transition function; the
//! state machine tests drive it directly, production wraps it in
//! [`SessionController::run`].

use std::collections::HashMap;
use std::mem;
use std::ops::ControlFlow;
use std::sync::Arc;

use parley_crypto::{derive_room_key, Envelope, MessageCipher};
use parley_proto::{generate_participant_id, normalize_room_code, Frame, UserInfo};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, warn};
use webrtc::track::track_local::TrackLocal;

use crate::chat::ChatMessage;
use crate::error::SessionError;
use crate::link::{LinkEvent, LinkFactory, LinkHealth, MediaKind, OutgoingTrack, PeerLink};
use crate::signaling::SignalSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// First into the room; creates the data channel and sends the offer.
    Initiator,
    /// Waits for the remote offer and answers it.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Joined, waiting for the relay to assign a role.
    AwaitingRole,
    CreatingOffer,
    AwaitingAnswer,
    AwaitingOffer,
    CreatingAnswer,
    /// Descriptions exchanged, ICE still working.
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// User-driven requests, injected through the [`SessionHandle`].
pub enum Command {
    SendChat(String),
    /// Swap the outbound track of one kind in place. `None` withdraws it.
    /// Camera toggles, screen share, and processed-video effects all go
    /// through here; the negotiated sender is reused, no fresh offer.
    ReplaceTrack {
        kind: MediaKind,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    },
    Leave,
}

/// Everything the state machine reacts to.
pub enum Input {
    Signal(Frame),
    Link(LinkEvent),
    Command(Command),
    SignalClosed,
}

/// What the session reports back to the embedding application.
#[derive(Debug)]
pub enum SessionEvent {
    StatusChanged(ConnectionStatus),
    PeerJoined { user: UserInfo },
    PeerLeft { user_id: String },
    /// Local echo; emitted before any delivery attempt, so the sender
    /// always sees their own message even if both transports are down.
    ChatSent(ChatMessage),
    ChatReceived(ChatMessage),
    RemoteTrackAdded(MediaKind),
    Warning(SessionError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_code: String,
    pub display_name: String,
    pub participant_id: String,
}

impl SessionConfig {
    pub fn new(room_code: &str, display_name: &str) -> Self {
        Self {
            room_code: normalize_room_code(room_code),
            display_name: display_name.to_string(),
            participant_id: generate_participant_id(),
        }
    }
}

/// Cheap clonable handle for feeding commands into a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<Input>,
}

impl SessionHandle {
    pub fn send_chat(&self, text: impl Into<String>) -> bool {
        self.inputs
            .send(Input::Command(Command::SendChat(text.into())))
            .is_ok()
    }

    pub fn replace_track(
        &self,
        kind: MediaKind,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> bool {
        self.inputs
            .send(Input::Command(Command::ReplaceTrack { kind, track }))
            .is_ok()
    }

    pub fn leave(&self) -> bool {
        self.inputs.send(Input::Command(Command::Leave)).is_ok()
    }
}

pub struct SessionController {
    config: SessionConfig,
    state: SessionState,
    role: SessionRole,
    signal: Arc<dyn SignalSink>,
    links: Arc<dyn LinkFactory>,
    link: Option<Arc<dyn PeerLink>>,
    cipher: MessageCipher,
    /// Remote candidates that arrived before the remote description was
    /// applied. Drained in arrival order once it is.
    pending_candidates: Vec<Value>,
    remote_described: bool,
    remote_user: Option<UserInfo>,
    outgoing_tracks: HashMap<MediaKind, Arc<dyn TrackLocal + Send + Sync>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    inputs: mpsc::UnboundedSender<Input>,
    inputs_rx: Option<mpsc::UnboundedReceiver<Input>>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        signal: Arc<dyn SignalSink>,
        links: Arc<dyn LinkFactory>,
    ) -> (
        Self,
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        Self::with_channels(config, signal, links, inputs_tx, inputs_rx)
    }

    /// Constructor for callers that created the input channel up front
    /// (the signaling transport needs the sender before the controller
    /// exists).
    pub fn with_channels(
        config: SessionConfig,
        signal: Arc<dyn SignalSink>,
        links: Arc<dyn LinkFactory>,
        inputs_tx: mpsc::UnboundedSender<Input>,
        inputs_rx: mpsc::UnboundedReceiver<Input>,
    ) -> (
        Self,
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            inputs: inputs_tx.clone(),
        };
        let controller = Self {
            config,
            state: SessionState::Idle,
            role: SessionRole::Responder,
            signal,
            links,
            link: None,
            cipher: MessageCipher::empty(),
            pending_candidates: Vec::new(),
            remote_described: false,
            remote_user: None,
            outgoing_tracks: HashMap::new(),
            events: events_tx,
            inputs: inputs_tx,
            inputs_rx: Some(inputs_rx),
        };
        (controller, handle, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Derive the room key and announce ourselves to the relay.
    pub async fn join(&mut self) -> Result<(), SessionError> {
        let room_code = self.config.room_code.clone();
        // PBKDF2 at 100k iterations is a real chunk of CPU.
        let key = task::spawn_blocking(move || derive_room_key(&room_code))
            .await
            .map_err(|err| SessionError::Internal(format!("key derivation task: {err}")))?;
        self.cipher.install(&key);

        self.signal.send(&Frame::Join {
            room_id: self.config.room_code.clone(),
            user: self.local_user(),
        })?;
        self.state = SessionState::AwaitingRole;
        self.emit(SessionEvent::StatusChanged(ConnectionStatus::Connecting));
        Ok(())
    }

    /// Consume inputs until the session leaves or every sender is gone.
    pub async fn run(mut self) {
        let Some(mut inputs) = self.inputs_rx.take() else {
            return;
        };
        while let Some(input) = inputs.recv().await {
            if let ControlFlow::Break(()) = self.handle(input).await {
                break;
            }
        }
    }

    /// The single transition function. Errors become [`SessionEvent::Warning`]s;
    /// only `Leave` (or a closed signaling socket outside a live call) ends
    /// the session.
    pub async fn handle(&mut self, input: Input) -> ControlFlow<()> {
        match input {
            Input::Signal(frame) => {
                if let Err(err) = self.on_frame(frame).await {
                    self.emit_warning(err);
                }
                ControlFlow::Continue(())
            }
            Input::Link(event) => {
                if let Err(err) = self.on_link_event(event).await {
                    self.emit_warning(err);
                }
                ControlFlow::Continue(())
            }
            Input::Command(Command::Leave) => {
                self.shutdown().await;
                ControlFlow::Break(())
            }
            Input::Command(Command::SendChat(text)) => {
                if let Err(err) = self.send_chat(text).await {
                    self.emit_warning(err);
                }
                ControlFlow::Continue(())
            }
            Input::Command(Command::ReplaceTrack { kind, track }) => {
                if let Err(err) = self.replace_track(kind, track).await {
                    self.emit_warning(err);
                }
                ControlFlow::Continue(())
            }
            Input::SignalClosed => {
                if self.state == SessionState::Closed {
                    return ControlFlow::Break(());
                }
                if self.state == SessionState::Connected {
                    // The direct link outlives the relay connection.
                    self.emit_warning(SessionError::Signaling(
                        "relay connection lost; continuing peer-to-peer".to_string(),
                    ));
                    ControlFlow::Continue(())
                } else {
                    self.shutdown().await;
                    ControlFlow::Break(())
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        match frame {
            Frame::RoomJoined { is_initiator, .. } => self.on_role_assigned(is_initiator).await,
            Frame::UserJoined { user, .. } => self.on_peer_joined(user).await,
            Frame::UserLeft { user_id, .. } => {
                self.on_peer_left(user_id).await;
                Ok(())
            }
            Frame::Offer { offer, .. } => self.on_remote_offer(offer).await,
            Frame::Answer { answer, .. } => self.on_remote_answer(answer).await,
            Frame::IceCandidate { candidate, .. } => self.on_remote_candidate(candidate).await,
            Frame::ChatMessage { encrypted, .. } => self.on_relay_chat(&encrypted),
            Frame::Error { message } => {
                warn!(%message, "relay reported an error");
                Err(SessionError::Signaling(message))
            }
            // Client-to-relay frames never travel toward us.
            other => {
                debug!(kind = other.kind(), "ignoring unexpected inbound frame");
                Ok(())
            }
        }
    }

    async fn on_role_assigned(&mut self, is_initiator: bool) -> Result<(), SessionError> {
        if self.state != SessionState::AwaitingRole {
            debug!(state = ?self.state, "room_joined outside of join handshake, ignoring");
            return Ok(());
        }
        if is_initiator {
            self.role = SessionRole::Initiator;
            // A peer may have joined while we were reconnecting.
            if self.remote_user.is_some() {
                return self.begin_offer().await;
            }
        } else {
            self.role = SessionRole::Responder;
            self.state = SessionState::AwaitingOffer;
        }
        Ok(())
    }

    async fn on_peer_joined(&mut self, user: UserInfo) -> Result<(), SessionError> {
        debug!(peer = %user.name, "peer joined the room");
        self.remote_user = Some(user.clone());
        self.emit(SessionEvent::PeerJoined { user });
        if self.role == SessionRole::Initiator && self.state == SessionState::AwaitingRole {
            return self.begin_offer().await;
        }
        Ok(())
    }

    /// Initiator path: build the link, open the chat channel before the
    /// offer so it rides the initial negotiation, then send the offer.
    /// Any failure rolls back to a clean pre-attempt state.
    async fn begin_offer(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::CreatingOffer;
        match self.try_offer().await {
            Ok(()) => {
                self.state = SessionState::AwaitingAnswer;
                Ok(())
            }
            Err(err) => {
                self.discard_link().await;
                self.state = SessionState::AwaitingRole;
                Err(err)
            }
        }
    }

    async fn try_offer(&mut self) -> Result<(), SessionError> {
        let link = self.ensure_link().await?;
        link.open_chat_channel().await?;
        let offer = link.create_offer().await?;
        self.signal.send(&Frame::Offer {
            offer,
            room_id: self.config.room_code.clone(),
            user_id: self.config.participant_id.clone(),
        })
    }

    async fn on_remote_offer(&mut self, offer: Value) -> Result<(), SessionError> {
        match self.state {
            SessionState::AwaitingOffer | SessionState::AwaitingRole | SessionState::Idle => {}
            other => {
                debug!(state = ?other, "ignoring offer in current state");
                return Ok(());
            }
        }
        self.role = SessionRole::Responder;
        self.state = SessionState::CreatingAnswer;
        match self.try_answer(&offer).await {
            Ok(()) => {
                self.state = SessionState::Connecting;
                self.flush_pending_candidates().await;
                Ok(())
            }
            Err(err) => {
                self.discard_link().await;
                self.state = SessionState::AwaitingOffer;
                Err(err)
            }
        }
    }

    async fn try_answer(&mut self, offer: &Value) -> Result<(), SessionError> {
        let link = self.ensure_link().await?;
        let answer = link.accept_offer(offer).await?;
        self.remote_described = true;
        self.signal.send(&Frame::Answer {
            answer,
            room_id: self.config.room_code.clone(),
            user_id: self.config.participant_id.clone(),
        })
    }

    async fn on_remote_answer(&mut self, answer: Value) -> Result<(), SessionError> {
        if self.state != SessionState::AwaitingAnswer {
            debug!(state = ?self.state, "ignoring answer in current state");
            return Ok(());
        }
        let link = self
            .link
            .clone()
            .ok_or_else(|| SessionError::PeerConnection("answer without a link".to_string()))?;
        link.accept_answer(&answer).await?;
        self.remote_described = true;
        self.state = SessionState::Connecting;
        self.flush_pending_candidates().await;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: Option<Value>) -> Result<(), SessionError> {
        // Null candidate is the remote's end-of-candidates signal.
        let Some(candidate) = candidate else {
            return Ok(());
        };
        match &self.link {
            Some(link) if self.remote_described => link.add_remote_candidate(&candidate).await,
            _ => {
                self.pending_candidates.push(candidate);
                Ok(())
            }
        }
    }

    /// Apply queued candidates in arrival order. One bad candidate is a
    /// warning, not a session failure.
    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let Some(link) = self.link.clone() else {
            return;
        };
        for candidate in mem::take(&mut self.pending_candidates) {
            if let Err(err) = link.add_remote_candidate(&candidate).await {
                warn!("queued candidate rejected: {err}");
                self.emit_warning(err);
            }
        }
    }

    async fn on_peer_left(&mut self, user_id: String) {
        debug!(%user_id, "peer left the room");
        self.remote_user = None;
        self.emit(SessionEvent::PeerLeft { user_id });
        self.reset_after_peer_loss().await;
    }

    /// Back to a clean waiting state. The survivor becomes the initiator
    /// for whoever joins next.
    async fn reset_after_peer_loss(&mut self) {
        self.discard_link().await;
        self.role = SessionRole::Initiator;
        self.state = SessionState::AwaitingRole;
        self.emit(SessionEvent::StatusChanged(ConnectionStatus::Disconnected));
    }

    async fn discard_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.pending_candidates.clear();
        self.remote_described = false;
    }

    async fn on_link_event(&mut self, event: LinkEvent) -> Result<(), SessionError> {
        match event {
            LinkEvent::LocalCandidate(candidate) => self.signal.send(&Frame::IceCandidate {
                candidate: Some(candidate),
                room_id: self.config.room_code.clone(),
                user_id: self.config.participant_id.clone(),
            }),
            LinkEvent::Health(LinkHealth::Connecting) => {
                debug!("link connecting");
                Ok(())
            }
            LinkEvent::Health(LinkHealth::Connected) | LinkEvent::ChannelOpen => {
                self.mark_connected().await;
                Ok(())
            }
            LinkEvent::Health(LinkHealth::Disconnected) => {
                if self.state != SessionState::Closed && self.link.is_some() {
                    self.reset_after_peer_loss().await;
                }
                Ok(())
            }
            LinkEvent::ChannelClosed => {
                debug!("chat channel closed");
                Ok(())
            }
            LinkEvent::ChannelMessage(bytes) => self.on_channel_message(&bytes),
            LinkEvent::RemoteTrack(kind) => {
                self.emit(SessionEvent::RemoteTrackAdded(kind));
                Ok(())
            }
        }
    }

    async fn mark_connected(&mut self) {
        if self.state == SessionState::Connected || self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Connected;
        self.emit(SessionEvent::StatusChanged(ConnectionStatus::Connected));
        // Candidates that raced ahead of the remote description may still
        // be queued if the description path never flushed them.
        self.flush_pending_candidates().await;
    }

    /// Local echo first, then the direct channel, then the relay fallback.
    async fn send_chat(&mut self, text: String) -> Result<(), SessionError> {
        let message = ChatMessage::new(self.local_user(), text);
        self.emit(SessionEvent::ChatSent(message.clone()));

        let envelope = self.cipher.encrypt(&message)?;

        if let Some(link) = &self.link {
            if link.chat_ready() {
                let bytes = serde_json::to_vec(&envelope)
                    .map_err(|err| SessionError::Internal(err.to_string()))?;
                return link.send_chat(&bytes).await;
            }
        }

        if self.signal.is_open() {
            return self.signal.send(&Frame::ChatMessage {
                encrypted: envelope,
                room_id: self.config.room_code.clone(),
                user_id: self.config.participant_id.clone(),
            });
        }

        Err(SessionError::NoTransportAvailable)
    }

    fn on_channel_message(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|err| SessionError::Internal(format!("bad channel payload: {err}")))?;
        let message: ChatMessage = self.cipher.decrypt(&envelope)?;
        self.emit(SessionEvent::ChatReceived(message));
        Ok(())
    }

    fn on_relay_chat(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        // Once the direct channel carries chat, the relay copy of the same
        // traffic pattern is ignored rather than double-delivered.
        if let Some(link) = &self.link {
            if link.chat_ready() {
                debug!("dropping relayed chat while the direct channel is up");
                return Ok(());
            }
        }
        let message: ChatMessage = self.cipher.decrypt(envelope)?;
        self.emit(SessionEvent::ChatReceived(message));
        Ok(())
    }

    async fn replace_track(
        &mut self,
        kind: MediaKind,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<(), SessionError> {
        match &track {
            Some(t) => {
                self.outgoing_tracks.insert(kind, t.clone());
            }
            None => {
                self.outgoing_tracks.remove(&kind);
            }
        }
        // Without a live link the staged set is all that matters; the next
        // link picks it up at construction.
        if let Some(link) = &self.link {
            link.replace_outgoing_track(kind, track).await?;
        }
        Ok(())
    }

    /// Teardown order matters: channel and connection first, then the
    /// goodbye over signaling, then the socket itself.
    async fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        if self.signal.is_open() && self.state != SessionState::Idle {
            let _ = self.signal.send(&Frame::Leave {
                room_id: self.config.room_code.clone(),
                user_id: self.config.participant_id.clone(),
            });
        }
        self.signal.close();
        self.pending_candidates.clear();
        self.remote_described = false;
        self.state = SessionState::Closed;
        self.emit(SessionEvent::StatusChanged(ConnectionStatus::Disconnected));
    }

    async fn ensure_link(&mut self) -> Result<Arc<dyn PeerLink>, SessionError> {
        if let Some(link) = &self.link {
            return Ok(link.clone());
        }
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<LinkEvent>();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if inputs.send(Input::Link(event)).is_err() {
                    break;
                }
            }
        });
        let tracks: Vec<OutgoingTrack> = self
            .outgoing_tracks
            .iter()
            .map(|(kind, track)| (*kind, track.clone()))
            .collect();
        let link = self.links.open(&tracks, events_tx).await?;
        self.link = Some(link.clone());
        Ok(link)
    }

    fn local_user(&self) -> UserInfo {
        UserInfo {
            id: self.config.participant_id.clone(),
            name: self.config.display_name.clone(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_warning(&self, err: SessionError) {
        warn!("session warning: {err}");
        self.emit(SessionEvent::Warning(err));
    }
}
