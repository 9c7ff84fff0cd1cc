//! The peer-connection seam.
//!
//! `PeerLink` is everything the session state machine needs from a peer
//! connection; `WebRtcLink` is the production implementation over the
//! `webrtc` crate. Tests drive the state machine through the recording
//! mock in [`crate::mock`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Coarse connectivity as the state machine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Connecting,
    Connected,
    Disconnected,
}

/// Everything a live link reports back into the session's input queue.
#[derive(Debug)]
pub enum LinkEvent {
    LocalCandidate(Value),
    Health(LinkHealth),
    ChannelOpen,
    ChannelClosed,
    ChannelMessage(Vec<u8>),
    RemoteTrack(MediaKind),
}

pub type OutgoingTrack = (MediaKind, Arc<dyn TrackLocal + Send + Sync>);

/// SDP payload as it travels inside offer/answer frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// ICE candidate payload, W3C dictionary field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for CandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidatePayload> for RTCIceCandidateInit {
    fn from(payload: CandidatePayload) -> Self {
        Self {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: payload.username_fragment,
        }
    }
}

/// Operations the state machine performs against one peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the local chat data channel (initiator side only; the
    /// responder receives the channel from the remote).
    async fn open_chat_channel(&self) -> Result<(), SessionError>;
    async fn create_offer(&self) -> Result<Value, SessionError>;
    /// Set the remote offer and produce the local answer.
    async fn accept_offer(&self, offer: &Value) -> Result<Value, SessionError>;
    async fn accept_answer(&self, answer: &Value) -> Result<(), SessionError>;
    async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), SessionError>;
    /// Swap (or add, or withdraw) the outbound track of one kind without
    /// renegotiating. Camera toggle, screen share, and background effects
    /// all funnel through here.
    async fn replace_outgoing_track(
        &self,
        kind: MediaKind,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<(), SessionError>;
    async fn send_chat(&self, payload: &[u8]) -> Result<(), SessionError>;
    fn chat_ready(&self) -> bool;
    /// Best-effort teardown: data channel first, then the connection.
    async fn close(&self);
}

/// Builds a fresh link per connection attempt, so a re-pairing after a
/// disconnect starts from a clean peer connection.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn open(
        &self,
        tracks: &[OutgoingTrack],
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError>;
}

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
    pub chat_channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun1.l.google.com:3478".to_string(),
                "stun:stun3.l.google.com:5349".to_string(),
                "stun:stun4.l.google.com:19302".to_string(),
            ],
            chat_channel_label: "parley-chat".to_string(),
        }
    }
}

fn link_err(err: impl std::fmt::Display) -> SessionError {
    SessionError::PeerConnection(err.to_string())
}

/// Production `PeerLink` over `webrtc::RTCPeerConnection`.
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    chat: Arc<AsyncRwLock<Option<Arc<RTCDataChannel>>>>,
    chat_ready: Arc<AtomicBool>,
    senders: AsyncMutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    chat_channel_label: String,
}

impl WebRtcLink {
    pub async fn open(
        config: &WebRtcConfig,
        tracks: &[OutgoingTrack],
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<Self>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(link_err)?;
        let interceptors =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(link_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(link_err)?);

        let chat: Arc<AsyncRwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(AsyncRwLock::new(None));
        let chat_ready = Arc::new(AtomicBool::new(false));

        let events_for_state = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events_for_state.clone();
            Box::pin(async move {
                let health = match state {
                    RTCPeerConnectionState::Connecting => Some(LinkHealth::Connecting),
                    RTCPeerConnectionState::Connected => Some(LinkHealth::Connected),
                    RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed => Some(LinkHealth::Disconnected),
                    _ => None,
                };
                if let Some(health) = health {
                    let _ = events.send(LinkEvent::Health(health));
                }
            })
        }));

        let events_for_candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events_for_candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        match serde_json::to_value(CandidatePayload::from(init)) {
                            Ok(value) => {
                                let _ = events.send(LinkEvent::LocalCandidate(value));
                            }
                            Err(err) => warn!("failed to serialize local candidate: {err}"),
                        }
                    }
                    Err(err) => warn!("failed to marshal local candidate: {err}"),
                }
            })
        }));

        // Responder side: the initiator's channel arrives through here.
        let chat_slot = chat.clone();
        let ready = chat_ready.clone();
        let events_for_channel = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let chat_slot = chat_slot.clone();
            let ready = ready.clone();
            let events = events_for_channel.clone();
            Box::pin(async move {
                debug!(label = dc.label(), "remote data channel received");
                wire_chat_channel(&dc, ready, events);
                *chat_slot.write().await = Some(dc);
            })
        }));

        let events_for_tracks = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let events = events_for_tracks.clone();
                Box::pin(async move {
                    if let Some(kind) = MediaKind::from_codec_type(track.kind()) {
                        let _ = events.send(LinkEvent::RemoteTrack(kind));
                    }
                })
            },
        ));

        let mut senders = HashMap::new();
        for (kind, track) in tracks {
            let sender = pc
                .add_track(Arc::clone(track))
                .await
                .map_err(link_err)?;
            senders.insert(*kind, sender);
        }

        Ok(Arc::new(Self {
            pc,
            chat,
            chat_ready,
            senders: AsyncMutex::new(senders),
            events,
            chat_channel_label: config.chat_channel_label.clone(),
        }))
    }
}

fn wire_chat_channel(
    dc: &Arc<RTCDataChannel>,
    ready: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let ready_on_open = ready.clone();
    let events_on_open = events.clone();
    dc.on_open(Box::new(move || {
        ready_on_open.store(true, Ordering::SeqCst);
        let _ = events_on_open.send(LinkEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let events_on_close = events.clone();
    dc.on_close(Box::new(move || {
        ready.store(false, Ordering::SeqCst);
        let _ = events_on_close.send(LinkEvent::ChannelClosed);
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = events.send(LinkEvent::ChannelMessage(msg.data.to_vec()));
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn open_chat_channel(&self) -> Result<(), SessionError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&self.chat_channel_label, Some(init))
            .await
            .map_err(link_err)?;
        wire_chat_channel(&dc, self.chat_ready.clone(), self.events.clone());
        *self.chat.write().await = Some(dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<Value, SessionError> {
        let offer = self.pc.create_offer(None).await.map_err(link_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(link_err)?;
        serde_json::to_value(SdpPayload {
            kind: "offer".to_string(),
            sdp: offer.sdp,
        })
        .map_err(link_err)
    }

    async fn accept_offer(&self, offer: &Value) -> Result<Value, SessionError> {
        let payload: SdpPayload = serde_json::from_value(offer.clone()).map_err(link_err)?;
        let remote = RTCSessionDescription::offer(payload.sdp).map_err(link_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(link_err)?;

        let answer = self.pc.create_answer(None).await.map_err(link_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(link_err)?;
        serde_json::to_value(SdpPayload {
            kind: "answer".to_string(),
            sdp: answer.sdp,
        })
        .map_err(link_err)
    }

    async fn accept_answer(&self, answer: &Value) -> Result<(), SessionError> {
        let payload: SdpPayload = serde_json::from_value(answer.clone()).map_err(link_err)?;
        let remote = RTCSessionDescription::answer(payload.sdp).map_err(link_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(link_err)
    }

    async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), SessionError> {
        let payload: CandidatePayload =
            serde_json::from_value(candidate.clone()).map_err(link_err)?;
        if payload.candidate.is_empty() {
            // End-of-candidates marker.
            return Ok(());
        }
        self.pc
            .add_ice_candidate(payload.into())
            .await
            .map_err(link_err)
    }

    async fn replace_outgoing_track(
        &self,
        kind: MediaKind,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<(), SessionError> {
        let mut senders = self.senders.lock().await;
        match (senders.get(&kind), track) {
            // An existing sender swaps (or drops) its track in place; the
            // negotiated m-line is reused, no new offer/answer cycle.
            (Some(sender), track) => sender.replace_track(track).await.map_err(link_err),
            (None, Some(track)) => {
                let sender = self.pc.add_track(track).await.map_err(link_err)?;
                senders.insert(kind, sender);
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    async fn send_chat(&self, payload: &[u8]) -> Result<(), SessionError> {
        let chat = self.chat.read().await;
        let dc = chat
            .as_ref()
            .ok_or(SessionError::NoTransportAvailable)?;
        dc.send(&Bytes::copy_from_slice(payload))
            .await
            .map_err(link_err)?;
        Ok(())
    }

    fn chat_ready(&self) -> bool {
        self.chat_ready.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.chat_ready.store(false, Ordering::SeqCst);
        if let Some(dc) = self.chat.write().await.take() {
            let _ = dc.close().await;
        }
        let _ = self.pc.close().await;
    }
}

/// Factory handing each connection attempt its own `WebRtcLink`.
pub struct WebRtcLinkFactory {
    config: WebRtcConfig,
}

impl WebRtcLinkFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

impl Default for WebRtcLinkFactory {
    fn default() -> Self {
        Self::new(WebRtcConfig::default())
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn open(
        &self,
        tracks: &[OutgoingTrack],
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError> {
        let link = WebRtcLink::open(&self.config, tracks, events).await?;
        Ok(link)
    }
}
