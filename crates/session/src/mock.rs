//! Recording fakes for the link and signaling seams. Used by the state
//! machine tests; handy for embedders writing their own.

use async_trait::async_trait;
use parley_proto::Frame;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;

use crate::error::SessionError;
use crate::link::{LinkEvent, LinkFactory, MediaKind, OutgoingTrack, PeerLink};
use crate::signaling::SignalSink;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    OpenChatChannel,
    CreateOffer,
    AcceptOffer(Value),
    AcceptAnswer(Value),
    AddRemoteCandidate(Value),
    ReplaceTrack { kind: MediaKind, supplied: bool },
    SendChat(Vec<u8>),
    Close,
}

#[derive(Default)]
pub struct MockLink {
    calls: Mutex<Vec<LinkCall>>,
    chat_ready: AtomicBool,
    fail_offer: AtomicBool,
}

impl MockLink {
    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_chat_ready(&self, ready: bool) {
        self.chat_ready.store(ready, Ordering::SeqCst);
    }

    /// Make the next `create_offer` fail, to exercise rollback.
    pub fn set_fail_offer(&self, fail: bool) {
        self.fail_offer.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn open_chat_channel(&self) -> Result<(), SessionError> {
        self.record(LinkCall::OpenChatChannel);
        Ok(())
    }

    async fn create_offer(&self) -> Result<Value, SessionError> {
        self.record(LinkCall::CreateOffer);
        if self.fail_offer.swap(false, Ordering::SeqCst) {
            return Err(SessionError::PeerConnection("mock offer failure".to_string()));
        }
        Ok(json!({"type": "offer", "sdp": "mock-offer"}))
    }

    async fn accept_offer(&self, offer: &Value) -> Result<Value, SessionError> {
        self.record(LinkCall::AcceptOffer(offer.clone()));
        Ok(json!({"type": "answer", "sdp": "mock-answer"}))
    }

    async fn accept_answer(&self, answer: &Value) -> Result<(), SessionError> {
        self.record(LinkCall::AcceptAnswer(answer.clone()));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), SessionError> {
        self.record(LinkCall::AddRemoteCandidate(candidate.clone()));
        Ok(())
    }

    async fn replace_outgoing_track(
        &self,
        kind: MediaKind,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<(), SessionError> {
        self.record(LinkCall::ReplaceTrack {
            kind,
            supplied: track.is_some(),
        });
        Ok(())
    }

    async fn send_chat(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.record(LinkCall::SendChat(payload.to_vec()));
        Ok(())
    }

    fn chat_ready(&self) -> bool {
        self.chat_ready.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.chat_ready.store(false, Ordering::SeqCst);
        self.record(LinkCall::Close);
    }
}

/// Hands out one `MockLink` per open and remembers them all, so tests can
/// check that a re-pairing got a fresh link.
#[derive(Default)]
pub struct MockLinkFactory {
    links: Mutex<Vec<Arc<MockLink>>>,
    fail_next_offer: AtomicBool,
}

impl MockLinkFactory {
    pub fn created(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self, index: usize) -> Arc<MockLink> {
        self.links.lock().unwrap()[index].clone()
    }

    /// The next link handed out will fail its first `create_offer`.
    pub fn fail_next_offer(&self) {
        self.fail_next_offer.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkFactory for MockLinkFactory {
    async fn open(
        &self,
        _tracks: &[OutgoingTrack],
        _events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError> {
        let link = Arc::new(MockLink::default());
        if self.fail_next_offer.swap(false, Ordering::SeqCst) {
            link.set_fail_offer(true);
        }
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

pub struct MockSignal {
    open: AtomicBool,
    sent: Mutex<Vec<Frame>>,
}

impl Default for MockSignal {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl MockSignal {
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

impl SignalSink for MockSignal {
    fn send(&self, frame: &Frame) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Signaling("socket closed".to_string()));
        }
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
