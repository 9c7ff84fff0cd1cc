//! Drives `SessionController::handle` directly through the recording mocks.

use std::sync::Arc;

use parley_crypto::{derive_room_key, Envelope, MessageCipher};
use parley_proto::{Frame, UserInfo};
use parley_session::mock::{LinkCall, MockLinkFactory, MockSignal};
use parley_session::{
    ChatMessage, ConnectionStatus, Input, LinkEvent, LinkHealth, MediaKind, SessionConfig,
    SessionController, SessionError, SessionEvent, SessionRole, SessionState, SignalSink,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const ROOM: &str = "ROOM42";

struct Rig {
    controller: SessionController,
    signal: Arc<MockSignal>,
    links: Arc<MockLinkFactory>,
    events: UnboundedReceiver<SessionEvent>,
}

impl Rig {
    async fn step(&mut self, input: Input) {
        let _ = self.controller.handle(input).await;
    }
}

async fn joined() -> Rig {
    let signal = Arc::new(MockSignal::default());
    let links = Arc::new(MockLinkFactory::default());
    let config = SessionConfig::new("room42", "Alice");
    let (mut controller, _handle, events) =
        SessionController::new(config, signal.clone(), links.clone());
    controller.join().await.unwrap();
    Rig {
        controller,
        signal,
        links,
        events,
    }
}

fn peer() -> UserInfo {
    UserInfo {
        id: "peer-1".to_string(),
        name: "Bob".to_string(),
    }
}

fn cand(n: u8) -> Value {
    json!({
        "candidate": format!("candidate:{n} 1 udp 2122260223 192.0.2.{n} 54555 typ host"),
        "sdpMid": "0",
        "sdpMLineIndex": 0
    })
}

fn room_joined(is_initiator: bool) -> Input {
    Input::Signal(Frame::RoomJoined {
        room_id: ROOM.to_string(),
        is_initiator,
    })
}

fn user_joined() -> Input {
    Input::Signal(Frame::UserJoined {
        user: peer(),
        room_id: ROOM.to_string(),
    })
}

fn ice(n: u8) -> Input {
    Input::Signal(Frame::IceCandidate {
        candidate: Some(cand(n)),
        room_id: ROOM.to_string(),
        user_id: peer().id,
    })
}

fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn peer_cipher() -> MessageCipher {
    MessageCipher::with_key(&derive_room_key(ROOM))
}

async fn initiator_awaiting_answer() -> Rig {
    let mut rig = joined().await;
    rig.step(room_joined(true)).await;
    rig.step(user_joined()).await;
    assert_eq!(rig.controller.state(), SessionState::AwaitingAnswer);
    rig
}

async fn initiator_connected() -> Rig {
    let mut rig = initiator_awaiting_answer().await;
    rig.step(Input::Signal(Frame::Answer {
            answer: json!({"type": "answer", "sdp": "remote-answer"}),
            room_id: ROOM.to_string(),
            user_id: peer().id,
        }))
        .await;
    rig.step(Input::Link(LinkEvent::Health(LinkHealth::Connected)))
        .await;
    assert_eq!(rig.controller.state(), SessionState::Connected);
    rig
}

#[tokio::test]
async fn join_sends_frame_and_awaits_role() {
    let mut rig = joined().await;
    assert_eq!(rig.controller.state(), SessionState::AwaitingRole);

    let sent = rig.signal.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Frame::Join { room_id, user } => {
            assert_eq!(room_id, ROOM);
            assert_eq!(user.name, "Alice");
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    assert!(matches!(
        drain(&mut rig.events).as_slice(),
        [SessionEvent::StatusChanged(ConnectionStatus::Connecting)]
    ));
}

#[tokio::test]
async fn initiator_waits_for_peer_before_offering() {
    let mut rig = joined().await;
    rig.step(room_joined(true)).await;
    assert_eq!(rig.controller.state(), SessionState::AwaitingRole);
    assert_eq!(rig.controller.role(), SessionRole::Initiator);
    assert_eq!(rig.links.created(), 0);
}

#[tokio::test]
async fn initiator_offers_when_peer_joins() {
    let rig = initiator_awaiting_answer().await;

    assert_eq!(rig.links.created(), 1);
    let calls = rig.links.link(0).calls();
    // Channel before offer, so it rides the initial negotiation.
    assert_eq!(calls[0], LinkCall::OpenChatChannel);
    assert_eq!(calls[1], LinkCall::CreateOffer);

    assert!(rig
        .signal
        .sent()
        .iter()
        .any(|frame| matches!(frame, Frame::Offer { .. })));
}

#[tokio::test]
async fn responder_answers_offer() {
    let mut rig = joined().await;
    rig.step(room_joined(false)).await;
    assert_eq!(rig.controller.state(), SessionState::AwaitingOffer);

    rig.step(Input::Signal(Frame::Offer {
            offer: json!({"type": "offer", "sdp": "remote-offer"}),
            room_id: ROOM.to_string(),
            user_id: peer().id,
        }))
        .await;

    assert_eq!(rig.controller.state(), SessionState::Connecting);
    let calls = rig.links.link(0).calls();
    assert!(matches!(calls[0], LinkCall::AcceptOffer(_)));
    // The responder never opens its own channel.
    assert!(!calls.contains(&LinkCall::OpenChatChannel));
    assert!(rig
        .signal
        .sent()
        .iter()
        .any(|frame| matches!(frame, Frame::Answer { .. })));
}

#[tokio::test]
async fn early_candidates_queue_and_flush_in_order() {
    let mut rig = joined().await;
    rig.step(room_joined(false)).await;

    // Candidates can race ahead of the offer.
    for n in 1..=3 {
        rig.step(ice(n)).await;
    }
    assert_eq!(rig.links.created(), 0);

    rig.step(Input::Signal(Frame::Offer {
            offer: json!({"type": "offer", "sdp": "remote-offer"}),
            room_id: ROOM.to_string(),
            user_id: peer().id,
        }))
        .await;

    let calls = rig.links.link(0).calls();
    let applied: Vec<&Value> = calls
        .iter()
        .filter_map(|call| match call {
            LinkCall::AddRemoteCandidate(candidate) => Some(candidate),
            _ => None,
        })
        .collect();
    assert_eq!(applied, vec![&cand(1), &cand(2), &cand(3)]);
    // Queue applied after the remote description, not before.
    assert!(matches!(calls[0], LinkCall::AcceptOffer(_)));
}

#[tokio::test]
async fn initiator_queues_candidates_until_answer() {
    let mut rig = initiator_awaiting_answer().await;

    rig.step(ice(1)).await;
    rig.step(ice(2)).await;
    let link = rig.links.link(0);
    assert!(!link
        .calls()
        .iter()
        .any(|call| matches!(call, LinkCall::AddRemoteCandidate(_))));

    rig.step(Input::Signal(Frame::Answer {
            answer: json!({"type": "answer", "sdp": "remote-answer"}),
            room_id: ROOM.to_string(),
            user_id: peer().id,
        }))
        .await;

    let calls = link.calls();
    let answer_pos = calls
        .iter()
        .position(|call| matches!(call, LinkCall::AcceptAnswer(_)))
        .unwrap();
    let first_cand = calls
        .iter()
        .position(|call| matches!(call, LinkCall::AddRemoteCandidate(_)))
        .unwrap();
    assert!(answer_pos < first_cand);
    assert_eq!(rig.controller.state(), SessionState::Connecting);
}

#[tokio::test]
async fn null_candidate_is_ignored() {
    let mut rig = initiator_awaiting_answer().await;
    rig.step(Input::Signal(Frame::IceCandidate {
            candidate: None,
            room_id: ROOM.to_string(),
            user_id: peer().id,
        }))
        .await;
    assert!(drain(&mut rig.events).is_empty());
}

#[tokio::test]
async fn stale_offer_ignored_once_connected() {
    let mut rig = initiator_connected().await;
    drain(&mut rig.events);

    rig.step(Input::Signal(Frame::Offer {
            offer: json!({"type": "offer", "sdp": "stale"}),
            room_id: ROOM.to_string(),
            user_id: peer().id,
        }))
        .await;

    assert_eq!(rig.controller.state(), SessionState::Connected);
    assert!(!rig
        .links
        .link(0)
        .calls()
        .iter()
        .any(|call| matches!(call, LinkCall::AcceptOffer(_))));
}

#[tokio::test]
async fn offer_failure_rolls_back_and_retry_succeeds() {
    let mut rig = joined().await;
    rig.links.fail_next_offer();
    rig.step(room_joined(true)).await;
    rig.step(user_joined()).await;

    assert_eq!(rig.controller.state(), SessionState::AwaitingRole);
    assert!(rig.links.link(0).calls().contains(&LinkCall::Close));
    assert!(drain(&mut rig.events)
        .iter()
        .any(|event| matches!(event, SessionEvent::Warning(_))));

    // Next announcement starts a fresh attempt on a fresh link.
    rig.step(user_joined()).await;
    assert_eq!(rig.links.created(), 2);
    assert_eq!(rig.controller.state(), SessionState::AwaitingAnswer);
}

#[tokio::test]
async fn survivor_rearms_as_initiator_after_peer_leaves() {
    let mut rig = initiator_connected().await;
    drain(&mut rig.events);

    rig.step(Input::Signal(Frame::UserLeft {
            user_id: peer().id,
            room_id: ROOM.to_string(),
        }))
        .await;

    assert_eq!(rig.controller.state(), SessionState::AwaitingRole);
    assert_eq!(rig.controller.role(), SessionRole::Initiator);
    assert!(rig.links.link(0).calls().contains(&LinkCall::Close));
    let events = drain(&mut rig.events);
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::PeerLeft { .. })));
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::StatusChanged(ConnectionStatus::Disconnected)
    )));

    // A new arrival gets a brand new link and offer, no room_joined needed.
    rig.step(user_joined()).await;
    assert_eq!(rig.links.created(), 2);
    assert!(rig
        .signal
        .sent()
        .iter()
        .filter(|frame| matches!(frame, Frame::Offer { .. }))
        .count()
        == 2);
}

#[tokio::test]
async fn chat_prefers_direct_channel() {
    let mut rig = initiator_connected().await;
    rig.links.link(0).set_chat_ready(true);
    drain(&mut rig.events);

    rig.step(Input::Command(parley_session::Command::SendChat(
            "hello".to_string(),
        )))
        .await;

    let calls = rig.links.link(0).calls();
    let payload = calls
        .iter()
        .find_map(|call| match call {
            LinkCall::SendChat(bytes) => Some(bytes.clone()),
            _ => None,
        })
        .unwrap();
    // The channel carries an encrypted envelope, never plaintext.
    let envelope: Envelope = serde_json::from_slice(&payload).unwrap();
    let decrypted: ChatMessage = peer_cipher().decrypt(&envelope).unwrap();
    assert_eq!(decrypted.content.text, "hello");

    assert!(!rig
        .signal
        .sent()
        .iter()
        .any(|frame| matches!(frame, Frame::ChatMessage { .. })));
    assert!(drain(&mut rig.events)
        .iter()
        .any(|event| matches!(event, SessionEvent::ChatSent(_))));
}

#[tokio::test]
async fn chat_falls_back_to_relay_before_channel_opens() {
    let mut rig = initiator_awaiting_answer().await;
    drain(&mut rig.events);

    rig.step(Input::Command(parley_session::Command::SendChat(
            "early".to_string(),
        )))
        .await;

    let sent = rig.signal.sent();
    let envelope = sent
        .iter()
        .find_map(|frame| match frame {
            Frame::ChatMessage { encrypted, .. } => Some(encrypted.clone()),
            _ => None,
        })
        .unwrap();
    let decrypted: ChatMessage = peer_cipher().decrypt(&envelope).unwrap();
    assert_eq!(decrypted.content.text, "early");
    assert!(!rig
        .links
        .link(0)
        .calls()
        .iter()
        .any(|call| matches!(call, LinkCall::SendChat(_))));
}

#[tokio::test]
async fn chat_without_transport_keeps_local_echo() {
    let mut rig = joined().await;
    rig.signal.set_open(false);
    drain(&mut rig.events);

    rig.step(Input::Command(parley_session::Command::SendChat(
            "void".to_string(),
        )))
        .await;

    let events = drain(&mut rig.events);
    assert!(matches!(&events[0], SessionEvent::ChatSent(message) if message.content.text == "void"));
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::Warning(SessionError::NoTransportAvailable))));
}

#[tokio::test]
async fn channel_message_decrypts_to_chat_event() {
    let mut rig = initiator_connected().await;
    drain(&mut rig.events);

    let message = ChatMessage::new(peer(), "over the channel".to_string());
    let envelope = peer_cipher().encrypt(&message).unwrap();
    rig.step(Input::Link(LinkEvent::ChannelMessage(
            serde_json::to_vec(&envelope).unwrap(),
        )))
        .await;

    let events = drain(&mut rig.events);
    assert!(matches!(
        &events[0],
        SessionEvent::ChatReceived(received) if received.content.text == "over the channel"
    ));
}

#[tokio::test]
async fn garbage_channel_payload_is_nonfatal() {
    let mut rig = initiator_connected().await;
    drain(&mut rig.events);

    rig.step(Input::Link(LinkEvent::ChannelMessage(b"junk".to_vec())))
        .await;

    assert_eq!(rig.controller.state(), SessionState::Connected);
    assert!(drain(&mut rig.events)
        .iter()
        .any(|event| matches!(event, SessionEvent::Warning(_))));
}

#[tokio::test]
async fn relayed_chat_ignored_while_channel_is_up() {
    let mut rig = initiator_connected().await;
    rig.links.link(0).set_chat_ready(true);
    drain(&mut rig.events);

    let message = ChatMessage::new(peer(), "duplicate".to_string());
    let envelope = peer_cipher().encrypt(&message).unwrap();
    rig.step(Input::Signal(Frame::ChatMessage {
            encrypted: envelope,
            room_id: ROOM.to_string(),
            user_id: peer().id,
        }))
        .await;

    assert!(drain(&mut rig.events).is_empty());
}

#[tokio::test]
async fn relayed_chat_delivered_before_channel_opens() {
    let mut rig = joined().await;
    drain(&mut rig.events);

    let message = ChatMessage::new(peer(), "via relay".to_string());
    let envelope = peer_cipher().encrypt(&message).unwrap();
    rig.step(Input::Signal(Frame::ChatMessage {
            encrypted: envelope,
            room_id: ROOM.to_string(),
            user_id: peer().id,
        }))
        .await;

    let events = drain(&mut rig.events);
    assert!(matches!(
        &events[0],
        SessionEvent::ChatReceived(received) if received.content.text == "via relay"
    ));
}

#[tokio::test]
async fn replace_track_swaps_in_place_without_renegotiating() {
    let mut rig = initiator_connected().await;
    let link = rig.links.link(0);
    let offers_before = link
        .calls()
        .iter()
        .filter(|call| matches!(call, LinkCall::CreateOffer))
        .count();

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        "parley".to_owned(),
    ));
    rig.step(Input::Command(parley_session::Command::ReplaceTrack {
            kind: MediaKind::Video,
            track: Some(track),
        }))
        .await;
    rig.step(Input::Command(parley_session::Command::ReplaceTrack {
            kind: MediaKind::Video,
            track: None,
        }))
        .await;

    let calls = link.calls();
    assert!(calls.contains(&LinkCall::ReplaceTrack {
        kind: MediaKind::Video,
        supplied: true
    }));
    assert!(calls.contains(&LinkCall::ReplaceTrack {
        kind: MediaKind::Video,
        supplied: false
    }));
    let offers_after = calls
        .iter()
        .filter(|call| matches!(call, LinkCall::CreateOffer))
        .count();
    assert_eq!(offers_before, offers_after);
}

#[tokio::test]
async fn leave_tears_down_in_order() {
    let mut rig = initiator_connected().await;
    drain(&mut rig.events);

    let flow = rig
        .controller
        .handle(Input::Command(parley_session::Command::Leave))
        .await;
    assert!(flow.is_break());
    assert_eq!(rig.controller.state(), SessionState::Closed);
    assert!(rig.links.link(0).calls().contains(&LinkCall::Close));
    assert!(rig
        .signal
        .sent()
        .iter()
        .any(|frame| matches!(frame, Frame::Leave { .. })));
    assert!(!rig.signal.is_open());
}

#[tokio::test]
async fn local_candidates_forward_to_relay() {
    let mut rig = initiator_awaiting_answer().await;

    rig.step(Input::Link(LinkEvent::LocalCandidate(cand(7))))
        .await;

    assert!(rig.signal.sent().iter().any(|frame| matches!(
        frame,
        Frame::IceCandidate {
            candidate: Some(candidate),
            ..
        } if *candidate == cand(7)
    )));
}
