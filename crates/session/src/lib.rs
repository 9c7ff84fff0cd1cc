//! Client side of a two-party end-to-end-encrypted call: room join over
//! the relay, WebRTC negotiation, encrypted chat over the data channel
//! with a relay fallback, and in-place outbound track swaps.

pub mod chat;
pub mod controller;
pub mod error;
pub mod link;
pub mod mock;
pub mod signaling;

pub use chat::{ChatContent, ChatMessage};
pub use controller::{
    Command, ConnectionStatus, Input, SessionConfig, SessionController, SessionEvent,
    SessionHandle, SessionRole, SessionState,
};
pub use error::SessionError;
pub use link::{
    LinkEvent, LinkFactory, LinkHealth, MediaKind, OutgoingTrack, PeerLink, WebRtcConfig,
    WebRtcLink, WebRtcLinkFactory,
};
pub use signaling::{SignalSink, WebSocketSignaling};

use std::sync::Arc;
use tokio::sync::mpsc;

/// Dial the relay, join the room, and run the session on its own task.
///
/// Returns the command handle and the event stream; the session ends when
/// [`SessionHandle::leave`] is called or the relay connection drops before
/// a call is up.
pub async fn start(
    relay_url: &str,
    config: SessionConfig,
) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
    start_with_links(relay_url, config, Arc::new(WebRtcLinkFactory::default())).await
}

/// Like [`start`], with a caller-supplied link factory (custom ICE servers,
/// instrumented links).
pub async fn start_with_links(
    relay_url: &str,
    config: SessionConfig,
    links: Arc<dyn LinkFactory>,
) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
    let signal = Arc::new(WebSocketSignaling::connect(relay_url, inputs_tx.clone()).await?);
    let (mut controller, handle, events) =
        SessionController::with_channels(config, signal, links, inputs_tx, inputs_rx);
    controller.join().await?;
    tokio::spawn(controller.run());
    Ok((handle, events))
}
