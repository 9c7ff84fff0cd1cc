//! WebSocket signaling transport.
//!
//! A thin sink over the relay connection: frames go out through a writer
//! task, inbound frames and the close notification are funneled into the
//! session's input queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parley_proto::{parse_frame, Frame};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::controller::Input;
use crate::error::SessionError;

/// Where the session pushes outbound signaling frames.
pub trait SignalSink: Send + Sync {
    fn send(&self, frame: &Frame) -> Result<(), SessionError>;
    fn is_open(&self) -> bool;
    fn close(&self);
}

enum Outbound {
    Frame(String),
    Close,
}

/// Relay connection over `tokio-tungstenite`.
pub struct WebSocketSignaling {
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl WebSocketSignaling {
    /// Dial the relay and start the reader/writer tasks. Inbound frames
    /// arrive on `inputs` as [`Input::Signal`]; when the socket closes,
    /// a single [`Input::SignalClosed`] follows.
    pub async fn connect(
        url: &str,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> Result<Self, SessionError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| SessionError::Signaling(err.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        let open = Arc::new(AtomicBool::new(true));

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let open_for_writer = open.clone();
        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Frame(text) => {
                        if let Err(err) = writer.send(Message::Text(text.into())).await {
                            warn!("signaling send failed: {err}");
                            open_for_writer.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = writer.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let open_for_reader = open.clone();
        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match parse_frame(text.as_str()) {
                        Ok(frame) => {
                            if inputs.send(Input::Signal(frame)).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("ignoring malformed signaling frame: {err}"),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("signaling socket closed by remote");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("signaling socket error: {err}");
                        break;
                    }
                }
            }
            open_for_reader.store(false, Ordering::SeqCst);
            let _ = inputs.send(Input::SignalClosed);
        });

        Ok(Self {
            outbound: outbound_tx,
            open,
        })
    }
}

impl SignalSink for WebSocketSignaling {
    fn send(&self, frame: &Frame) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Signaling("socket closed".to_string()));
        }
        let text = serde_json::to_string(frame)
            .map_err(|err| SessionError::Signaling(err.to_string()))?;
        self.outbound
            .send(Outbound::Frame(text))
            .map_err(|_| SessionError::Signaling("writer task gone".to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Close);
    }
}
