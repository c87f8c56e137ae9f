//! WebSocket transport for [`VoiceClient`](super::VoiceClient).
//!
//! [`connect`] opens the relay socket and splits it into two tasks: a writer
//! fed by the [`ChannelLink`] and a reader that turns incoming frames into
//! [`LinkEvent`]s. Both end when either side closes.

use super::{ClientError, ClientResult, RelayLink};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Something that arrived from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

/// [`RelayLink`] backed by the writer task's channel.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    outbound: mpsc::UnboundedSender<Message>,
}

impl RelayLink for ChannelLink {
    fn send_binary(&self, data: Vec<u8>) -> ClientResult<()> {
        self.outbound
            .send(Message::Binary(data))
            .map_err(|_| ClientError::LinkClosed)
    }

    fn send_text(&self, text: String) -> ClientResult<()> {
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::LinkClosed)
    }

    fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

/// Connect to a relay URL such as `ws://127.0.0.1:8080/ws/gemini-voice`.
pub async fn connect(url: &str) -> ClientResult<(ChannelLink, mpsc::UnboundedReceiver<LinkEvent>)> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!("Relay write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let closed = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if event_tx.send(LinkEvent::Text(text)).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| LinkEvent::Closed {
                            code: Some(u16::from(f.code)),
                            reason: f.reason.to_string(),
                        })
                        .unwrap_or(LinkEvent::Closed {
                            code: None,
                            reason: String::new(),
                        });
                }
                // Pings are answered by tungstenite on the next write
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay read failed: {}", e);
                    break LinkEvent::Closed {
                        code: None,
                        reason: e.to_string(),
                    };
                }
                None => {
                    break LinkEvent::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    };
                }
            }
        };
        let _ = event_tx.send(closed);
    });

    Ok((ChannelLink { outbound: outbound_tx }, event_rx))
}
