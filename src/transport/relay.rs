//! Relay connection: one WebSocket split into a reader and a writer task.
//!
//! The writer drains the session's outbound queue; control messages go out
//! as JSON text frames and capture audio as binary frames.  The reader parses
//! text frames into [`InboundMessage`]s and hands them to the session.  When
//! either side of the socket closes, the inbound channel is dropped and the
//! session runner shuts down.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::session::{InboundMessage, MessageError, OutboundMessage};

// ---------------------------------------------------------------------------
// RelayError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to connect to relay {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] MessageError),
}

// ---------------------------------------------------------------------------
// Frame mapping
// ---------------------------------------------------------------------------

/// What the reader should do with one received frame.
#[derive(Debug, PartialEq)]
enum Incoming {
    Message(InboundMessage),
    Closed,
    Skip,
}

fn encode_frame(msg: OutboundMessage) -> Result<Message, MessageError> {
    Ok(match msg {
        OutboundMessage::Control(control) => Message::Text(control.to_json()?.into()),
        OutboundMessage::Audio(pcm) => Message::Binary(pcm.into()),
    })
}

fn decode_frame(frame: Message) -> Incoming {
    match frame {
        Message::Text(text) => match InboundMessage::from_json(text.as_str()) {
            Ok(msg) => Incoming::Message(msg),
            Err(e) => {
                log::warn!("relay: ignoring unparseable message: {e}");
                Incoming::Skip
            }
        },
        Message::Close(_) => Incoming::Closed,
        Message::Binary(bytes) => {
            log::debug!("relay: ignoring {} byte binary frame", bytes.len());
            Incoming::Skip
        }
        // tungstenite answers pings itself.
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Incoming::Skip,
    }
}

// ---------------------------------------------------------------------------
// RelayConnection
// ---------------------------------------------------------------------------

/// Handles to the reader and writer tasks of an open relay socket.
pub struct RelayConnection {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayConnection {
    /// Abort both tasks, closing the socket.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect to `url` and start pumping messages.
///
/// Everything queued on `outbound` is written to the socket in order; parsed
/// relay messages are delivered to `inbound`.
pub async fn connect(
    url: &str,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: mpsc::Sender<InboundMessage>,
) -> Result<RelayConnection, RelayError> {
    let (ws, _response) =
        tokio_tungstenite::connect_async(url)
            .await
            .map_err(|source| RelayError::Connect {
                url: url.to_string(),
                source,
            })?;
    log::info!("relay: connected to {url}");

    let (mut ws_tx, mut ws_rx) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let frame = match encode_frame(msg) {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("relay: {}", RelayError::from(e));
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(frame).await {
                log::warn!("relay: send failed: {}", RelayError::from(e));
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        log::debug!("relay: writer finished");
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("relay: receive failed: {}", RelayError::from(e));
                    break;
                }
            };
            match decode_frame(frame) {
                Incoming::Message(msg) => {
                    if inbound.send(msg).await.is_err() {
                        break;
                    }
                }
                Incoming::Closed => {
                    log::info!("relay: closed by peer");
                    break;
                }
                Incoming::Skip => {}
            }
        }
        log::debug!("relay: reader finished");
    });

    Ok(RelayConnection { reader, writer })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ControlMessage;
    use tokio::net::TcpListener;

    #[test]
    fn control_messages_become_text_frames() {
        let frame = encode_frame(OutboundMessage::Control(ControlMessage::TurnEnd)).unwrap();
        match frame {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"type":"turn_end"}"#),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn capture_audio_becomes_binary_frames() {
        let frame = encode_frame(OutboundMessage::Audio(vec![1, 0, 255, 127])).unwrap();
        match frame {
            Message::Binary(bytes) => assert_eq!(&bytes[..], &[1, 0, 255, 127]),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[test]
    fn text_frames_are_parsed() {
        let frame = Message::Text(r#"{"type":"response_token","token":"hi"}"#.into());
        assert_eq!(
            decode_frame(frame),
            Incoming::Message(InboundMessage::ResponseToken { token: "hi".into() })
        );
    }

    #[test]
    fn malformed_and_binary_frames_are_skipped() {
        assert_eq!(decode_frame(Message::Text("{oops".into())), Incoming::Skip);
        assert_eq!(
            decode_frame(Message::Text(r#"{"type":"mystery"}"#.into())),
            Incoming::Skip
        );
        assert_eq!(decode_frame(Message::Binary(vec![0u8; 4].into())), Incoming::Skip);
        assert_eq!(decode_frame(Message::Ping(Vec::new().into())), Incoming::Skip);
    }

    #[test]
    fn close_frame_ends_the_reader() {
        assert_eq!(decode_frame(Message::Close(None)), Incoming::Closed);
    }

    #[tokio::test]
    async fn connect_failure_reports_url() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, _in_rx) = mpsc::channel(4);
        let url = format!("ws://{addr}/session");
        match connect(&url, out_rx, in_tx).await {
            Err(RelayError::Connect { url: reported, .. }) => assert_eq!(reported, url),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn pumps_messages_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text(
                r#"{"type":"session_created","session_id":"s-1"}"#.into(),
            ))
            .await
            .unwrap();
            let second = ws.next().await.unwrap().unwrap();
            (first, second)
        });

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, mut in_rx) = mpsc::channel(4);
        let _conn = connect(&format!("ws://{addr}/"), out_rx, in_tx).await.unwrap();

        out_tx
            .send(OutboundMessage::Control(ControlMessage::SessionCreate))
            .unwrap();
        assert_eq!(
            in_rx.recv().await,
            Some(InboundMessage::SessionCreated {
                session_id: "s-1".into()
            })
        );
        out_tx.send(OutboundMessage::Audio(vec![9, 9])).unwrap();

        let (first, second) = server.await.unwrap();
        assert_eq!(first, Message::Text(r#"{"type":"session_create"}"#.into()));
        assert_eq!(second, Message::Binary(vec![9u8, 9].into()));
    }
}
