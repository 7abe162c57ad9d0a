//! The text-frame pipe under the protocol.
//!
//! A [`TransportLink`] is one open incarnation of the duplex channel: frames
//! go down through `tx`, frames and the single close notification come up
//! through `events`. [`WsConnector`] produces links over WebSocket; tests
//! plug in their own [`Connector`] over in-memory channels.

use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use mmtp_core::ClientError;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, trace, warn};

/// What goes down the pipe.
#[derive(Debug)]
pub enum LinkFrame {
    Text(String),
    /// Keep-alive probe; carried at the transport level, invisible to the
    /// protocol.
    Ping,
}

/// What comes up the pipe.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(String),
    /// Emitted exactly once per link, whatever the cause of death.
    Closed { reason: String },
}

/// One open transport incarnation.
#[derive(Debug)]
pub struct TransportLink {
    pub tx: Sender<LinkFrame>,
    pub events: Receiver<TransportEvent>,
}

/// Opens transport links. The engine calls this once at startup and again
/// on every reconnect attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<TransportLink, ClientError>> + Send;
}

/// WebSocket connector over tokio-tungstenite.
///
/// The returned link is serviced by two pump tasks: a writer draining
/// [`LinkFrame`]s into text/ping frames, and a reader forwarding text
/// frames, answering pings and reporting the close. Both die with the
/// socket; the reader emits the final [`TransportEvent::Closed`].
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<TransportLink, ClientError> {
        let (stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::connect_failed(format!("timed out dialing {url}")))?
            .map_err(|e| ClientError::connect_failed(e.to_string()))?;
        debug!("websocket open to {url}");

        let (mut sink, mut source) = stream.split();
        let (frame_tx, mut frame_rx) = channel::<LinkFrame>(256);
        let (event_tx, event_rx) = channel::<TransportEvent>(256);

        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let msg = match frame {
                    LinkFrame::Text(text) => WsMessage::Text(text.into()),
                    LinkFrame::Ping => WsMessage::Ping(Vec::new().into()),
                };
                if let Err(e) = sink.send(msg).await {
                    debug!("websocket write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        trace!("frame in: {text}");
                        if event_tx
                            .send(TransportEvent::Frame(text.to_string()))
                            .await
                            .is_err()
                        {
                            break "link dropped".to_owned();
                        }
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        // tungstenite answers pings on the next write
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame.map_or_else(String::new, |f| f.reason.to_string());
                    }
                    Some(Ok(other)) => {
                        warn!("ignoring non-text frame: {other:?}");
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_owned(),
                }
            };
            let _ = event_tx.send(TransportEvent::Closed { reason }).await;
        });

        Ok(TransportLink {
            tx: frame_tx,
            events: event_rx,
        })
    }
}
