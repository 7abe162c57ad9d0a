//! Single-shot and multi-stage result slots.

use std::sync::{Arc, Weak};
use std::time::Duration;

use mmtp_core::{ClientError, ConnectionMessage, MaritimeId, PositionTime};
use tokio::sync::{mpsc, oneshot, watch};

use crate::bus::MessageBus;

/// How a [`ConnectionFuture`] detaches its correlation entry on cancel.
pub(crate) enum CancelHook {
    Request { bus: Weak<MessageBus>, reply_to: u64 },
    Invocation { bus: Weak<MessageBus>, invocation_id: String },
}

/// A single-shot, cancellable result of a protocol exchange.
///
/// The slot resolves at most once: with the decoded reply, with the error
/// the engine failed it with, or with [`ClientError::Cancelled`]. Letting a
/// wait time out leaves the wire-level entry in place, so a late reply is
/// quietly discarded rather than treated as an orphan.
pub struct ConnectionFuture<T> {
    rx: oneshot::Receiver<Result<ConnectionMessage, ClientError>>,
    decode: fn(ConnectionMessage) -> Result<T, ClientError>,
    cancel: Option<CancelHook>,
}

impl<T> std::fmt::Debug for ConnectionFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFuture").finish_non_exhaustive()
    }
}

impl<T> ConnectionFuture<T> {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<ConnectionMessage, ClientError>>,
        decode: fn(ConnectionMessage) -> Result<T, ClientError>,
        cancel: CancelHook,
    ) -> Self {
        Self {
            rx,
            decode,
            cancel: Some(cancel),
        }
    }

    /// Waits for the result.
    ///
    /// # Errors
    /// Whatever the engine failed the exchange with; see [`ClientError`].
    pub async fn get(self) -> Result<T, ClientError> {
        match self.rx.await {
            Ok(Ok(msg)) => (self.decode)(msg),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::Cancelled),
        }
    }

    /// Waits for the result, at most `timeout`.
    ///
    /// # Errors
    /// [`ClientError::Timeout`] when the wait elapses. The request stays
    /// outstanding on the wire; its eventual reply is discarded.
    pub async fn get_timeout(self, timeout: Duration) -> Result<T, ClientError> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Abandons the exchange. The correlation entry is removed, no frame is
    /// sent, and a reply arriving later is dropped silently. A cancelled
    /// future never observes a completion; awaiting it afterwards yields
    /// [`ClientError::Cancelled`].
    pub fn cancel(&mut self) {
        if let Some(hook) = self.cancel.take() {
            match hook {
                CancelHook::Request { bus, reply_to } => {
                    if let Some(bus) = bus.upgrade() {
                        bus.discard_request(reply_to);
                    }
                }
                CancelHook::Invocation { bus, invocation_id } => {
                    if let Some(bus) = bus.upgrade() {
                        bus.discard_invocation(&invocation_id);
                    }
                }
            }
        }
    }
}

/// One recipient's receipt for a broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastAckEvent {
    pub recipient: MaritimeId,
    pub position: Option<PositionTime>,
}

#[derive(Debug)]
pub(crate) struct BroadcastState {
    server_tx: watch::Sender<Option<Result<(), ClientError>>>,
    ack_tx: mpsc::UnboundedSender<BroadcastAckEvent>,
    ack_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BroadcastAckEvent>>,
}

impl BroadcastState {
    pub(crate) fn new() -> Arc<Self> {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (server_tx, _) = watch::channel(None);
        Arc::new(Self {
            server_tx,
            ack_tx,
            ack_rx: tokio::sync::Mutex::new(ack_rx),
        })
    }

    pub(crate) fn resolve_server(&self, result: Result<(), ClientError>) {
        let mut result = Some(result);
        self.server_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = result.take();
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn push_ack(&self, ack: BroadcastAckEvent) {
        let _ = self.ack_tx.send(ack);
    }
}

/// The two-stage result of a broadcast: a single server-receipt milestone,
/// then a stream of per-recipient receipts.
///
/// Dropping the future releases the ack state; receipts arriving afterwards
/// are garbage-collected instead of piling up.
pub struct BroadcastFuture {
    pub(crate) state: Arc<BroadcastState>,
}

impl BroadcastFuture {
    /// Resolves when the server has accepted the broadcast for fan-out.
    ///
    /// # Errors
    /// Fails with the error the underlying send request failed with.
    pub async fn received_on_server(&self) -> Result<(), ClientError> {
        let mut rx = self.state.server_tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Err(ClientError::Cancelled)),
            Err(_) => Err(ClientError::Cancelled),
        }
    }

    /// The next per-recipient receipt. Receipts only flow for broadcasts
    /// sent with the receipt-required option.
    pub async fn next_ack(&self) -> Option<BroadcastAckEvent> {
        self.state.ack_rx.lock().await.recv().await
    }
}
