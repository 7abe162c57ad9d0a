//! Message bus: numbered request correlation and typed inbound dispatch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use mmtp_core::{ClientError, ConnectionMessage, MessageType, RequestBody};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::future::{CancelHook, ConnectionFuture};

/// Handlers run on the protocol task, in frame-arrival order.
type Handler = Box<dyn Fn(&ConnectionMessage) + Send + Sync>;

type ReplySlot = oneshot::Sender<Result<ConnectionMessage, ClientError>>;

struct PendingRequest {
    message: ConnectionMessage,
    reply: ReplySlot,
}

struct PendingInvocation {
    message: ConnectionMessage,
    reply: ReplySlot,
}

#[derive(Default)]
struct Correlation {
    /// Source of `reply_to` numbers; also orders invocations for replay.
    next_id: u64,
    /// Outstanding numbered requests, ascending by `reply_to`.
    pending: BTreeMap<u64, PendingRequest>,
    /// Outstanding service invocations in send order.
    invocations: BTreeMap<u64, PendingInvocation>,
    invocation_index: HashMap<String, u64>,
    /// Request numbers whose futures were cancelled; a late reply for one
    /// of these is dropped instead of being treated as an orphan.
    discarded: HashSet<u64>,
}

/// What became of an inbound server reply.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReplyOutcome {
    Completed,
    Discarded,
    /// Nobody ever asked; the connection is out of sync.
    Orphan,
}

/// An outbound frame plus the correlation number it is tracked under, if
/// any. The driver uses the number to drop queue entries that a
/// reconnect-time replay has already re-sent.
pub(crate) struct Outbound {
    pub(crate) seq: Option<u64>,
    pub(crate) message: ConnectionMessage,
}

/// The correlation and dispatch layer between the managers and the driver.
///
/// Requests get their number, their pending entry and their spot in the
/// outbound queue under one lock, so the server observes them in id order.
pub struct MessageBus {
    outbound: mpsc::Sender<Outbound>,
    correlation: Mutex<Correlation>,
    subscribers: Mutex<HashMap<MessageType, Vec<Handler>>>,
}

impl MessageBus {
    pub(crate) fn new(outbound: mpsc::Sender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            correlation: Mutex::new(Correlation::default()),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// Sends a numbered server request and returns the future its ack
    /// resolves.
    ///
    /// # Errors
    /// [`ClientError::Backpressure`] when the outbound queue is full,
    /// [`ClientError::Closed`] when the engine has shut down.
    pub(crate) fn send_request<R: RequestBody>(
        self: &Arc<Self>,
        body: R,
    ) -> Result<ConnectionFuture<R::Output>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut correlation = self.correlation.lock().expect("bus lock poisoned");
        let reply_to = correlation.take_id()?;
        let message = body.into_message(reply_to);
        correlation.pending.insert(
            reply_to,
            PendingRequest {
                message: message.clone(),
                reply: tx,
            },
        );
        if let Err(e) = self.try_enqueue(Some(reply_to), message) {
            correlation.pending.remove(&reply_to);
            return Err(e);
        }
        Ok(ConnectionFuture::new(
            rx,
            R::decode,
            CancelHook::Request {
                bus: Arc::downgrade(self),
                reply_to,
            },
        ))
    }

    /// Sends a service invocation, tracked for replay by its 128-bit id.
    pub(crate) fn send_invocation<T>(
        self: &Arc<Self>,
        message: ConnectionMessage,
        invocation_id: String,
        decode: fn(ConnectionMessage) -> Result<T, ClientError>,
    ) -> Result<ConnectionFuture<T>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut correlation = self.correlation.lock().expect("bus lock poisoned");
        let seq = correlation.take_id()?;
        correlation.invocations.insert(
            seq,
            PendingInvocation {
                message: message.clone(),
                reply: tx,
            },
        );
        correlation.invocation_index.insert(invocation_id.clone(), seq);
        if let Err(e) = self.try_enqueue(Some(seq), message) {
            correlation.invocations.remove(&seq);
            correlation.invocation_index.remove(&invocation_id);
            return Err(e);
        }
        Ok(ConnectionFuture::new(
            rx,
            decode,
            CancelHook::Invocation {
                bus: Arc::downgrade(self),
                invocation_id,
            },
        ))
    }

    /// Sends a message without tracking a reply.
    ///
    /// # Errors
    /// [`ClientError::Backpressure`] / [`ClientError::Closed`] as for
    /// requests.
    pub(crate) fn send_one_way(&self, message: ConnectionMessage) -> Result<(), ClientError> {
        self.try_enqueue(None, message)
    }

    fn try_enqueue(&self, seq: Option<u64>, message: ConnectionMessage) -> Result<(), ClientError> {
        self.outbound
            .try_send(Outbound { seq, message })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClientError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
            })
    }

    /// Registers a handler for one inbound message kind.
    pub(crate) fn subscribe(
        &self,
        ty: MessageType,
        handler: impl Fn(&ConnectionMessage) + Send + Sync + 'static,
    ) {
        self.subscribers
            .lock()
            .expect("bus lock poisoned")
            .entry(ty)
            .or_default()
            .push(Box::new(handler));
    }

    /// Routes an inbound frame that is not transport control: server replies
    /// complete their pending entry, invocation acks complete their
    /// invocation, everything else goes to subscribers.
    pub(crate) fn route(&self, message: ConnectionMessage) -> ReplyOutcome {
        if message.message_ack().is_some() {
            return self.complete_reply(message);
        }
        if let ConnectionMessage::InvokeServiceAck { invocation_id, .. } = &message {
            self.complete_invocation(invocation_id.clone(), message);
            return ReplyOutcome::Completed;
        }
        self.dispatch(&message);
        ReplyOutcome::Completed
    }

    fn complete_reply(&self, message: ConnectionMessage) -> ReplyOutcome {
        let ack = message.message_ack().unwrap_or_default();
        let entry = {
            let mut correlation = self.correlation.lock().expect("bus lock poisoned");
            match correlation.pending.remove(&ack) {
                Some(entry) => Some(entry),
                None if correlation.discarded.remove(&ack) => {
                    debug!("dropping reply {ack} for a cancelled request");
                    return ReplyOutcome::Discarded;
                }
                None => None,
            }
        };
        match entry {
            Some(entry) => {
                // the receiver may have timed out and gone away; that is
                // its business, not an error
                let _ = entry.reply.send(Ok(message));
                ReplyOutcome::Completed
            }
            None => {
                error!("reply {ack} matches no outstanding request");
                ReplyOutcome::Orphan
            }
        }
    }

    fn complete_invocation(&self, invocation_id: String, message: ConnectionMessage) {
        let entry = {
            let mut correlation = self.correlation.lock().expect("bus lock poisoned");
            match correlation.invocation_index.remove(&invocation_id) {
                Some(seq) => correlation.invocations.remove(&seq),
                None => None,
            }
        };
        match entry {
            Some(entry) => {
                let _ = entry.reply.send(Ok(message));
            }
            None => {
                // cancelled or already completed; a duplicate after a
                // replay lands here too
                debug!("dropping invocation ack {invocation_id} with no waiter");
            }
        }
    }

    fn dispatch(&self, message: &ConnectionMessage) {
        let subscribers = self.subscribers.lock().expect("bus lock poisoned");
        let Some(handlers) = subscribers.get(&message.message_type()) else {
            warn!("no subscriber for {:?}", message.message_type());
            return;
        };
        for handler in handlers {
            handler(message);
        }
    }

    /// Everything that must be re-sent when the server resumes the session:
    /// numbered requests in ascending `reply_to` order, then outstanding
    /// invocations in original send order. The returned watermark is the
    /// highest correlation number issued so far; queued outbound copies at
    /// or below it are superseded by this snapshot.
    pub(crate) fn replay_snapshot(&self) -> (Vec<ConnectionMessage>, u64) {
        let correlation = self.correlation.lock().expect("bus lock poisoned");
        let snapshot = correlation
            .pending
            .values()
            .map(|p| p.message.clone())
            .chain(correlation.invocations.values().map(|i| i.message.clone()))
            .collect();
        (snapshot, correlation.next_id)
    }

    /// Fails every outstanding request and invocation. Returns the same
    /// watermark as [`Self::replay_snapshot`].
    pub(crate) fn fail_all(&self, error: &ClientError) -> u64 {
        let (pending, invocations, watermark) = {
            let mut correlation = self.correlation.lock().expect("bus lock poisoned");
            correlation.invocation_index.clear();
            correlation.discarded.clear();
            (
                std::mem::take(&mut correlation.pending),
                std::mem::take(&mut correlation.invocations),
                correlation.next_id,
            )
        };
        for (_, entry) in pending {
            let _ = entry.reply.send(Err(error.clone()));
        }
        for (_, entry) in invocations {
            let _ = entry.reply.send(Err(error.clone()));
        }
        watermark
    }

    pub(crate) fn discard_request(&self, reply_to: u64) {
        let mut correlation = self.correlation.lock().expect("bus lock poisoned");
        if correlation.pending.remove(&reply_to).is_some() {
            correlation.discarded.insert(reply_to);
        }
    }

    pub(crate) fn discard_invocation(&self, invocation_id: &str) {
        let mut correlation = self.correlation.lock().expect("bus lock poisoned");
        if let Some(seq) = correlation.invocation_index.remove(invocation_id) {
            correlation.invocations.remove(&seq);
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding_requests(&self) -> Vec<u64> {
        self.correlation
            .lock()
            .expect("bus lock poisoned")
            .pending
            .keys()
            .copied()
            .collect()
    }
}

impl Correlation {
    fn take_id(&mut self) -> Result<u64, ClientError> {
        // a u64 will not wrap in practice; if it somehow does, refuse to
        // reuse numbers rather than mis-correlate
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| ClientError::protocol("request number space exhausted"))?;
        Ok(self.next_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmtp_core::RegisterService;

    fn bus() -> (Arc<MessageBus>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (MessageBus::new(tx), rx)
    }

    fn register(bus: &Arc<MessageBus>, channel: &str) -> ConnectionFuture<()> {
        bus.send_request(RegisterService {
            channel: channel.to_owned(),
        })
        .unwrap()
    }

    #[test]
    fn request_numbers_strictly_increase_in_enqueue_order() {
        let (bus, mut rx) = bus();
        let _a = register(&bus, "a");
        let _b = register(&bus, "b");
        let _c = register(&bus, "c");
        let mut last = 0;
        while let Ok(out) = rx.try_recv() {
            let reply_to = out.message.reply_to().unwrap();
            assert_eq!(out.seq, Some(reply_to));
            assert!(reply_to > last);
            last = reply_to;
        }
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn pending_entry_lives_until_the_reply() {
        let (bus, _rx) = bus();
        let fut = register(&bus, "a");
        assert_eq!(bus.outstanding_requests(), vec![1]);
        let outcome = bus.route(ConnectionMessage::RegisterServiceAck { message_ack: 1 });
        assert_eq!(outcome, ReplyOutcome::Completed);
        assert!(bus.outstanding_requests().is_empty());
        fut.get().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_request_discards_its_late_reply() {
        let (bus, _rx) = bus();
        let mut fut = register(&bus, "a");
        fut.cancel();
        assert!(bus.outstanding_requests().is_empty());
        let outcome = bus.route(ConnectionMessage::RegisterServiceAck { message_ack: 1 });
        assert_eq!(outcome, ReplyOutcome::Discarded);
        // only once; a second stray reply is an orphan again
        let outcome = bus.route(ConnectionMessage::RegisterServiceAck { message_ack: 1 });
        assert_eq!(outcome, ReplyOutcome::Orphan);
    }

    #[test]
    fn unknown_reply_is_an_orphan() {
        let (bus, _rx) = bus();
        let _fut = register(&bus, "a");
        let outcome = bus.route(ConnectionMessage::RegisterServiceAck { message_ack: 9999 });
        assert_eq!(outcome, ReplyOutcome::Orphan);
    }

    #[test]
    fn full_outbound_queue_is_backpressure() {
        let (tx, _rx) = mpsc::channel(1);
        let bus = MessageBus::new(tx);
        assert!(register_result(&bus).is_ok());
        assert_eq!(register_result(&bus).unwrap_err(), ClientError::Backpressure);
        // the failed request must not leave a pending entry behind
        assert_eq!(bus.outstanding_requests().len(), 1);
    }

    fn register_result(bus: &Arc<MessageBus>) -> Result<ConnectionFuture<()>, ClientError> {
        bus.send_request(RegisterService {
            channel: "x".to_owned(),
        })
    }

    #[tokio::test]
    async fn fail_all_fails_every_waiter() {
        let (bus, _rx) = bus();
        let fut = register(&bus, "a");
        bus.fail_all(&ClientError::ConnectionLost);
        assert_eq!(fut.get().await.unwrap_err(), ClientError::ConnectionLost);
    }

    #[test]
    fn replay_snapshot_is_ordered() {
        let (bus, _rx) = bus();
        let _a = register(&bus, "a");
        let _b = register(&bus, "b");
        let (snapshot, watermark) = bus.replay_snapshot();
        let ids: Vec<_> = snapshot.iter().map(|m| m.reply_to().unwrap()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(watermark, 2);
    }
}
