//! An in-memory server good enough to exercise the whole client engine:
//! welcome/hello/connected handshake with session retention, request
//! dedupe with cached-ack resend, service and invocation routing, and
//! broadcast fan-out with receipt generation. Frames cross the same JSON
//! codec the real transport uses.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mmtp_core::{
    ClientError, ConnectionMessage, MaritimeId, PROTOCOL_VERSION, PositionTime, decode, encode,
};
use mmtp_tokio::{Connector, LinkFrame, TransportEvent, TransportLink};
use tokio::sync::mpsc;

#[derive(Default)]
struct SessionRec {
    connection_id: String,
    link: Option<(u64, mpsc::Sender<TransportEvent>)>,
    /// Frames for this client while its link is down; flushed on re-attach.
    outbox: Vec<String>,
    /// Cached ack frames by reply_to, re-sent verbatim on a replayed
    /// request instead of processing it twice.
    answered: HashMap<u64, String>,
    last_position: Option<PositionTime>,
}

#[derive(Default)]
struct NetState {
    next_connection: u64,
    sessions: HashMap<MaritimeId, SessionRec>,
    providers: HashMap<String, Vec<MaritimeId>>,
    /// invocation id -> requester, for routing the ack back.
    invocation_routes: HashMap<String, MaritimeId>,
    forwarded_invocations: HashSet<String>,
    /// Every inbound protocol message, duplicates included.
    log: Vec<(MaritimeId, ConnectionMessage)>,
}

pub struct MockNet {
    state: Mutex<NetState>,
    next_link: AtomicU64,
    accepts: AtomicU64,
    refuse: AtomicBool,
    welcome_then_close: AtomicBool,
    retain_sessions: AtomicBool,
}

impl MockNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetState::default()),
            next_link: AtomicU64::new(1),
            accepts: AtomicU64::new(0),
            refuse: AtomicBool::new(false),
            welcome_then_close: AtomicBool::new(false),
            retain_sessions: AtomicBool::new(true),
        })
    }

    pub fn connector(self: &Arc<Self>) -> MockConnector {
        MockConnector {
            net: Arc::clone(self),
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn close_after_welcome(&self, close: bool) {
        self.welcome_then_close.store(close, Ordering::SeqCst);
    }

    pub fn accept_count(&self) -> u64 {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Sessions with a live link.
    pub fn connection_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.sessions.values().filter(|s| s.link.is_some()).count()
    }

    /// Every protocol message the server saw, duplicates included.
    pub fn log(&self) -> Vec<(MaritimeId, ConnectionMessage)> {
        self.state.lock().unwrap().log.clone()
    }

    /// Drops every live link, as a flaky network would.
    pub fn kill_all(&self) {
        let links: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state
                .sessions
                .values_mut()
                .filter_map(|s| s.link.take())
                .collect()
        };
        for (_, tx) in links {
            let _ = tx.try_send(TransportEvent::Closed {
                reason: "killed".to_owned(),
            });
        }
    }

    /// Kills all links every `period` until the returned handle is aborted.
    pub fn chaos(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let net = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                net.kill_all();
            }
        })
    }

    /// Pushes a raw frame to a connected client, for fault injection.
    pub fn inject(&self, client: &MaritimeId, message: &ConnectionMessage) {
        let state = self.state.lock().unwrap();
        if let Some((_, tx)) = state.sessions.get(client).and_then(|s| s.link.as_ref()) {
            let _ = tx.try_send(TransportEvent::Frame(encode(message)));
        }
    }

    fn accept(self: &Arc<Self>) -> Result<TransportLink, ClientError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::connect_failed("connection refused"));
        }
        self.accepts.fetch_add(1, Ordering::SeqCst);
        let (frame_tx, frame_rx) = mpsc::channel::<LinkFrame>(256);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(256);
        let net = Arc::clone(self);
        tokio::spawn(net.serve(frame_rx, event_tx));
        Ok(TransportLink {
            tx: frame_tx,
            events: event_rx,
        })
    }

    async fn serve(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<LinkFrame>,
        events: mpsc::Sender<TransportEvent>,
    ) {
        let token = self.next_link.fetch_add(1, Ordering::SeqCst);
        let welcome = ConnectionMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            server_id: MaritimeId::parse("mmsi://999999999").unwrap(),
            banner: "mock".to_owned(),
        };
        let _ = events.try_send(TransportEvent::Frame(encode(&welcome)));
        if self.welcome_then_close.load(Ordering::SeqCst) {
            let _ = events
                .try_send(TransportEvent::Closed {
                    reason: "rejected".to_owned(),
                });
            return;
        }

        let mut client: Option<MaritimeId> = None;
        while let Some(frame) = frames.recv().await {
            let LinkFrame::Text(text) = frame else {
                continue;
            };
            let message = decode(&text).expect("mock server got a malformed frame");
            self.handle(token, &events, &mut client, message);
        }

        // link gone; detach if this incarnation is still the current one
        if let Some(client) = client {
            let mut state = self.state.lock().unwrap();
            if let Some(session) = state.sessions.get_mut(&client) {
                if session.link.as_ref().is_some_and(|(t, _)| *t == token) {
                    session.link = None;
                }
            }
        }
    }

    fn handle(
        &self,
        token: u64,
        events: &mpsc::Sender<TransportEvent>,
        client: &mut Option<MaritimeId>,
        message: ConnectionMessage,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(client) = client {
            state.log.push((client.clone(), message.clone()));
        }
        match message {
            ConnectionMessage::Hello {
                client_id,
                position,
            } => {
                *client = Some(client_id.clone());
                state.log.push((
                    client_id.clone(),
                    ConnectionMessage::Hello {
                        client_id: client_id.clone(),
                        position,
                    },
                ));
                let retained = self.retain_sessions.load(Ordering::SeqCst);
                state.next_connection += 1;
                let fresh = format!("conn-{}", state.next_connection);
                let session = state.sessions.entry(client_id.clone()).or_default();
                if session.connection_id.is_empty() || !retained {
                    session.connection_id = fresh;
                }
                session.link = Some((token, events.clone()));
                session.last_position = position;
                let connected = ConnectionMessage::Connected {
                    connection_id: session.connection_id.clone(),
                };
                let backlog: Vec<String> = session.outbox.drain(..).collect();
                let _ = events.try_send(TransportEvent::Frame(encode(&connected)));
                for frame in backlog {
                    let _ = events.try_send(TransportEvent::Frame(frame));
                }
            }
            ConnectionMessage::PositionReport { position } => {
                if let Some(id) = client {
                    if let Some(session) = state.sessions.get_mut(id) {
                        session.last_position = Some(position);
                    }
                }
            }
            ConnectionMessage::RegisterService { reply_to, channel } => {
                let Some(id) = client.clone() else { return };
                if Self::resend_cached(&mut state, &id, reply_to, events) {
                    return;
                }
                let providers = state.providers.entry(channel).or_default();
                if !providers.contains(&id) {
                    providers.push(id.clone());
                }
                let ack = ConnectionMessage::RegisterServiceAck {
                    message_ack: reply_to,
                };
                Self::answer(&mut state, &id, reply_to, &ack, events);
            }
            ConnectionMessage::FindService {
                reply_to,
                channel,
                limit,
            } => {
                let Some(id) = client.clone() else { return };
                if Self::resend_cached(&mut state, &id, reply_to, events) {
                    return;
                }
                let mut providers = state.providers.get(&channel).cloned().unwrap_or_default();
                providers.truncate(limit as usize);
                let ack = ConnectionMessage::FindServiceAck {
                    message_ack: reply_to,
                    providers,
                };
                Self::answer(&mut state, &id, reply_to, &ack, events);
            }
            ConnectionMessage::BroadcastSend {
                reply_to,
                src,
                position,
                channel,
                payload,
                options,
                broadcast_id,
            } => {
                let Some(id) = client.clone() else { return };
                if Self::resend_cached(&mut state, &id, reply_to, events) {
                    return;
                }
                let ack = ConnectionMessage::BroadcastSendAck {
                    message_ack: reply_to,
                    broadcast_id: broadcast_id.clone(),
                };
                Self::answer(&mut state, &id, reply_to, &ack, events);
                let recipients: Vec<MaritimeId> = state
                    .sessions
                    .keys()
                    .filter(|peer| **peer != src)
                    .cloned()
                    .collect();
                for recipient in recipients {
                    let deliver = ConnectionMessage::BroadcastDeliver {
                        src: src.clone(),
                        position,
                        channel: channel.clone(),
                        payload: payload.clone(),
                    };
                    Self::deliver(&mut state, &recipient, &deliver);
                    if options.receipt_required {
                        let recipient_position = state
                            .sessions
                            .get(&recipient)
                            .and_then(|s| s.last_position);
                        let receipt = ConnectionMessage::BroadcastAck {
                            broadcast_id: broadcast_id.clone(),
                            recipient_id: recipient.clone(),
                            recipient_position,
                        };
                        Self::deliver(&mut state, &src, &receipt);
                    }
                }
            }
            ConnectionMessage::InvokeService {
                ref dst,
                ref invocation_id,
                ..
            } => {
                let Some(src) = client.clone() else { return };
                if state.forwarded_invocations.contains(invocation_id) {
                    return;
                }
                state.forwarded_invocations.insert(invocation_id.clone());
                state.invocation_routes.insert(invocation_id.clone(), src);
                Self::deliver(&mut state, &dst.clone(), &message);
            }
            ConnectionMessage::InvokeServiceAck {
                ref invocation_id, ..
            } => {
                if let Some(requester) = state.invocation_routes.remove(invocation_id) {
                    Self::deliver(&mut state, &requester, &message);
                }
            }
            ConnectionMessage::Bye { .. } => {
                if let Some(id) = client {
                    if let Some(session) = state.sessions.get_mut(id) {
                        if session.link.as_ref().is_some_and(|(t, _)| *t == token) {
                            session.link = None;
                        }
                    }
                }
                let _ = events.try_send(TransportEvent::Closed {
                    reason: "bye".to_owned(),
                });
            }
            other => panic!("mock server got an unexpected message: {other:?}"),
        }
    }

    /// Re-sends the cached ack for a replayed request. True when handled.
    fn resend_cached(
        state: &mut NetState,
        id: &MaritimeId,
        reply_to: u64,
        events: &mpsc::Sender<TransportEvent>,
    ) -> bool {
        let Some(session) = state.sessions.get(id) else {
            return false;
        };
        if let Some(frame) = session.answered.get(&reply_to) {
            let _ = events.try_send(TransportEvent::Frame(frame.clone()));
            true
        } else {
            false
        }
    }

    fn answer(
        state: &mut NetState,
        id: &MaritimeId,
        reply_to: u64,
        ack: &ConnectionMessage,
        events: &mpsc::Sender<TransportEvent>,
    ) {
        let frame = encode(ack);
        if let Some(session) = state.sessions.get_mut(id) {
            session.answered.insert(reply_to, frame.clone());
        }
        let _ = events.try_send(TransportEvent::Frame(frame));
    }

    fn deliver(state: &mut NetState, id: &MaritimeId, message: &ConnectionMessage) {
        let frame = encode(message);
        let Some(session) = state.sessions.get_mut(id) else {
            return;
        };
        match &session.link {
            Some((_, tx)) => {
                if tx.try_send(TransportEvent::Frame(frame.clone())).is_err() {
                    session.outbox.push(frame);
                }
            }
            None => session.outbox.push(frame),
        }
    }
}

#[derive(Clone)]
pub struct MockConnector {
    net: Arc<MockNet>,
}

impl Connector for MockConnector {
    async fn connect(&self, _url: &str, _timeout: Duration) -> Result<TransportLink, ClientError> {
        self.net.accept()
    }
}
