//! The connection driver: one task owning the session machine and every
//! transport incarnation it lives over.

use std::sync::Arc;
use std::time::Instant;

use mmtp_core::{
    ClientConfig, ClientError, ConnectionMessage, Deadline, Session, SessionContext, SessionEvent,
    State, decode, encode,
};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until};
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, Outbound, ReplyOutcome};
use crate::position::PositionTracker;
use crate::transport::{Connector, LinkFrame, TransportEvent, TransportLink};

/// Requests from the facade to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Close { reason: String },
}

/// The externally visible phase of the logical session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionPhase {
    Handshaking,
    Connected { resumed: bool },
    Resuming,
    Reconnecting,
    Closing,
    Terminated,
    Failed(ClientError),
}

/// What the per-state work arm of the driver loop decided to do.
enum Work {
    HandshakeExpired,
    Dialed(TransportLink),
    DialFailed(ClientError),
    KeepAlive,
    FinishClose,
}

pub(crate) struct Driver<C: Connector> {
    connector: C,
    config: ClientConfig,
    session: Session,
    ctx: SessionContext,
    bus: Arc<MessageBus>,
    position: Arc<PositionTracker>,
    outbound_rx: mpsc::Receiver<Outbound>,
    command_rx: mpsc::Receiver<Command>,
    phase_tx: watch::Sender<SessionPhase>,
    link: Option<TransportLink>,
    /// Consecutive failed dial attempts since the last accepted handshake.
    attempt: u32,
    established_once: bool,
    /// Whether the most recent handshake resumed the previous session.
    resumed: bool,
    /// Outbound queue entries with a correlation number at or below this
    /// were superseded by a replay or a failure sweep; drop them unsent.
    skip_through: u64,
}

impl<C: Connector> Driver<C> {
    pub(crate) fn new(
        connector: C,
        config: ClientConfig,
        bus: Arc<MessageBus>,
        position: Arc<PositionTracker>,
        outbound_rx: mpsc::Receiver<Outbound>,
        command_rx: mpsc::Receiver<Command>,
        phase_tx: watch::Sender<SessionPhase>,
    ) -> Self {
        let mut ctx = SessionContext::default();
        let session = Session::new(
            config.local_id.clone(),
            config.handshake_timeout,
            &mut ctx,
        );
        Self {
            connector,
            config,
            session,
            ctx,
            bus,
            position,
            outbound_rx,
            command_rx,
            phase_tx,
            link: None,
            attempt: 0,
            established_once: false,
            resumed: false,
            skip_through: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        // the first dial is special: a failure here is reported to the
        // caller of connect() and no reconnect regime starts
        match self
            .connector
            .connect(&self.config.url(), self.config.handshake_timeout)
            .await
        {
            Ok(link) => {
                self.link = Some(link);
                self.feed(SessionEvent::TransportUp {
                    now: Instant::now(),
                });
            }
            Err(e) => {
                self.finish(e.clone(), SessionPhase::Failed(e));
                return;
            }
        }
        self.publish_phase();

        loop {
            select! {
                biased;

                // 1. frames the state machine queued (hello, bye)
                msg = self.ctx.transmit_future(), if self.link.is_some() => {
                    self.send_frame(msg).await;
                }

                // 2. facade commands
                cmd = self.command_rx.recv() => {
                    let reason = match cmd {
                        Some(Command::Close { reason }) => reason,
                        None => "client handle dropped".to_owned(),
                    };
                    self.feed(SessionEvent::CloseRequested { reason });
                }

                // 3. application traffic, only while the session is live;
                //    everything submitted during a reconnect waits here
                out = self.outbound_rx.recv(),
                    if self.link.is_some() && matches!(self.session.state(), State::Connected {}) =>
                {
                    if let Some(out) = out {
                        if out.seq.is_some_and(|seq| seq <= self.skip_through) {
                            debug!("dropping superseded outbound frame {:?}", out.seq);
                        } else {
                            self.send_frame(out.message).await;
                        }
                    }
                }

                // 4. whatever the current state is waiting on
                work = state_work(&self.session, &self.ctx, &self.config, self.attempt, &self.connector) => {
                    self.on_work(work).await;
                }

                // 5. transport frames and the close notification
                event = async { self.link.as_mut().unwrap().events.recv().await },
                    if self.link.is_some() =>
                {
                    match event {
                        Some(TransportEvent::Frame(text)) => self.on_frame(&text),
                        Some(TransportEvent::Closed { reason }) => {
                            debug!("transport closed: {reason}");
                            self.link = None;
                            self.feed(SessionEvent::TransportDown);
                        }
                        None => {
                            self.link = None;
                            self.feed(SessionEvent::TransportDown);
                        }
                    }
                }
            }

            // a protocol error or server bye can demand a reconnect while
            // the socket is still up; the machine state is authoritative
            if matches!(self.session.state(), State::Reconnecting {}) && self.link.is_some() {
                self.link = None;
            }

            if matches!(self.session.state(), State::Resuming {}) {
                self.replay().await;
            }

            if !self.established_once
                && matches!(self.session.state(), State::Reconnecting {})
            {
                let e = ClientError::handshake_failed("connection lost before the handshake finished");
                self.finish(e.clone(), SessionPhase::Failed(e));
                return;
            }

            match self.session.state() {
                State::Failed {} => {
                    let e = ClientError::handshake_failed("server rejected the handshake");
                    self.finish(e.clone(), SessionPhase::Failed(e));
                    return;
                }
                State::Terminated {} => {
                    self.finish(ClientError::ConnectionLost, SessionPhase::Terminated);
                    return;
                }
                _ => {}
            }

            self.publish_phase();
        }
    }

    fn feed(&mut self, event: SessionEvent) {
        self.session.handle_with_context(&event, &mut self.ctx);
    }

    async fn on_work(&mut self, work: Work) {
        match work {
            Work::HandshakeExpired => {
                warn!("handshake did not finish in time");
                self.link = None;
                self.feed(SessionEvent::HandshakeExpired);
            }
            Work::Dialed(link) => {
                self.link = Some(link);
                self.feed(SessionEvent::TransportUp {
                    now: Instant::now(),
                });
            }
            Work::DialFailed(e) => {
                self.attempt += 1;
                if self.config.reconnect.exhausted(self.attempt) {
                    error!("giving up after {} failed reconnect attempts", self.attempt);
                    self.finish(e.clone(), SessionPhase::Failed(e));
                    // drive the machine terminal so the loop exits below
                    self.feed(SessionEvent::CloseRequested {
                        reason: "reconnect attempts exhausted".to_owned(),
                    });
                } else {
                    debug!("dial failed ({e}), attempt {}", self.attempt);
                }
            }
            Work::KeepAlive => {
                if let Some(link) = &self.link {
                    let _ = link.tx.send(LinkFrame::Ping).await;
                }
            }
            Work::FinishClose => {
                self.link = None;
                self.feed(SessionEvent::TransportDown);
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        let message = match decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping transport after malformed frame: {e}");
                self.link = None;
                self.feed(SessionEvent::TransportDown);
                return;
            }
        };
        match message {
            ConnectionMessage::Welcome {
                protocol_version,
                server_id,
                banner,
            } => {
                info!("welcome from {server_id} (protocol {protocol_version}): {banner}");
                let position = self.position.current();
                self.feed(SessionEvent::Welcome {
                    protocol_version,
                    position,
                });
            }
            ConnectionMessage::Connected { connection_id } => {
                self.feed(SessionEvent::Connected { connection_id });
                self.attempt = 0;
                self.resumed = matches!(self.session.state(), State::Resuming {});
                if self.session.take_session_lost() {
                    warn!("server issued a fresh session; requests bound to the old one are lost");
                    let watermark = self.bus.fail_all(&ClientError::ConnectionLost);
                    self.skip_through = self.skip_through.max(watermark);
                }
            }
            ConnectionMessage::Bye { reason } => {
                self.feed(SessionEvent::Bye { reason });
            }
            ConnectionMessage::Hello { .. } | ConnectionMessage::PositionReport { .. } => {
                warn!("server sent a client-only message; dropping transport");
                self.link = None;
                self.feed(SessionEvent::TransportDown);
            }
            other => {
                if self.bus.route(other) == ReplyOutcome::Orphan {
                    error!("orphan reply; the session is out of sync, dropping transport");
                    let watermark = self.bus.fail_all(&ClientError::ConnectionLost);
                    self.skip_through = self.skip_through.max(watermark);
                    self.link = None;
                    self.feed(SessionEvent::TransportDown);
                }
            }
        }
    }

    async fn send_frame(&mut self, message: ConnectionMessage) {
        let Some(link) = &self.link else {
            return;
        };
        if link.tx.send(LinkFrame::Text(encode(&message))).await.is_err() {
            debug!("transport went away mid-send");
            self.link = None;
            self.feed(SessionEvent::TransportDown);
        }
    }

    /// Re-sends every outstanding request in correlation order, then tells
    /// the machine the backlog is drained.
    async fn replay(&mut self) {
        let (snapshot, watermark) = self.bus.replay_snapshot();
        info!("resuming session, replaying {} outstanding messages", snapshot.len());
        self.skip_through = self.skip_through.max(watermark);
        for message in snapshot {
            self.send_frame(message).await;
            if self.link.is_none() {
                // the machine already went back to reconnecting
                return;
            }
        }
        self.feed(SessionEvent::ReplayDrained);
    }

    fn finish(&mut self, error: ClientError, phase: SessionPhase) {
        self.bus.fail_all(&error);
        self.outbound_rx.close();
        let _ = self.phase_tx.send(phase);
    }

    fn publish_phase(&mut self) {
        let previous = self.phase_tx.borrow().clone();
        let phase = match self.session.state() {
            State::Created {} | State::AwaitingWelcome { .. } | State::AwaitingConnected { .. } => {
                SessionPhase::Handshaking
            }
            State::Connected {} => {
                if matches!(previous, SessionPhase::Connected { .. }) {
                    previous.clone()
                } else {
                    SessionPhase::Connected {
                        resumed: self.resumed,
                    }
                }
            }
            State::Resuming {} => SessionPhase::Resuming,
            State::Reconnecting {} => SessionPhase::Reconnecting,
            State::Closing {} => SessionPhase::Closing,
            State::Terminated {} => SessionPhase::Terminated,
            State::Failed {} => {
                SessionPhase::Failed(ClientError::handshake_failed("server rejected the handshake"))
            }
        };
        if matches!(phase, SessionPhase::Connected { .. }) {
            self.established_once = true;
        }
        if phase != previous {
            let _ = self.phase_tx.send(phase);
        }
    }
}

/// The one thing the current state is waiting on, as a future. Recreated on
/// every loop iteration, so deadlines are re-read from the state each time.
async fn state_work<C: Connector>(
    session: &Session,
    ctx: &SessionContext,
    config: &ClientConfig,
    attempt: u32,
    connector: &C,
) -> Work {
    match session.state() {
        State::AwaitingWelcome { deadline: Deadline(at) }
        | State::AwaitingConnected { deadline: Deadline(at) } => {
            sleep_until((*at).into()).await;
            Work::HandshakeExpired
        }
        State::Reconnecting {} => {
            let delay = config.reconnect.delay_for(attempt, rand::random());
            debug!("reconnecting in {delay:?} (attempt {attempt})");
            sleep(delay).await;
            match connector.connect(&config.url(), config.handshake_timeout).await {
                Ok(link) => Work::Dialed(link),
                Err(e) => Work::DialFailed(e),
            }
        }
        State::Connected {} => {
            sleep(config.keep_alive_interval).await;
            Work::KeepAlive
        }
        State::Closing {} if ctx.is_drained() => Work::FinishClose,
        _ => std::future::pending().await,
    }
}
