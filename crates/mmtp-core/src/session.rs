use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use statig::{
    Response,
    prelude::{InitializedStateMachine, IntoStateMachineExt as _},
    state_machine,
};
use tracing::{debug, error, trace, warn};

use crate::{ConnectionMessage, Deadline, MaritimeId, PROTOCOL_VERSION, PendingSend, PositionTime};

/// Queues shared between the state machine and its driver.
///
/// The machine never performs I/O; frames it wants on the wire are pushed
/// onto `send_queue` and drained by whoever owns the transport.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionContext {
    send_queue: VecDeque<ConnectionMessage>,
}

impl SessionContext {
    pub fn poll_transmit(&mut self) -> Option<ConnectionMessage> {
        self.send_queue.pop_front()
    }

    pub fn transmit_future(&mut self) -> PendingSend {
        PendingSend::new(self.poll_transmit())
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.send_queue.is_empty()
    }
}

/// Inputs that drive one logical session across transport incarnations.
#[derive(Debug)]
pub enum SessionEvent {
    /// A transport incarnation opened.
    TransportUp { now: Instant },
    /// The server announced itself; the position rides along so the
    /// machine can answer with a complete hello.
    Welcome {
        protocol_version: u32,
        position: Option<PositionTime>,
    },
    /// The server attached this transport to a session.
    Connected { connection_id: String },
    /// The server asked us to go away.
    Bye { reason: String },
    /// The transport incarnation closed.
    TransportDown,
    /// The handshake deadline passed.
    HandshakeExpired,
    /// The driver finished re-sending outstanding requests.
    ReplayDrained,
    /// The application requested shutdown.
    CloseRequested { reason: String },
}

/// The session state machine.
#[derive(Debug, Clone)]
pub struct Session(InitializedStateMachine<SessionCore>);

impl Deref for Session {
    type Target = InitializedStateMachine<SessionCore>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Session {
    pub fn new(
        local_id: MaritimeId,
        handshake_timeout: Duration,
        ctx: &mut SessionContext,
    ) -> Self {
        let sm = SessionCore {
            local_id,
            handshake_timeout,
            connection_id: None,
            session_lost: std::sync::atomic::AtomicBool::new(false),
        }
        .uninitialized_state_machine()
        .init_with_context(ctx);
        Self(sm)
    }

    /// True when the server handed out a fresh session while an older one
    /// was held, meaning requests correlated against the old one can no
    /// longer complete. Reading clears the flag.
    pub fn take_session_lost(&self) -> bool {
        self.session_lost
            .swap(false, std::sync::atomic::Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct SessionCore {
    pub local_id: MaritimeId,
    pub handshake_timeout: Duration,
    /// Identity of the server-side session, set by the first `Connected`.
    pub connection_id: Option<String>,
    session_lost: std::sync::atomic::AtomicBool,
}

impl Clone for SessionCore {
    fn clone(&self) -> Self {
        Self {
            local_id: self.local_id.clone(),
            handshake_timeout: self.handshake_timeout,
            connection_id: self.connection_id.clone(),
            session_lost: std::sync::atomic::AtomicBool::new(
                self.session_lost.load(std::sync::atomic::Ordering::SeqCst),
            ),
        }
    }
}

#[state_machine(
    initial = "State::created()",
    on_transition = "Self::after_transition",
    state(derive(Clone, Debug, PartialEq, Eq))
)]
impl SessionCore {
    fn after_transition(&mut self, prev: &State, next: &State) {
        trace!("session moved from {prev:?} to {next:?}");
    }

    #[state]
    fn created(&mut self, event: &SessionEvent) -> Response<State> {
        match event {
            SessionEvent::TransportUp { now } => {
                Response::Transition(State::awaiting_welcome(Deadline(
                    *now + self.handshake_timeout,
                )))
            }
            SessionEvent::CloseRequested { .. } => Response::Transition(State::terminated()),
            SessionEvent::TransportDown => Response::Transition(State::reconnecting()),
            other => {
                error!("unexpected {other:?} before any transport came up");
                Response::Transition(State::failed())
            }
        }
    }

    #[state]
    fn awaiting_welcome(
        &mut self,
        context: &mut SessionContext,
        event: &SessionEvent,
        #[expect(unused_variables, reason = "deadline is armed by the driver")] deadline: &Deadline,
    ) -> Response<State> {
        match event {
            SessionEvent::Welcome {
                protocol_version,
                position,
            } => {
                if *protocol_version != PROTOCOL_VERSION {
                    error!(
                        "server speaks protocol version {protocol_version}, \
                         we support {PROTOCOL_VERSION}"
                    );
                    return Response::Transition(State::failed());
                }
                context.send_queue.push_back(ConnectionMessage::Hello {
                    client_id: self.local_id.clone(),
                    position: *position,
                });
                Response::Transition(State::awaiting_connected(Deadline(
                    Instant::now() + self.handshake_timeout,
                )))
            }
            SessionEvent::TransportDown | SessionEvent::HandshakeExpired => {
                Response::Transition(State::reconnecting())
            }
            SessionEvent::Bye { reason } => {
                warn!("server said bye during handshake: {reason}");
                Response::Transition(State::reconnecting())
            }
            SessionEvent::CloseRequested { .. } => Response::Transition(State::terminated()),
            other => {
                error!("unexpected {other:?} while waiting for welcome");
                Response::Transition(State::reconnecting())
            }
        }
    }

    #[state]
    fn awaiting_connected(
        &mut self,
        event: &SessionEvent,
        #[expect(unused_variables, reason = "deadline is armed by the driver")] deadline: &Deadline,
    ) -> Response<State> {
        match event {
            SessionEvent::Connected { connection_id } => {
                match self.connection_id.as_deref() {
                    Some(prior) if prior == connection_id => {
                        debug!("server retained session {connection_id}, resuming");
                        Response::Transition(State::resuming())
                    }
                    prior => {
                        if prior.is_some() {
                            // the server forgot us; anything correlated
                            // against the old session is gone
                            self.session_lost
                                .store(true, std::sync::atomic::Ordering::SeqCst);
                        }
                        self.connection_id = Some(connection_id.clone());
                        Response::Transition(State::connected())
                    }
                }
            }
            SessionEvent::TransportDown | SessionEvent::HandshakeExpired => {
                Response::Transition(State::reconnecting())
            }
            SessionEvent::Bye { reason } => {
                warn!("server said bye during handshake: {reason}");
                Response::Transition(State::reconnecting())
            }
            SessionEvent::CloseRequested { .. } => Response::Transition(State::terminated()),
            other => {
                error!("unexpected {other:?} while waiting for connected");
                Response::Transition(State::reconnecting())
            }
        }
    }

    #[state]
    fn resuming(&mut self, context: &mut SessionContext, event: &SessionEvent) -> Response<State> {
        match event {
            SessionEvent::ReplayDrained => Response::Transition(State::connected()),
            SessionEvent::TransportDown => Response::Transition(State::reconnecting()),
            SessionEvent::Bye { reason } => {
                warn!("server said bye during resume: {reason}");
                Response::Transition(State::reconnecting())
            }
            SessionEvent::CloseRequested { reason } => {
                context.send_queue.push_back(ConnectionMessage::Bye {
                    reason: reason.clone(),
                });
                Response::Transition(State::closing())
            }
            other => {
                error!("unexpected {other:?} while resuming");
                Response::Transition(State::reconnecting())
            }
        }
    }

    #[state]
    fn connected(
        &mut self,
        context: &mut SessionContext,
        event: &SessionEvent,
    ) -> Response<State> {
        match event {
            SessionEvent::TransportDown => Response::Transition(State::reconnecting()),
            SessionEvent::Bye { reason } => {
                warn!("server closed the session: {reason}");
                Response::Transition(State::reconnecting())
            }
            SessionEvent::CloseRequested { reason } => {
                context.send_queue.push_back(ConnectionMessage::Bye {
                    reason: reason.clone(),
                });
                Response::Transition(State::closing())
            }
            // a timer from a previous incarnation may still fire
            SessionEvent::HandshakeExpired | SessionEvent::ReplayDrained => Response::Handled,
            other => {
                error!("unexpected {other:?} while connected");
                Response::Transition(State::reconnecting())
            }
        }
    }

    #[state]
    fn reconnecting(&mut self, event: &SessionEvent) -> Response<State> {
        match event {
            SessionEvent::TransportUp { now } => {
                Response::Transition(State::awaiting_welcome(Deadline(
                    *now + self.handshake_timeout,
                )))
            }
            SessionEvent::CloseRequested { .. } => Response::Transition(State::terminated()),
            SessionEvent::TransportDown
            | SessionEvent::HandshakeExpired
            | SessionEvent::ReplayDrained => Response::Handled,
            other => {
                error!("unexpected {other:?} while reconnecting");
                Response::Handled
            }
        }
    }

    #[state]
    fn closing(&mut self, event: &SessionEvent) -> Response<State> {
        match event {
            SessionEvent::TransportDown => Response::Transition(State::terminated()),
            // close is idempotent, everything else is noise on the way out
            _ => Response::Handled,
        }
    }

    #[state]
    fn terminated() -> Response<State> {
        Response::Handled
    }

    /// Handshake was rejected; the session cannot recover.
    #[state]
    fn failed() -> Response<State> {
        Response::Handled
    }
}
