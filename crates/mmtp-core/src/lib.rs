//! Protocol core of the maritime message transfer client.
//!
//! Everything in this crate is I/O-free: the wire message set and its JSON
//! array codec, peer identities, position values, the session state machine
//! and the configuration types. Driving an actual WebSocket is the job of
//! the `mmtp-tokio` crate.

mod codec;
mod config;
mod error;
mod identifier;
mod message;
mod position;
mod session;

pub use codec::{decode, encode};
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::ClientError;
pub use identifier::MaritimeId;
pub use message::{
    BroadcastOptions, BroadcastPayload, BroadcastSend, ConnectionMessage, FindService,
    MessageType, RegisterService, RequestBody, ServiceMessage,
};
pub use position::PositionTime;
pub use session::{Session, SessionContext, SessionCore, SessionEvent, State};

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

/// The protocol version this client speaks and expects in `Welcome`.
pub const PROTOCOL_VERSION: u32 = 1;

/// A point in time at which a pending handshake gives up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Deadline(pub Instant);

/// Resolves immediately with a queued outbound message, or never.
///
/// Built from [`SessionContext::transmit_future`]; inside a `select!` loop
/// the emptiness check happens on every iteration, so the never-resolving
/// case simply yields to the other branches.
pub struct PendingSend(Option<ConnectionMessage>);

impl PendingSend {
    #[must_use]
    pub fn new(msg: Option<ConnectionMessage>) -> Self {
        Self(msg)
    }
}

impl Future for PendingSend {
    type Output = ConnectionMessage;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(msg) = self.0.take() {
            Poll::Ready(msg)
        } else {
            Poll::Pending
        }
    }
}
