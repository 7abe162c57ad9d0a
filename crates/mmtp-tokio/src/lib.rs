//! Tokio engine for the maritime message transfer protocol.
//!
//! This crate turns the sans-io `mmtp-core` into a working client: a
//! WebSocket transport, a message bus with request correlation and
//! reconnect-time replay, typed service invocation, broadcast fan-out with
//! receipt aggregation, periodic position reports and the
//! [`PersistentConnection`] facade tying it all together.
//!
//! # Example
//!
//! See `examples/client.rs` for a complete client wiring a service, a
//! broadcast listener and periodic sends.

mod broadcast;
mod bus;
mod client;
mod connection;
mod future;
mod position;
mod service;
mod transport;

pub use broadcast::{BroadcastHeader, BroadcastManager, BroadcastSubscription};
pub use client::{
    ClientParams, ClientState, PersistentConnection, StateListenerHandle, connect, connect_with,
};
pub use connection::SessionPhase;
pub use future::{BroadcastAckEvent, BroadcastFuture, ConnectionFuture};
pub use position::PositionSupplier;
pub use service::{
    InvocationContext, InvocationHeader, ServiceLocator, ServiceManager, ServiceRegistration,
};
pub use transport::{Connector, LinkFrame, TransportEvent, TransportLink, WsConnector};
