use thiserror::Error;

/// Every failure kind the client surfaces to applications.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Opening the transport failed or timed out.
    #[error("could not connect: {reason}")]
    ConnectFailed { reason: String },

    /// The welcome/hello/connected exchange was rejected or never finished.
    #[error("handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// A malformed frame or an unexpected message on the wire.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// The session was lost while the operation was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// A local wait elapsed; the operation may still complete on the wire.
    #[error("timed out")]
    Timeout,

    /// The remote side reported a failure.
    #[error("remote failure: {0}")]
    RemoteFailure(String),

    /// A service is already bound to the channel on this client.
    #[error("a service is already registered on channel {0}")]
    AlreadyRegistered(String),

    /// No provider answered a service lookup.
    #[error("no provider found for channel {0}")]
    NoProvider(String),

    /// The operation was cancelled locally.
    #[error("cancelled")]
    Cancelled,

    /// The outbound queue is full.
    #[error("send buffer full")]
    Backpressure,

    /// The client has been closed.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    #[must_use]
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn connect_failed(reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }
}
