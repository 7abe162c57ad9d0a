use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ClientError, MaritimeId, PositionTime};

/// The closed set of wire message kinds.
///
/// Each kind has a small integer id that is the first element of every
/// framed JSON array; the receiver selects a decoder by it. Ids 1-9 are
/// transport control, 1xx are numbered server requests and their acks,
/// 2xx are client-to-client traffic relayed by the server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageType {
    Welcome = 1,
    Hello = 2,
    Connected = 3,
    Bye = 4,
    PositionReport = 5,
    RegisterService = 100,
    RegisterServiceAck = 101,
    FindService = 110,
    FindServiceAck = 111,
    BroadcastSend = 120,
    BroadcastSendAck = 121,
    InvokeService = 200,
    InvokeServiceAck = 201,
    BroadcastDeliver = 210,
    BroadcastAck = 211,
}

impl MessageType {
    #[must_use]
    pub fn id(self) -> u64 {
        self as u64
    }

    #[must_use]
    pub fn from_id(id: u64) -> Option<Self> {
        Some(match id {
            1 => Self::Welcome,
            2 => Self::Hello,
            3 => Self::Connected,
            4 => Self::Bye,
            5 => Self::PositionReport,
            100 => Self::RegisterService,
            101 => Self::RegisterServiceAck,
            110 => Self::FindService,
            111 => Self::FindServiceAck,
            120 => Self::BroadcastSend,
            121 => Self::BroadcastSendAck,
            200 => Self::InvokeService,
            201 => Self::InvokeServiceAck,
            210 => Self::BroadcastDeliver,
            211 => Self::BroadcastAck,
            _ => return None,
        })
    }
}

/// Options attached to an outbound broadcast. The client forwards them
/// verbatim; interpretation (area filtering, expiry, receipt generation)
/// happens on the server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_meters: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub receipt_required: bool,
}

impl BroadcastOptions {
    #[must_use]
    pub fn with_receipt(mut self) -> Self {
        self.receipt_required = true;
        self
    }

    #[must_use]
    pub fn within_radius(mut self, meters: u64) -> Self {
        self.radius_meters = Some(meters);
        self
    }
}

/// A complete wire message, one variant per [`MessageType`].
///
/// Numbered server requests carry a client-assigned strictly increasing
/// `reply_to`; the matching ack echoes it as `message_ack`. Client-to-client
/// messages are correlated by their 128-bit hex `invocation_id` /
/// `broadcast_id` instead.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionMessage {
    Welcome {
        protocol_version: u32,
        server_id: MaritimeId,
        banner: String,
    },
    Hello {
        client_id: MaritimeId,
        position: Option<PositionTime>,
    },
    Connected {
        connection_id: String,
    },
    Bye {
        reason: String,
    },
    PositionReport {
        position: PositionTime,
    },
    RegisterService {
        reply_to: u64,
        channel: String,
    },
    RegisterServiceAck {
        message_ack: u64,
    },
    FindService {
        reply_to: u64,
        channel: String,
        limit: u32,
    },
    FindServiceAck {
        message_ack: u64,
        providers: Vec<MaritimeId>,
    },
    BroadcastSend {
        reply_to: u64,
        src: MaritimeId,
        position: Option<PositionTime>,
        channel: String,
        payload: Value,
        options: BroadcastOptions,
        broadcast_id: String,
    },
    BroadcastSendAck {
        message_ack: u64,
        broadcast_id: String,
    },
    InvokeService {
        src: MaritimeId,
        dst: MaritimeId,
        channel: String,
        payload: Value,
        invocation_id: String,
    },
    InvokeServiceAck {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    BroadcastDeliver {
        src: MaritimeId,
        position: Option<PositionTime>,
        channel: String,
        payload: Value,
    },
    BroadcastAck {
        broadcast_id: String,
        recipient_id: MaritimeId,
        recipient_position: Option<PositionTime>,
    },
}

impl ConnectionMessage {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Welcome { .. } => MessageType::Welcome,
            Self::Hello { .. } => MessageType::Hello,
            Self::Connected { .. } => MessageType::Connected,
            Self::Bye { .. } => MessageType::Bye,
            Self::PositionReport { .. } => MessageType::PositionReport,
            Self::RegisterService { .. } => MessageType::RegisterService,
            Self::RegisterServiceAck { .. } => MessageType::RegisterServiceAck,
            Self::FindService { .. } => MessageType::FindService,
            Self::FindServiceAck { .. } => MessageType::FindServiceAck,
            Self::BroadcastSend { .. } => MessageType::BroadcastSend,
            Self::BroadcastSendAck { .. } => MessageType::BroadcastSendAck,
            Self::InvokeService { .. } => MessageType::InvokeService,
            Self::InvokeServiceAck { .. } => MessageType::InvokeServiceAck,
            Self::BroadcastDeliver { .. } => MessageType::BroadcastDeliver,
            Self::BroadcastAck { .. } => MessageType::BroadcastAck,
        }
    }

    /// The echoed request number, for ack kinds.
    #[must_use]
    pub fn message_ack(&self) -> Option<u64> {
        match self {
            Self::RegisterServiceAck { message_ack }
            | Self::FindServiceAck { message_ack, .. }
            | Self::BroadcastSendAck { message_ack, .. } => Some(*message_ack),
            _ => None,
        }
    }

    /// The client-assigned request number, for numbered request kinds.
    #[must_use]
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            Self::RegisterService { reply_to, .. }
            | Self::FindService { reply_to, .. }
            | Self::BroadcastSend { reply_to, .. } => Some(*reply_to),
            _ => None,
        }
    }
}

/// A numbered server request together with the typed result its ack
/// decodes to. The bus assigns `reply_to` and correlates the ack.
pub trait RequestBody: Send {
    type Output: Send + 'static;

    fn into_message(self, reply_to: u64) -> ConnectionMessage;

    /// Decodes the correlated ack.
    ///
    /// # Errors
    /// Returns [`ClientError::Protocol`] when the ack is of an unexpected
    /// kind for this request.
    fn decode(ack: ConnectionMessage) -> Result<Self::Output, ClientError>;
}

/// Registers a local service under `channel`.
pub struct RegisterService {
    pub channel: String,
}

impl RequestBody for RegisterService {
    type Output = ();

    fn into_message(self, reply_to: u64) -> ConnectionMessage {
        ConnectionMessage::RegisterService {
            reply_to,
            channel: self.channel,
        }
    }

    fn decode(ack: ConnectionMessage) -> Result<(), ClientError> {
        match ack {
            ConnectionMessage::RegisterServiceAck { .. } => Ok(()),
            other => Err(ClientError::protocol(format!(
                "expected RegisterServiceAck, got {:?}",
                other.message_type()
            ))),
        }
    }
}

/// Asks the server for up to `limit` providers of `channel`, closest first.
pub struct FindService {
    pub channel: String,
    pub limit: u32,
}

impl RequestBody for FindService {
    type Output = Vec<MaritimeId>;

    fn into_message(self, reply_to: u64) -> ConnectionMessage {
        ConnectionMessage::FindService {
            reply_to,
            channel: self.channel,
            limit: self.limit,
        }
    }

    fn decode(ack: ConnectionMessage) -> Result<Vec<MaritimeId>, ClientError> {
        match ack {
            ConnectionMessage::FindServiceAck { providers, .. } => Ok(providers),
            other => Err(ClientError::protocol(format!(
                "expected FindServiceAck, got {:?}",
                other.message_type()
            ))),
        }
    }
}

/// Hands a broadcast to the server for fan-out.
pub struct BroadcastSend {
    pub src: MaritimeId,
    pub position: Option<PositionTime>,
    pub channel: String,
    pub payload: Value,
    pub options: BroadcastOptions,
    pub broadcast_id: String,
}

impl RequestBody for BroadcastSend {
    type Output = String;

    fn into_message(self, reply_to: u64) -> ConnectionMessage {
        ConnectionMessage::BroadcastSend {
            reply_to,
            src: self.src,
            position: self.position,
            channel: self.channel,
            payload: self.payload,
            options: self.options,
            broadcast_id: self.broadcast_id,
        }
    }

    fn decode(ack: ConnectionMessage) -> Result<String, ClientError> {
        match ack {
            ConnectionMessage::BroadcastSendAck { broadcast_id, .. } => Ok(broadcast_id),
            other => Err(ClientError::protocol(format!(
                "expected BroadcastSendAck, got {:?}",
                other.message_type()
            ))),
        }
    }
}

/// A typed service definition: the invocation payload, its reply type and
/// the channel both travel under. The channel doubles as the registration
/// key, so two services may not share a `CHANNEL` on one client.
pub trait ServiceMessage: Serialize + DeserializeOwned + Send + 'static {
    type Reply: Serialize + DeserializeOwned + Send + 'static;

    const CHANNEL: &'static str;
}

/// A typed broadcast payload and the channel it is published on.
pub trait BroadcastPayload: Serialize + DeserializeOwned + Send + 'static {
    const CHANNEL: &'static str;
}
