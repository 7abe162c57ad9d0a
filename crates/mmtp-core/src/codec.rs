//! JSON array framing.
//!
//! Every frame on the wire is a JSON array whose first element is the
//! [`MessageType`] id and whose remaining elements are the fields of that
//! kind in a fixed order. Positions are encoded as a nested
//! `[latitude, longitude, time]` array or `null` when absent.

use serde_json::{Value, json};

use crate::message::{BroadcastOptions, ConnectionMessage, MessageType};
use crate::{ClientError, MaritimeId, PositionTime};

/// Serializes a message into its text frame.
#[must_use]
pub fn encode(msg: &ConnectionMessage) -> String {
    let mut frame = vec![json!(msg.message_type().id())];
    match msg {
        ConnectionMessage::Welcome {
            protocol_version,
            server_id,
            banner,
        } => {
            frame.push(json!(protocol_version));
            frame.push(json!(server_id));
            frame.push(json!(banner));
        }
        ConnectionMessage::Hello {
            client_id,
            position,
        } => {
            frame.push(json!(client_id));
            frame.push(encode_position(position.as_ref()));
        }
        ConnectionMessage::Connected { connection_id } => frame.push(json!(connection_id)),
        ConnectionMessage::Bye { reason } => frame.push(json!(reason)),
        ConnectionMessage::PositionReport { position } => {
            frame.push(encode_position(Some(position)));
        }
        ConnectionMessage::RegisterService { reply_to, channel } => {
            frame.push(json!(reply_to));
            frame.push(json!(channel));
        }
        ConnectionMessage::RegisterServiceAck { message_ack } => frame.push(json!(message_ack)),
        ConnectionMessage::FindService {
            reply_to,
            channel,
            limit,
        } => {
            frame.push(json!(reply_to));
            frame.push(json!(channel));
            frame.push(json!(limit));
        }
        ConnectionMessage::FindServiceAck {
            message_ack,
            providers,
        } => {
            frame.push(json!(message_ack));
            frame.push(json!(providers));
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
            frame.push(json!(reply_to));
            frame.push(json!(src));
            frame.push(encode_position(position.as_ref()));
            frame.push(json!(channel));
            frame.push(payload.clone());
            frame.push(json!(options));
            frame.push(json!(broadcast_id));
        }
        ConnectionMessage::BroadcastSendAck {
            message_ack,
            broadcast_id,
        } => {
            frame.push(json!(message_ack));
            frame.push(json!(broadcast_id));
        }
        ConnectionMessage::InvokeService {
            src,
            dst,
            channel,
            payload,
            invocation_id,
        } => {
            frame.push(json!(src));
            frame.push(json!(dst));
            frame.push(json!(channel));
            frame.push(payload.clone());
            frame.push(json!(invocation_id));
        }
        ConnectionMessage::InvokeServiceAck {
            invocation_id,
            result,
            error,
        } => {
            frame.push(json!(invocation_id));
            frame.push(result.clone().unwrap_or(Value::Null));
            frame.push(error.as_ref().map_or(Value::Null, |e| json!(e)));
        }
        ConnectionMessage::BroadcastDeliver {
            src,
            position,
            channel,
            payload,
        } => {
            frame.push(json!(src));
            frame.push(encode_position(position.as_ref()));
            frame.push(json!(channel));
            frame.push(payload.clone());
        }
        ConnectionMessage::BroadcastAck {
            broadcast_id,
            recipient_id,
            recipient_position,
        } => {
            frame.push(json!(broadcast_id));
            frame.push(json!(recipient_id));
            frame.push(encode_position(recipient_position.as_ref()));
        }
    }
    Value::Array(frame).to_string()
}

/// Parses a text frame back into a message.
///
/// # Errors
/// Returns [`ClientError::Protocol`] for anything that is not a JSON array
/// led by a known type id with correctly typed fields.
pub fn decode(frame: &str) -> Result<ConnectionMessage, ClientError> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|e| ClientError::protocol(format!("frame is not valid JSON: {e}")))?;
    let Value::Array(fields) = value else {
        return Err(ClientError::protocol("frame is not a JSON array"));
    };
    let mut reader = FieldReader::new(&fields);
    let id = reader.take_u64("message type")?;
    let Some(ty) = MessageType::from_id(id) else {
        return Err(ClientError::protocol(format!("unknown message type {id}")));
    };

    Ok(match ty {
        MessageType::Welcome => ConnectionMessage::Welcome {
            protocol_version: u32::try_from(reader.take_u64("protocol version")?)
                .map_err(|_| ClientError::protocol("protocol version out of range"))?,
            server_id: reader.take_id("server id")?,
            banner: reader.take_string("banner")?,
        },
        MessageType::Hello => ConnectionMessage::Hello {
            client_id: reader.take_id("client id")?,
            position: reader.take_position("position")?,
        },
        MessageType::Connected => ConnectionMessage::Connected {
            connection_id: reader.take_string("connection id")?,
        },
        MessageType::Bye => ConnectionMessage::Bye {
            reason: reader.take_string("reason")?,
        },
        MessageType::PositionReport => ConnectionMessage::PositionReport {
            position: reader
                .take_position("position")?
                .ok_or_else(|| ClientError::protocol("position report without position"))?,
        },
        MessageType::RegisterService => ConnectionMessage::RegisterService {
            reply_to: reader.take_u64("reply_to")?,
            channel: reader.take_string("channel")?,
        },
        MessageType::RegisterServiceAck => ConnectionMessage::RegisterServiceAck {
            message_ack: reader.take_u64("message_ack")?,
        },
        MessageType::FindService => ConnectionMessage::FindService {
            reply_to: reader.take_u64("reply_to")?,
            channel: reader.take_string("channel")?,
            limit: u32::try_from(reader.take_u64("limit")?)
                .map_err(|_| ClientError::protocol("limit out of range"))?,
        },
        MessageType::FindServiceAck => ConnectionMessage::FindServiceAck {
            message_ack: reader.take_u64("message_ack")?,
            providers: reader.take_ids("providers")?,
        },
        MessageType::BroadcastSend => ConnectionMessage::BroadcastSend {
            reply_to: reader.take_u64("reply_to")?,
            src: reader.take_id("src")?,
            position: reader.take_position("position")?,
            channel: reader.take_string("channel")?,
            payload: reader.take_value("payload")?,
            options: reader.take_options("options")?,
            broadcast_id: reader.take_string("broadcast id")?,
        },
        MessageType::BroadcastSendAck => ConnectionMessage::BroadcastSendAck {
            message_ack: reader.take_u64("message_ack")?,
            broadcast_id: reader.take_string("broadcast id")?,
        },
        MessageType::InvokeService => ConnectionMessage::InvokeService {
            src: reader.take_id("src")?,
            dst: reader.take_id("dst")?,
            channel: reader.take_string("channel")?,
            payload: reader.take_value("payload")?,
            invocation_id: reader.take_string("invocation id")?,
        },
        MessageType::InvokeServiceAck => ConnectionMessage::InvokeServiceAck {
            invocation_id: reader.take_string("invocation id")?,
            result: match reader.take_value("result")? {
                Value::Null => None,
                v => Some(v),
            },
            error: reader.take_optional_string("error")?,
        },
        MessageType::BroadcastDeliver => ConnectionMessage::BroadcastDeliver {
            src: reader.take_id("src")?,
            position: reader.take_position("position")?,
            channel: reader.take_string("channel")?,
            payload: reader.take_value("payload")?,
        },
        MessageType::BroadcastAck => ConnectionMessage::BroadcastAck {
            broadcast_id: reader.take_string("broadcast id")?,
            recipient_id: reader.take_id("recipient id")?,
            recipient_position: reader.take_position("recipient position")?,
        },
    })
}

fn encode_position(position: Option<&PositionTime>) -> Value {
    position.map_or(Value::Null, |p| {
        json!([p.latitude(), p.longitude(), p.time()])
    })
}

/// Sequential field access over a decoded frame.
struct FieldReader<'a> {
    fields: &'a [Value],
    next: usize,
}

impl<'a> FieldReader<'a> {
    fn new(fields: &'a [Value]) -> Self {
        Self { fields, next: 0 }
    }

    fn take(&mut self, what: &str) -> Result<&'a Value, ClientError> {
        let value = self
            .fields
            .get(self.next)
            .ok_or_else(|| ClientError::protocol(format!("frame is missing field: {what}")))?;
        self.next += 1;
        Ok(value)
    }

    fn take_u64(&mut self, what: &str) -> Result<u64, ClientError> {
        self.take(what)?
            .as_u64()
            .ok_or_else(|| ClientError::protocol(format!("{what} must be an unsigned integer")))
    }

    fn take_string(&mut self, what: &str) -> Result<String, ClientError> {
        Ok(self
            .take(what)?
            .as_str()
            .ok_or_else(|| ClientError::protocol(format!("{what} must be a string")))?
            .to_owned())
    }

    fn take_optional_string(&mut self, what: &str) -> Result<Option<String>, ClientError> {
        match self.take(what)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            _ => Err(ClientError::protocol(format!(
                "{what} must be a string or null"
            ))),
        }
    }

    fn take_id(&mut self, what: &str) -> Result<MaritimeId, ClientError> {
        let raw = self.take_string(what)?;
        MaritimeId::parse(raw)
    }

    fn take_ids(&mut self, what: &str) -> Result<Vec<MaritimeId>, ClientError> {
        let Value::Array(items) = self.take(what)? else {
            return Err(ClientError::protocol(format!("{what} must be an array")));
        };
        items
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| ClientError::protocol(format!("{what} must contain strings")))
                    .and_then(MaritimeId::parse)
            })
            .collect()
    }

    fn take_value(&mut self, what: &str) -> Result<Value, ClientError> {
        Ok(self.take(what)?.clone())
    }

    fn take_position(&mut self, what: &str) -> Result<Option<PositionTime>, ClientError> {
        match self.take(what)? {
            Value::Null => Ok(None),
            Value::Array(parts) if parts.len() == 3 => {
                let lat = parts[0]
                    .as_f64()
                    .ok_or_else(|| ClientError::protocol(format!("{what}: bad latitude")))?;
                let lon = parts[1]
                    .as_f64()
                    .ok_or_else(|| ClientError::protocol(format!("{what}: bad longitude")))?;
                let time = parts[2]
                    .as_i64()
                    .ok_or_else(|| ClientError::protocol(format!("{what}: bad timestamp")))?;
                PositionTime::new(lat, lon, time).map(Some)
            }
            _ => Err(ClientError::protocol(format!(
                "{what} must be null or [lat, lon, time]"
            ))),
        }
    }

    fn take_options(&mut self, what: &str) -> Result<BroadcastOptions, ClientError> {
        serde_json::from_value(self.take(what)?.clone())
            .map_err(|e| ClientError::protocol(format!("{what}: {e}")))
    }
}
