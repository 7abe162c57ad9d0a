//! Broadcast fan-out: channel subscriptions, sending, receipt aggregation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mmtp_core::{
    BroadcastOptions, BroadcastPayload, BroadcastSend, ClientError, ConnectionMessage, MaritimeId,
    MessageType, PositionTime,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::future::{BroadcastAckEvent, BroadcastFuture, BroadcastState};
use crate::position::PositionTracker;
use crate::service::fresh_id;

/// Sender and origin of a delivered broadcast.
#[derive(Clone, Debug)]
pub struct BroadcastHeader {
    pub src: MaritimeId,
    pub position: Option<PositionTime>,
}

type Listener = Box<dyn Fn(BroadcastHeader, &Value) + Send + Sync>;

struct SubscriptionInner {
    id: u64,
    channel: String,
    received: AtomicU64,
    cancelled: AtomicBool,
    listener: Listener,
}

/// A live broadcast subscription. Dropping it does not unsubscribe; call
/// [`cancel`](Self::cancel), which is idempotent.
pub struct BroadcastSubscription {
    inner: Arc<SubscriptionInner>,
    manager: Weak<BroadcastManager>,
}

impl BroadcastSubscription {
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Number of broadcasts delivered to this subscription so far.
    #[must_use]
    pub fn message_count(&self) -> u64 {
        self.inner.received.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            let mut listeners = manager.listeners.lock().expect("listener table poisoned");
            if let Some(set) = listeners.get_mut(&self.inner.channel) {
                set.retain(|s| s.id != self.inner.id);
                if set.is_empty() {
                    listeners.remove(&self.inner.channel);
                }
            }
        }
    }
}

/// Manages both directions of broadcast traffic for one client.
pub struct BroadcastManager {
    bus: Arc<MessageBus>,
    position: Arc<PositionTracker>,
    local_id: MaritimeId,
    default_options: BroadcastOptions,
    next_subscription: AtomicU64,
    listeners: Mutex<HashMap<String, Vec<Arc<SubscriptionInner>>>>,
    /// Outstanding broadcast futures by broadcast id. Weak so that a
    /// discarded future stops accumulating receipts.
    outstanding: Mutex<HashMap<String, Weak<BroadcastState>>>,
}

impl BroadcastManager {
    pub(crate) fn new(
        bus: Arc<MessageBus>,
        position: Arc<PositionTracker>,
        local_id: MaritimeId,
        default_options: BroadcastOptions,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            bus,
            position,
            local_id,
            default_options,
            next_subscription: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
        });
        let deliver = Arc::clone(&manager);
        manager
            .bus
            .subscribe(MessageType::BroadcastDeliver, move |msg| {
                deliver.on_deliver(msg);
            });
        let acks = Arc::clone(&manager);
        manager
            .bus
            .subscribe(MessageType::BroadcastAck, move |msg| {
                acks.on_ack(msg);
            });
        manager
    }

    /// Subscribes `listener` to the channel of `B`.
    pub fn listen_for<B, F>(self: &Arc<Self>, listener: F) -> BroadcastSubscription
    where
        B: BroadcastPayload,
        F: Fn(BroadcastHeader, B) + Send + Sync + 'static,
    {
        let raw: Listener = Box::new(move |header, payload| {
            match serde_json::from_value::<B>(payload.clone()) {
                Ok(message) => listener(header, message),
                Err(e) => {
                    // a bad payload is dropped, never retried
                    warn!("undecodable broadcast on {}: {e}", B::CHANNEL);
                }
            }
        });
        let inner = Arc::new(SubscriptionInner {
            id: self.next_subscription.fetch_add(1, Ordering::Relaxed),
            channel: B::CHANNEL.to_owned(),
            received: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            listener: raw,
        });
        self.listeners
            .lock()
            .expect("listener table poisoned")
            .entry(B::CHANNEL.to_owned())
            .or_default()
            .push(Arc::clone(&inner));
        BroadcastSubscription {
            inner,
            manager: Arc::downgrade(self),
        }
    }

    /// Sends `message` with this client's default options.
    ///
    /// # Errors
    /// Send errors as for any request.
    pub fn send<B: BroadcastPayload>(&self, message: &B) -> Result<BroadcastFuture, ClientError> {
        self.send_with_options(message, self.default_options.clone())
    }

    /// Sends `message` with explicit options, forwarded to the server
    /// verbatim.
    ///
    /// # Errors
    /// Send errors as for any request.
    pub fn send_with_options<B: BroadcastPayload>(
        &self,
        message: &B,
        options: BroadcastOptions,
    ) -> Result<BroadcastFuture, ClientError> {
        let payload = serde_json::to_value(message)
            .map_err(|e| ClientError::protocol(format!("unencodable broadcast: {e}")))?;
        let broadcast_id = fresh_id();
        let request = self.bus_arc().send_request(BroadcastSend {
            src: self.local_id.clone(),
            position: self.position.current(),
            channel: B::CHANNEL.to_owned(),
            payload,
            options,
            broadcast_id: broadcast_id.clone(),
        })?;

        let state = BroadcastState::new();
        {
            let mut outstanding = self.outstanding.lock().expect("broadcast table poisoned");
            outstanding.retain(|_, weak| weak.strong_count() > 0);
            outstanding.insert(broadcast_id, Arc::downgrade(&state));
        }
        // hold only a weak reference so a discarded future can go away
        // while the ack is still in flight
        let milestone = Arc::downgrade(&state);
        tokio::spawn(async move {
            let result = request.get().await.map(|_| ());
            if let Some(state) = milestone.upgrade() {
                state.resolve_server(result);
            }
        });
        Ok(BroadcastFuture { state })
    }

    fn bus_arc(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    fn on_deliver(&self, msg: &ConnectionMessage) {
        let ConnectionMessage::BroadcastDeliver {
            src,
            position,
            channel,
            payload,
        } = msg
        else {
            return;
        };
        let snapshot: Vec<Arc<SubscriptionInner>> = {
            let listeners = self.listeners.lock().expect("listener table poisoned");
            listeners.get(channel).cloned().unwrap_or_default()
        };
        if snapshot.is_empty() {
            debug!("broadcast on {channel} with no listener");
            return;
        }
        for subscription in snapshot {
            if subscription.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            let header = BroadcastHeader {
                src: src.clone(),
                position: *position,
            };
            let payload = payload.clone();
            // listeners run on the user pool, off the protocol task
            tokio::spawn(async move {
                subscription.received.fetch_add(1, Ordering::Relaxed);
                (subscription.listener)(header, &payload);
            });
        }
    }

    fn on_ack(&self, msg: &ConnectionMessage) {
        let ConnectionMessage::BroadcastAck {
            broadcast_id,
            recipient_id,
            recipient_position,
        } = msg
        else {
            return;
        };
        let state = {
            let mut outstanding = self.outstanding.lock().expect("broadcast table poisoned");
            match outstanding.get(broadcast_id).and_then(Weak::upgrade) {
                Some(state) => Some(state),
                None => {
                    // the sender lost interest; forget the record
                    outstanding.remove(broadcast_id);
                    None
                }
            }
        };
        if let Some(state) = state {
            state.push_ack(BroadcastAckEvent {
                recipient: recipient_id.clone(),
                position: *recipient_position,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[derive(Serialize, Deserialize)]
    struct Weather {
        wind: u32,
    }

    impl BroadcastPayload for Weather {
        const CHANNEL: &'static str = "weather";
    }

    fn manager() -> (Arc<BroadcastManager>, mpsc::Receiver<crate::bus::Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        let bus = MessageBus::new(tx);
        let position = PositionTracker::new(Box::new(|| None));
        (
            BroadcastManager::new(
                bus,
                position,
                MaritimeId::mmsi(1),
                BroadcastOptions::default(),
            ),
            rx,
        )
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (manager, _rx) = manager();
        let sub = manager.listen_for::<Weather, _>(|_, _| {});
        assert_eq!(sub.channel(), "weather");
        sub.cancel();
        sub.cancel();
        assert!(manager
            .listeners
            .lock()
            .unwrap()
            .get("weather")
            .is_none());
    }

    #[tokio::test]
    async fn delivery_reaches_every_listener_and_counts() {
        let (manager, _rx) = manager();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let sub = {
            let seen_tx = seen_tx.clone();
            manager.listen_for::<Weather, _>(move |header, weather| {
                let _ = seen_tx.send((header.src, weather.wind));
            })
        };
        manager.on_deliver(&ConnectionMessage::BroadcastDeliver {
            src: MaritimeId::mmsi(6),
            position: None,
            channel: "weather".to_owned(),
            payload: json!({"wind": 14}),
        });
        let (src, wind) = seen_rx.recv().await.unwrap();
        assert_eq!(src, MaritimeId::mmsi(6));
        assert_eq!(wind, 14);
        // the spawned task bumped the counter before invoking the listener
        assert_eq!(sub.message_count(), 1);
    }

    #[tokio::test]
    async fn acks_for_a_dropped_future_are_garbage_collected() {
        let (manager, _rx) = manager();
        let future = manager.send(&Weather { wind: 3 }).unwrap();
        let broadcast_id = {
            let outstanding = manager.outstanding.lock().unwrap();
            outstanding.keys().next().unwrap().clone()
        };
        drop(future);
        manager.on_ack(&ConnectionMessage::BroadcastAck {
            broadcast_id: broadcast_id.clone(),
            recipient_id: MaritimeId::mmsi(2),
            recipient_position: None,
        });
        assert!(manager
            .outstanding
            .lock()
            .unwrap()
            .get(&broadcast_id)
            .is_none());
    }
}
