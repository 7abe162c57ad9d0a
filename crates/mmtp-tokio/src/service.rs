//! Service registration, lookup and end-to-end invocation.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mmtp_core::{
    ClientError, ConnectionMessage, FindService, MaritimeId, MessageType, RegisterService,
    ServiceMessage,
};
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::future::ConnectionFuture;

/// Who is invoking, as seen by a service callback.
#[derive(Clone, Debug)]
pub struct InvocationHeader {
    pub src: MaritimeId,
}

type RawCallback = Arc<dyn Fn(InvocationHeader, Value, RawContext) + Send + Sync>;

struct LocalService {
    callback: RawCallback,
}

/// Registers callbacks, resolves remote providers and tracks invocations.
pub struct ServiceManager {
    bus: Arc<MessageBus>,
    local_id: MaritimeId,
    services: Mutex<HashMap<String, LocalService>>,
}

impl ServiceManager {
    pub(crate) fn new(bus: Arc<MessageBus>, local_id: MaritimeId) -> Arc<Self> {
        let manager = Arc::new(Self {
            bus,
            local_id,
            services: Mutex::new(HashMap::new()),
        });
        let inbound = Arc::clone(&manager);
        manager
            .bus
            .subscribe(MessageType::InvokeService, move |msg| {
                inbound.on_invoke(msg);
            });
        manager
    }

    /// Binds `callback` to the channel of `S` and announces it to the
    /// server.
    ///
    /// # Errors
    /// [`ClientError::AlreadyRegistered`] when this client already serves
    /// the channel; send errors as for any request.
    pub fn register<S, F>(
        self: &Arc<Self>,
        callback: F,
    ) -> Result<ServiceRegistration, ClientError>
    where
        S: ServiceMessage,
        F: Fn(InvocationHeader, S, InvocationContext<S::Reply>) + Send + Sync + 'static,
    {
        let channel = S::CHANNEL.to_owned();
        let raw: RawCallback = Arc::new(move |header, payload, ctx| {
            match serde_json::from_value::<S>(payload) {
                Ok(message) => callback(header, message, InvocationContext::new(ctx)),
                Err(e) => {
                    warn!("undecodable invocation payload on {}: {e}", S::CHANNEL);
                    ctx.fail(format!("undecodable payload: {e}"));
                }
            }
        });

        {
            let mut services = self.services.lock().expect("service table poisoned");
            if services.contains_key(&channel) {
                return Err(ClientError::AlreadyRegistered(channel));
            }
            services.insert(channel.clone(), LocalService { callback: raw });
        }

        let ack = match self.bus.send_request(RegisterService {
            channel: channel.clone(),
        }) {
            Ok(fut) => fut,
            Err(e) => {
                // roll back the local binding so a retry can succeed
                self.services
                    .lock()
                    .expect("service table poisoned")
                    .remove(&channel);
                return Err(e);
            }
        };
        Ok(ServiceRegistration {
            channel,
            ack: tokio::sync::Mutex::new(AckState::Waiting(ack)),
        })
    }

    /// A locator for providers of `S`.
    pub fn find<S: ServiceMessage>(self: &Arc<Self>) -> ServiceLocator<S> {
        ServiceLocator {
            manager: Arc::clone(self),
            _marker: PhantomData,
        }
    }

    /// Invokes `S` on the peer `dst`. The future resolves when the matching
    /// acknowledgement arrives, across reconnects if need be.
    ///
    /// # Errors
    /// Send errors as for any request; the future itself fails with
    /// [`ClientError::RemoteFailure`] when the provider reports an error.
    pub fn invoke<S: ServiceMessage>(
        &self,
        dst: MaritimeId,
        message: &S,
    ) -> Result<ConnectionFuture<S::Reply>, ClientError> {
        let payload = serde_json::to_value(message)
            .map_err(|e| ClientError::protocol(format!("unencodable payload: {e}")))?;
        let invocation_id = fresh_id();
        let frame = ConnectionMessage::InvokeService {
            src: self.local_id.clone(),
            dst,
            channel: S::CHANNEL.to_owned(),
            payload,
            invocation_id: invocation_id.clone(),
        };
        self.bus_arc()
            .send_invocation(frame, invocation_id, decode_invocation_ack::<S::Reply>)
    }

    fn bus_arc(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    fn on_invoke(self: &Arc<Self>, msg: &ConnectionMessage) {
        let ConnectionMessage::InvokeService {
            src,
            channel,
            payload,
            invocation_id,
            ..
        } = msg
        else {
            return;
        };
        let ctx = RawContext {
            bus: Arc::clone(&self.bus),
            invocation_id: invocation_id.clone(),
            done: Arc::new(AtomicBool::new(false)),
        };
        let callback = {
            let services = self.services.lock().expect("service table poisoned");
            services.get(channel).map(|s| Arc::clone(&s.callback))
        };
        let Some(callback) = callback else {
            debug!("invocation for unknown channel {channel}");
            ctx.fail(format!("no service on channel {channel}"));
            return;
        };
        let header = InvocationHeader { src: src.clone() };
        let payload = payload.clone();
        // callbacks run on the user pool, off the protocol task
        tokio::spawn(async move {
            callback(header, payload, ctx);
        });
    }
}

/// Shared completion plumbing under the typed [`InvocationContext`].
#[derive(Clone)]
struct RawContext {
    bus: Arc<MessageBus>,
    invocation_id: String,
    done: Arc<AtomicBool>,
}

impl RawContext {
    fn finish(&self, result: Option<Value>, error: Option<String>) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let ack = ConnectionMessage::InvokeServiceAck {
            invocation_id: self.invocation_id.clone(),
            result,
            error,
        };
        if let Err(e) = self.bus.send_one_way(ack) {
            warn!("could not send invocation ack: {e}");
        }
    }

    fn fail(&self, reason: String) {
        self.finish(None, Some(reason));
    }
}

/// Completion handle passed to a service callback. Exactly one of
/// [`complete`](Self::complete) / [`fail`](Self::fail) takes effect; later
/// calls are no-ops.
pub struct InvocationContext<T> {
    raw: RawContext,
    _marker: PhantomData<fn(T)>,
}

impl<T: serde::Serialize> InvocationContext<T> {
    fn new(raw: RawContext) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn complete(&self, reply: T) {
        match serde_json::to_value(&reply) {
            Ok(value) => self.raw.finish(Some(value), None),
            Err(e) => {
                error!("unencodable service reply: {e}");
                self.raw.fail(format!("unencodable reply: {e}"));
            }
        }
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.raw.fail(reason.into());
    }
}

/// The server's confirmation of a [`ServiceManager::register`] call.
pub struct ServiceRegistration {
    channel: String,
    ack: tokio::sync::Mutex<AckState>,
}

enum AckState {
    Waiting(ConnectionFuture<()>),
    Done(Result<(), ClientError>),
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl ServiceRegistration {
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits until the server confirmed the registration.
    ///
    /// # Errors
    /// [`ClientError::Timeout`] when `timeout` elapses first; otherwise
    /// whatever the registration request failed with. Safe to call again.
    pub async fn await_registered(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut state = self.ack.lock().await;
        match &mut *state {
            AckState::Done(result) => result.clone(),
            AckState::Waiting(_) => {
                let AckState::Waiting(fut) = std::mem::replace(
                    &mut *state,
                    AckState::Done(Err(ClientError::Cancelled)),
                ) else {
                    unreachable!()
                };
                match tokio::time::timeout(timeout, fut.get()).await {
                    Ok(result) => {
                        *state = AckState::Done(result.clone());
                        result
                    }
                    Err(_) => {
                        // the underlying future is gone; keep the terminal
                        // state simple and report the elapsed wait
                        *state = AckState::Done(Err(ClientError::Timeout));
                        Err(ClientError::Timeout)
                    }
                }
            }
        }
    }
}

/// Queries the server for providers of `S`.
pub struct ServiceLocator<S: ServiceMessage> {
    manager: Arc<ServiceManager>,
    _marker: PhantomData<fn(S)>,
}

impl<S: ServiceMessage> ServiceLocator<S> {
    /// The closest provider.
    ///
    /// # Errors
    /// [`ClientError::NoProvider`] when the server knows none.
    pub async fn nearest(&self) -> Result<MaritimeId, ClientError> {
        let mut providers = self.lookup(1).await?;
        providers
            .drain(..)
            .next()
            .ok_or_else(|| ClientError::NoProvider(S::CHANNEL.to_owned()))
    }

    /// Up to `limit` providers, closest first.
    ///
    /// # Errors
    /// Send errors as for any request.
    pub async fn nearest_n(&self, limit: u32) -> Result<Vec<MaritimeId>, ClientError> {
        self.lookup(limit).await
    }

    async fn lookup(&self, limit: u32) -> Result<Vec<MaritimeId>, ClientError> {
        self.manager
            .bus
            .send_request(FindService {
                channel: S::CHANNEL.to_owned(),
                limit,
            })?
            .get()
            .await
    }
}

fn decode_invocation_ack<T: serde::de::DeserializeOwned>(
    msg: ConnectionMessage,
) -> Result<T, ClientError> {
    let ConnectionMessage::InvokeServiceAck { result, error, .. } = msg else {
        return Err(ClientError::protocol("expected InvokeServiceAck"));
    };
    if let Some(reason) = error {
        return Err(ClientError::RemoteFailure(reason));
    }
    let value = result.ok_or_else(|| {
        ClientError::protocol("invocation ack carries neither result nor error")
    })?;
    serde_json::from_value(value)
        .map_err(|e| ClientError::protocol(format!("undecodable service reply: {e}")))
}

/// A fresh 128-bit correlation id as 32 hex characters.
pub(crate) fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}
