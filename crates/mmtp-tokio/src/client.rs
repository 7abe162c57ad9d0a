//! The application-facing client: lifecycle, state observation, and the
//! composition of the managers over one driver task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mmtp_core::{BroadcastPayload, ClientConfig, ClientError, MaritimeId, ServiceMessage};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::broadcast::{BroadcastHeader, BroadcastManager, BroadcastSubscription};
use crate::bus::MessageBus;
use crate::connection::{Command, Driver, SessionPhase};
use crate::future::{BroadcastFuture, ConnectionFuture};
use crate::position::{PositionSupplier, PositionTracker};
use crate::service::{
    InvocationContext, InvocationHeader, ServiceLocator, ServiceManager, ServiceRegistration,
};
use crate::transport::{Connector, WsConnector};

/// Lifecycle of a [`PersistentConnection`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Connected,
    Closed,
    Terminated,
}

/// Configuration plus the pieces that cannot live in plain data: the
/// position supplier.
pub struct ClientParams {
    pub config: ClientConfig,
    pub position_supplier: PositionSupplier,
}

impl ClientParams {
    #[must_use]
    pub fn new(config: ClientConfig, position_supplier: PositionSupplier) -> Self {
        Self {
            config,
            position_supplier,
        }
    }
}

type StateListener = Arc<dyn Fn(ClientState) + Send + Sync>;

struct Shared {
    local_id: MaritimeId,
    bus: Arc<MessageBus>,
    services: Arc<ServiceManager>,
    broadcasts: Arc<BroadcastManager>,
    state_tx: watch::Sender<ClientState>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    next_listener: AtomicU64,
    closed: AtomicBool,
    command_tx: mpsc::Sender<Command>,
    position_task: tokio::task::JoinHandle<()>,
}

impl Shared {
    fn set_state(&self, state: ClientState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state
                || matches!(*current, ClientState::Terminated)
                || (matches!(*current, ClientState::Closed) && state == ClientState::Connected)
            {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            // snapshot first; a listener may add or remove listeners
            let snapshot: Vec<StateListener> = {
                let listeners = self.listeners.lock().expect("listener list poisoned");
                listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
            };
            for listener in snapshot {
                listener(state);
            }
        }
    }
}

/// A persistent, auto-reconnecting session to the maritime network.
///
/// Cloning is cheap; every clone talks to the same underlying session.
#[derive(Clone)]
pub struct PersistentConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection").finish_non_exhaustive()
    }
}

/// Connects to the configured server over WebSocket.
///
/// Blocks until the welcome/hello/connected exchange finishes or
/// `config.handshake_timeout` elapses. After a successful return the client
/// reconnects on its own until [`PersistentConnection::close`] is called.
///
/// # Errors
/// [`ClientError::ConnectFailed`] when the transport cannot be opened,
/// [`ClientError::HandshakeFailed`] when the server rejects or abandons the
/// handshake. Neither starts a reconnect.
pub async fn connect(params: ClientParams) -> Result<PersistentConnection, ClientError> {
    connect_with(params, WsConnector).await
}

/// [`connect`] over a custom transport; the seam the tests plug into.
pub async fn connect_with<C: Connector>(
    params: ClientParams,
    connector: C,
) -> Result<PersistentConnection, ClientError> {
    let config = params.config;
    let handshake_timeout = config.handshake_timeout;
    let (outbound_tx, outbound_rx) = mpsc::channel(1024);
    let (command_tx, command_rx) = mpsc::channel(8);
    let (phase_tx, mut phase_rx) = watch::channel(SessionPhase::Handshaking);
    let (state_tx, _state_rx) = watch::channel(ClientState::Created);

    let bus = MessageBus::new(outbound_tx);
    let position = PositionTracker::new(params.position_supplier);
    let services = ServiceManager::new(Arc::clone(&bus), config.local_id.clone());
    let broadcasts = BroadcastManager::new(
        Arc::clone(&bus),
        Arc::clone(&position),
        config.local_id.clone(),
        config.default_broadcast_options.clone(),
    );
    let position_task = position.spawn_reporter(Arc::clone(&bus), config.position_interval);

    let shared = Arc::new(Shared {
        local_id: config.local_id.clone(),
        bus,
        services,
        broadcasts,
        state_tx,
        listeners: Mutex::new(Vec::new()),
        next_listener: AtomicU64::new(1),
        closed: AtomicBool::new(false),
        command_tx,
        position_task,
    });

    let driver = Driver::new(
        connector,
        config,
        Arc::clone(&shared.bus),
        position,
        outbound_rx,
        command_rx,
        phase_tx,
    );
    tokio::spawn(driver.run());

    // map session phases onto the coarse client state for listeners and
    // await_terminated
    {
        let shared = Arc::clone(&shared);
        let mut phases = phase_rx.clone();
        tokio::spawn(async move {
            loop {
                let phase = phases.borrow_and_update().clone();
                match phase {
                    SessionPhase::Connected { .. } => shared.set_state(ClientState::Connected),
                    SessionPhase::Terminated | SessionPhase::Failed(_) => {
                        shared.position_task.abort();
                        shared.set_state(ClientState::Terminated);
                        return;
                    }
                    _ => {}
                }
                if phases.changed().await.is_err() {
                    shared.position_task.abort();
                    shared.set_state(ClientState::Terminated);
                    return;
                }
            }
        });
    }

    // wait for the first handshake to settle
    let settled = tokio::time::timeout(handshake_timeout, async {
        loop {
            let phase = phase_rx.borrow_and_update().clone();
            match phase {
                SessionPhase::Connected { .. } => return Ok(()),
                SessionPhase::Failed(e) => return Err(e),
                SessionPhase::Terminated => return Err(ClientError::Closed),
                _ => {}
            }
            if phase_rx.changed().await.is_err() {
                return Err(ClientError::connect_failed("engine went away"));
            }
        }
    })
    .await;

    let connection = PersistentConnection { shared };
    match settled {
        Ok(Ok(())) => Ok(connection),
        Ok(Err(e)) => {
            connection.close().await;
            Err(e)
        }
        Err(_) => {
            connection.close().await;
            Err(ClientError::handshake_failed(
                "handshake did not finish in time",
            ))
        }
    }
}

impl PersistentConnection {
    #[must_use]
    pub fn local_id(&self) -> &MaritimeId {
        &self.shared.local_id
    }

    /// The current lifecycle state; readable at any time without locking.
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.shared.state_tx.borrow()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ClientState::Closed | ClientState::Terminated)
    }

    /// Registers `listener` for every state transition. Returns a handle to
    /// remove it again.
    pub fn add_state_listener(
        &self,
        listener: impl Fn(ClientState) + Send + Sync + 'static,
    ) -> StateListenerHandle {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .lock()
            .expect("listener list poisoned")
            .push((id, Arc::new(listener)));
        StateListenerHandle { id }
    }

    pub fn remove_state_listener(&self, handle: &StateListenerHandle) {
        self.shared
            .listeners
            .lock()
            .expect("listener list poisoned")
            .retain(|(id, _)| *id != handle.id);
    }

    /// Waits until all background activity has quiesced.
    ///
    /// Returns `true` when the client terminated within `timeout`.
    pub async fn await_terminated(&self, timeout: Duration) -> bool {
        let mut state_rx = self.shared.state_tx.subscribe();
        tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|s| *s == ClientState::Terminated)
                .await
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Shuts the client down: stops the position reporter, says bye to the
    /// server, fails every outstanding future with
    /// [`ClientError::ConnectionLost`] and lets the engine quiesce.
    /// Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing client {}", self.shared.local_id);
        self.shared.set_state(ClientState::Closed);
        self.shared.position_task.abort();
        if self
            .shared
            .command_tx
            .send(Command::Close {
                reason: "client closing".to_owned(),
            })
            .await
            .is_err()
        {
            // the driver is already gone; nothing left to quiesce
            self.shared.set_state(ClientState::Terminated);
        }
    }

    /// Sends `message` on its broadcast channel with the configured default
    /// options.
    ///
    /// # Errors
    /// See [`ClientError`]; send failures surface synchronously.
    pub fn broadcast<B: BroadcastPayload>(
        &self,
        message: &B,
    ) -> Result<BroadcastFuture, ClientError> {
        self.guard()?;
        self.shared.broadcasts.send(message)
    }

    /// Sends `message` with explicit options.
    ///
    /// # Errors
    /// See [`ClientError`].
    pub fn broadcast_with_options<B: BroadcastPayload>(
        &self,
        message: &B,
        options: mmtp_core::BroadcastOptions,
    ) -> Result<BroadcastFuture, ClientError> {
        self.guard()?;
        self.shared.broadcasts.send_with_options(message, options)
    }

    /// Subscribes `listener` to broadcasts of `B`.
    pub fn broadcast_listen<B, F>(&self, listener: F) -> BroadcastSubscription
    where
        B: BroadcastPayload,
        F: Fn(BroadcastHeader, B) + Send + Sync + 'static,
    {
        self.shared.broadcasts.listen_for::<B, _>(listener)
    }

    /// Registers a local service of type `S`.
    ///
    /// # Errors
    /// [`ClientError::AlreadyRegistered`] when the channel is taken.
    pub fn service_register<S, F>(&self, callback: F) -> Result<ServiceRegistration, ClientError>
    where
        S: ServiceMessage,
        F: Fn(InvocationHeader, S, InvocationContext<S::Reply>) + Send + Sync + 'static,
    {
        self.guard()?;
        self.shared.services.register::<S, _>(callback)
    }

    /// A locator for remote providers of `S`.
    #[must_use]
    pub fn service_find<S: ServiceMessage>(&self) -> ServiceLocator<S> {
        self.shared.services.find::<S>()
    }

    /// Invokes `S` on the peer `dst`.
    ///
    /// # Errors
    /// See [`ClientError`]; the returned future carries the remote outcome.
    pub fn service_invoke<S: ServiceMessage>(
        &self,
        dst: MaritimeId,
        message: &S,
    ) -> Result<ConnectionFuture<S::Reply>, ClientError> {
        self.guard()?;
        self.shared.services.invoke(dst, message)
    }

    fn guard(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Handle for removing a state listener again.
pub struct StateListenerHandle {
    id: u64,
}
