//! Browser ⇄ native host bridge.
//!
//! [`NativeBridge`] owns the single native connection shared by every caller:
//! it connects lazily, correlates responses through a per-connection
//! [`PendingCalls`] registry and serves host-initiated requests with the
//! [`Router`]. UI surfaces reach it through [`relay::Relay`].

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::Instrument as _;

pub mod capabilities;
pub mod commands;
pub mod config;
pub mod fetch;
pub mod memory_browser;
pub mod native_host;
pub mod pending;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod storage;
pub mod tty;

use self::config::BridgeConfig;
use self::native_host::{NativeConnector, NativeHostError, NativePort};
use self::pending::{CallError, PendingCalls};
use self::protocol::{
    FrameCodecError, INITIALIZE_METHOD, InitializeParams, MAX_EXTENSION_MESSAGE_BYTES, RpcErrorObject,
    RpcMessage, RpcRequest, RpcResponse,
};
use self::router::Router;
use self::storage::{LocalStorage, StorageError, generate_secure_id};
use crate::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("native host unavailable: {0}")]
    HostUnavailable(String),
    #[error("native host is not connected")]
    NotConnected,
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("failed to load browser id: {0}")]
    Storage(#[from] StorageError),
    #[error("notification {0} has no response to wait for")]
    NoResponseExpected(String),
    #[error("message not sent: {0}")]
    Unsendable(#[from] FrameCodecError),
}

impl BridgeError {
    fn unavailable(reason: impl std::fmt::Display) -> Self {
        Self::HostUnavailable(reason.to_string())
    }
}

impl From<NativeHostError> for BridgeError {
    fn from(err: NativeHostError) -> Self {
        Self::unavailable(err)
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug)]
struct Connection {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Value>,
    pending: PendingCalls,
    closed: watch::Sender<bool>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Marks the connection closed; returns false if it already was.
    fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Handle to one live native connection.
///
/// A link never outlives its connection's usefulness: once the host
/// disconnects every call through it fails with [`CallError::ConnectionLost`].
#[derive(Debug, Clone)]
pub struct Link {
    connection: Arc<Connection>,
}

impl Link {
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.connection.generation
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    /// Sends a message without expecting a reply.
    ///
    /// A message too large for one native frame fails with
    /// [`BridgeError::Unsendable`] and leaves the connection untouched.
    pub fn post(&self, message: Value) -> Result<(), BridgeError> {
        protocol::ensure_frame_fits(&message, MAX_EXTENSION_MESSAGE_BYTES)?;
        self.send(message)
    }

    /// Registers `id`, sends `payload` verbatim and waits for the host's
    /// response with that id.
    pub async fn forward(
        &self,
        id: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<RpcResponse, BridgeError> {
        protocol::ensure_frame_fits(&payload, MAX_EXTENSION_MESSAGE_BYTES)?;
        let pending = self.connection.pending.register(id, timeout)?;
        self.send(payload)?;
        Ok(pending.wait().await?)
    }

    pub async fn call(
        &self,
        request: &RpcRequest,
        timeout: Option<Duration>,
    ) -> Result<RpcResponse, BridgeError> {
        let Some(id) = request.id.as_deref() else {
            return Err(BridgeError::NoResponseExpected(request.method.clone()));
        };
        self.forward(id, request.to_value(), timeout).await
    }

    fn send(&self, message: Value) -> Result<(), BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::NotConnected);
        }
        self.connection
            .outgoing
            .send(message)
            .map_err(|_| BridgeError::NotConnected)
    }

    /// Number of calls on this connection still awaiting a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.connection.pending.len()
    }
}

// ============================================================================
// Bridge
// ============================================================================

#[derive(Debug, Default)]
struct Attempts {
    finished: u64,
    /// Reason of the last attempt, tagged with its `finished` count.
    last_failure: Option<(u64, String)>,
}

#[derive(Debug, Default)]
struct Shared {
    current: StdMutex<Option<Arc<Connection>>>,
}

impl Shared {
    fn current(&self) -> Option<Arc<Connection>> {
        self.current
            .lock()
            .expect("native connection mutex poisoned")
            .clone()
    }

    fn install(&self, connection: Arc<Connection>) {
        *self
            .current
            .lock()
            .expect("native connection mutex poisoned") = Some(connection);
    }

    /// Clears the cached connection if it is still `generation`.
    fn clear(&self, generation: u64) -> bool {
        let mut current = self
            .current
            .lock()
            .expect("native connection mutex poisoned");
        if current
            .as_ref()
            .is_some_and(|connection| connection.generation == generation)
        {
            *current = None;
            true
        } else {
            false
        }
    }

    fn take(&self) -> Option<Arc<Connection>> {
        self.current
            .lock()
            .expect("native connection mutex poisoned")
            .take()
    }
}

pub struct NativeBridge {
    config: BridgeConfig,
    connector: Arc<dyn NativeConnector>,
    router: Arc<Router>,
    storage: Arc<LocalStorage>,
    shared: Arc<Shared>,
    attempts: AsyncMutex<Attempts>,
    started_attempts: AtomicU64,
    finished_attempts: AtomicU64,
    generation_seq: AtomicU64,
}

impl std::fmt::Debug for NativeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBridge")
            .field("host", &self.config.native_host_name)
            .field("state", &self.status())
            .finish_non_exhaustive()
    }
}

impl NativeBridge {
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        connector: Arc<dyn NativeConnector>,
        router: Arc<Router>,
        storage: Arc<LocalStorage>,
    ) -> Self {
        Self {
            config,
            connector,
            router,
            storage,
            shared: Arc::default(),
            attempts: AsyncMutex::new(Attempts::default()),
            started_attempts: AtomicU64::new(0),
            finished_attempts: AtomicU64::new(0),
            generation_seq: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> ConnectionState {
        if self.shared.current().is_some_and(|c| c.is_alive()) {
            ConnectionState::Connected
        } else if self.attempts.try_lock().is_err() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Number of connection attempts started so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.started_attempts.load(Ordering::SeqCst)
    }

    /// Returns the live connection, opening one if needed.
    ///
    /// Concurrent callers share a single attempt: whoever waited on an attempt
    /// that failed gets that failure instead of starting another one.
    pub async fn ensure_connected(&self) -> Result<Link, BridgeError> {
        if let Some(link) = self.live_link() {
            return Ok(link);
        }

        let seen = self.finished_attempts.load(Ordering::SeqCst);
        let mut attempts = self.attempts.lock().await;
        if let Some(link) = self.live_link() {
            return Ok(link);
        }
        if let Some((attempt, reason)) = &attempts.last_failure {
            if *attempt > seen {
                return Err(BridgeError::HostUnavailable(reason.clone()));
            }
        }

        self.started_attempts.fetch_add(1, Ordering::SeqCst);
        let generation = self.generation_seq.fetch_add(1, Ordering::SeqCst);
        let span = logging::connection_span(generation);
        let outcome = self.connect(generation).instrument(span).await;
        attempts.finished += 1;
        self.finished_attempts
            .store(attempts.finished, Ordering::SeqCst);
        match outcome {
            Ok(link) => {
                attempts.last_failure = None;
                Ok(link)
            }
            Err(err) => {
                tracing::warn!(generation, "native host connection failed: {err}");
                attempts.last_failure = Some((attempts.finished, err.to_string()));
                Err(match err {
                    BridgeError::HostUnavailable(_) => err,
                    other => BridgeError::unavailable(other),
                })
            }
        }
    }

    /// Sends `request` over the shared connection and waits for its response.
    /// `timeout` of `None` uses the configured call timeout.
    pub async fn call(
        &self,
        request: &RpcRequest,
        timeout: Option<Duration>,
    ) -> Result<RpcResponse, BridgeError> {
        let link = self.ensure_connected().await?;
        link.call(request, timeout.or_else(|| self.config.call_timeout()))
            .await
    }

    pub async fn notify(&self, request: &RpcRequest) -> Result<(), BridgeError> {
        let link = self.ensure_connected().await?;
        link.post(request.to_value())
    }

    /// Drops the current connection. Pending calls fail with
    /// [`CallError::ConnectionLost`]; the next demand reconnects.
    pub fn disconnect(&self) -> bool {
        let Some(connection) = self.shared.take() else {
            return false;
        };
        connection.close();
        let failed = connection.pending.fail_all();
        tracing::info!(
            generation = connection.generation,
            failed,
            "disconnected from native host"
        );
        true
    }

    fn live_link(&self) -> Option<Link> {
        self.shared
            .current()
            .filter(|connection| connection.is_alive())
            .map(|connection| Link { connection })
    }

    async fn connect(&self, generation: u64) -> Result<Link, BridgeError> {
        let host = self.config.native_host_name.as_str();
        tracing::debug!(host, "connecting to native host");
        let NativePort { outgoing, incoming } = self.connector.connect(host).await?;

        let (closed, _) = watch::channel(false);
        let connection = Arc::new(Connection {
            generation,
            outgoing,
            pending: PendingCalls::new(),
            closed,
        });
        tokio::spawn(
            read_loop(
                Arc::clone(&self.shared),
                Arc::clone(&connection),
                incoming,
                Arc::clone(&self.router),
            )
            .instrument(logging::connection_span(generation)),
        );

        // A missing host disconnects almost immediately.
        tokio::select! {
            () = connection.closed() => {
                return Err(BridgeError::unavailable("native host disconnected during connect"));
            }
            () = tokio::time::sleep(self.config.connect_grace()) => {}
        }

        let link = Link {
            connection: Arc::clone(&connection),
        };
        if let Err(err) = self.initialize(&link).await {
            connection.close();
            return Err(err);
        }

        self.shared.install(Arc::clone(&connection));
        if !connection.is_alive() {
            self.shared.clear(generation);
            return Err(BridgeError::unavailable("native host disconnected during handshake"));
        }
        tracing::info!(generation, host, "connected to native host");
        Ok(link)
    }

    async fn initialize(&self, link: &Link) -> Result<(), BridgeError> {
        let params = InitializeParams {
            browser_id: self.storage.browser_id()?,
            version: self.config.extension_version.clone(),
        };
        let params = serde_json::to_value(params).map_err(BridgeError::unavailable)?;
        let request = RpcRequest::new(
            format!("init-{}", generate_secure_id(12)),
            INITIALIZE_METHOD,
            params,
        );
        let response = link
            .call(&request, Some(self.config.handshake_timeout()))
            .await
            .map_err(|err| BridgeError::unavailable(format!("initialize failed: {err}")))?;
        if let Some(error) = response.error() {
            return Err(BridgeError::unavailable(format!(
                "initialize rejected: {error}"
            )));
        }
        Ok(())
    }
}

/// A result too large for one frame is replaced by a -32000 error so the host
/// still gets an answer for that id.
fn sendable_response(response: RpcResponse) -> Value {
    let value = response.to_value();
    match protocol::ensure_frame_fits(&value, MAX_EXTENSION_MESSAGE_BYTES) {
        Ok(()) => value,
        Err(err) => {
            tracing::warn!(id = %response.id, "capability result not sent: {err}");
            RpcResponse::failure(response.id, RpcErrorObject::internal(err.to_string())).to_value()
        }
    }
}

/// Reads until the host disconnects or the connection is closed, then clears
/// the cached connection and fails everything still pending on it.
async fn read_loop(
    shared: Arc<Shared>,
    connection: Arc<Connection>,
    mut incoming: mpsc::UnboundedReceiver<Value>,
    router: Arc<Router>,
) {
    loop {
        let message = tokio::select! {
            message = incoming.recv() => message,
            () = connection.closed() => None,
        };
        let Some(message) = message else { break };

        match RpcMessage::classify(message) {
            Some(RpcMessage::Response(response)) => {
                connection.pending.resolve(response);
            }
            Some(RpcMessage::Request(request)) => {
                let router = Arc::clone(&router);
                let outgoing = connection.outgoing.clone();
                tokio::spawn(
                    async move {
                        if let Some(response) = router.dispatch(request).await {
                            if outgoing.send(sendable_response(response)).is_err() {
                                tracing::debug!("native host gone before response was sent");
                            }
                        }
                    }
                    .in_current_span(),
                );
            }
            None => tracing::debug!("dropping malformed message from native host"),
        }
    }

    drop(incoming);
    let was_open = connection.close();
    let cleared = shared.clear(connection.generation);
    let failed = connection.pending.fail_all();
    if was_open {
        tracing::warn!(cleared, failed, "native host disconnected");
    } else {
        tracing::debug!(cleared, failed, "native connection closed");
    }
}
