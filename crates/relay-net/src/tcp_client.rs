//! TCP client owning a single connection to a server.
//!
//! Lifecycle: `Disconnected → Connecting → Connected → Disconnected`. While
//! connected a background task reads chunks, decodes them as text and
//! publishes them as [`ClientEvent::Message`]. Losing the connection moves the
//! client back to `Disconnected`; there is no automatic reconnect.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::codec;
use crate::connection::{Connection, ConnectionError, ConnectionId};
use crate::endpoint::{EndpointConfig, ValidationError};
use crate::framing::Framing;
use crate::platform::{SocketOptions, dial};
use crate::status::{ClientEvent, ConnectionState, DEFAULT_EVENT_CAPACITY, EventBus, StateWatch};

/// Configuration for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Framing; must match the server's.
    pub framing: Framing,
    /// Socket options for the dialed stream.
    pub socket: SocketOptions,
    /// Limit on dialing. Default: none.
    pub connect_timeout: Option<Duration>,
    /// Limit on each write. Default: none.
    pub write_timeout: Option<Duration>,
    /// Undelivered events kept per subscriber.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            socket: SocketOptions::default(),
            connect_timeout: None,
            write_timeout: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Errors surfaced by [`Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The address or port did not validate.
    #[error(transparent)]
    InvalidAddress(#[from] ValidationError),
    /// `connect` was called while connecting or connected.
    #[error("client is already {0}")]
    AlreadyConnected(ConnectionState),
    /// Dialing failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The dialed address.
        addr: SocketAddr,
        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// Dialing did not finish within the connect timeout.
    #[error("timed out connecting to {0}")]
    ConnectTimedOut(SocketAddr),
    /// There is no connection to send on.
    #[error("client is not connected")]
    NotConnected,
    /// The connection failed during a send.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

struct ClientShared {
    state: StateWatch<ConnectionState>,
    events: EventBus<ClientEvent>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl ClientShared {
    fn set_state(&self, state: ConnectionState) {
        if self.state.set(state) {
            self.events.publish(ClientEvent::StatusChanged(state));
        }
    }

    fn current_connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop `connection` if it is still the current one. Returns whether it was.
    fn release(&self, connection: &Arc<Connection>) -> bool {
        let mut slot = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, connection) => {
                slot.take();
                connection.close();
                self.set_state(ConnectionState::Disconnected);
                true
            }
            _ => false,
        }
    }
}

/// Moves the client back to `Disconnected` unless the connect attempt
/// completed, including when the `connect_to` future is dropped mid-dial.
struct ConnectAttempt<'a> {
    shared: &'a ClientShared,
    completed: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.completed
            && self
                .shared
                .state
                .transition(&[ConnectionState::Connecting], ConnectionState::Disconnected)
        {
            self.shared
                .events
                .publish(ClientEvent::StatusChanged(ConnectionState::Disconnected));
        }
    }
}

/// Client endpoint with at most one connection.
pub struct Client {
    config: ClientConfig,
    shared: Arc<ClientShared>,
}

impl Client {
    /// Create a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let shared = Arc::new(ClientShared {
            state: StateWatch::new(ConnectionState::Disconnected),
            events: EventBus::new(config.event_capacity),
            connection: Mutex::new(None),
        });
        Self { config, shared }
    }

    /// Connect to `address:port` and start reading.
    ///
    /// Fails if the address does not validate, if the client is not
    /// disconnected, or if dialing fails. On failure the client stays
    /// `Disconnected`.
    pub async fn connect(&self, address: &str, port: i64) -> Result<(), ClientError> {
        let endpoint = EndpointConfig::try_new(address, port)?;
        self.connect_to(endpoint.socket_addr()).await
    }

    /// Connect to `addr` and start reading.
    pub async fn connect_to(&self, addr: SocketAddr) -> Result<(), ClientError> {
        let shared = &self.shared;
        if !shared
            .state
            .transition(&[ConnectionState::Disconnected], ConnectionState::Connecting)
        {
            return Err(ClientError::AlreadyConnected(shared.state.current()));
        }
        shared
            .events
            .publish(ClientEvent::StatusChanged(ConnectionState::Connecting));

        let mut attempt = ConnectAttempt {
            shared,
            completed: false,
        };

        let connection = match self.dial(addr).await {
            Ok(connection) => Arc::new(connection),
            Err(err) => {
                tracing::warn!("{err}");
                return Err(err);
            }
        };

        {
            // Stored and published under one lock so `release` sees both or neither.
            let mut slot = shared
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = Some(Arc::clone(&connection));
            shared.set_state(ConnectionState::Connected);
            attempt.completed = true;
        }
        tracing::info!("Connected to {addr}");

        let reader_shared = Arc::clone(shared);
        tokio::spawn(async move {
            Self::read_loop(&connection, &reader_shared).await;
        });

        Ok(())
    }

    /// Send `message` encoded as ASCII.
    ///
    /// A transport failure disconnects the client.
    pub async fn send(&self, message: &str) -> Result<(), ClientError> {
        let connection = self
            .shared
            .current_connection()
            .ok_or(ClientError::NotConnected)?;

        match connection.write(&codec::encode(message)).await {
            Ok(()) => Ok(()),
            Err(err @ ConnectionError::PayloadTooLarge { .. }) => Err(err.into()),
            Err(err) => {
                self.shared.release(&connection);
                Err(err.into())
            }
        }
    }

    /// Close the connection. No-op when already disconnected.
    pub fn disconnect(&self) {
        if let Some(connection) = self.shared.current_connection()
            && self.shared.release(&connection)
        {
            tracing::info!("Disconnected from {}", connection.peer_addr());
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    /// Whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch the state without consuming events.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Register an observer for status changes and messages.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Address of the server while connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared
            .current_connection()
            .map(|connection| connection.peer_addr())
    }

    async fn dial(&self, addr: SocketAddr) -> Result<Connection, ClientError> {
        let stream = dial(addr, &self.config.socket, self.config.connect_timeout)
            .await
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::TimedOut {
                    ClientError::ConnectTimedOut(addr)
                } else {
                    ClientError::Connect { addr, source }
                }
            })?;

        Connection::new(
            ConnectionId::CLIENT,
            stream,
            self.config.framing.clone(),
            self.config.write_timeout,
        )
        .map_err(|source| ClientError::Connect { addr, source })
    }

    /// Publish every chunk until the connection ends, then disconnect.
    async fn read_loop(connection: &Arc<Connection>, shared: &ClientShared) {
        let mut chunks = connection.read_loop();
        while let Some(chunk) = chunks.next().await {
            shared
                .events
                .publish(ClientEvent::Message(codec::decode(&chunk)));
        }

        if shared.release(connection) {
            tracing::info!("Connection to {} lost", connection.peer_addr());
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
