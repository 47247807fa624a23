//! TCP server for accepting and managing client connections.
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`.
//! [`Server::start`] binds, then runs the accept loop until [`Server::stop`]
//! is called or accepting fails. Every accepted connection gets a fresh
//! [`ConnectionId`], is registered, and is read by its own task until it ends.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

use crate::codec;
use crate::connection::{Connection, ConnectionError, ConnectionId};
use crate::endpoint::EndpointConfig;
use crate::framing::Framing;
use crate::platform::{SocketOptions, bind_listener, tune_stream};
use crate::registry::{ConnectionRegistry, IdGenerator, SequentialIds};
use crate::status::{DEFAULT_EVENT_CAPACITY, EventBus, ServerEvent, ServerState, StateWatch};

/// Attempts at finding an unused identifier for one accepted connection.
const MAX_ID_ATTEMPTS: usize = 8;

/// Configuration for [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Default: `127.0.0.1:8888`.
    pub endpoint: EndpointConfig,
    /// Framing; must match the clients'.
    pub framing: Framing,
    /// Socket options for the listener and accepted streams.
    pub socket: SocketOptions,
    /// Limit on each write. Default: none.
    pub write_timeout: Option<Duration>,
    /// Undelivered events kept per subscriber.
    pub event_capacity: usize,
}

impl ServerConfig {
    /// Configuration listening on `address:port`.
    ///
    /// An invalid pair is logged and replaced by `127.0.0.1:8888`.
    pub fn new(address: &str, port: i64) -> Self {
        Self {
            endpoint: EndpointConfig::or_default(address, port),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            framing: Framing::default(),
            socket: SocketOptions::default(),
            write_timeout: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Errors surfaced by [`Server::start`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `start` was called while the server was not stopped.
    #[error("server is already {0}")]
    AlreadyRunning(ServerState),
    /// Binding or accepting failed.
    #[error("listening on {addr} failed: {source}")]
    Listen {
        /// The configured listen address.
        addr: SocketAddr,
        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// State shared between the server handle, its accept loop and the
/// per-connection read tasks.
struct ServerShared {
    registry: ConnectionRegistry,
    state: StateWatch<ServerState>,
    events: EventBus<ServerEvent>,
}

impl ServerShared {
    fn set_state(&self, state: ServerState) {
        if self.state.set(state) {
            tracing::info!("Server {state}");
            self.events.publish(ServerEvent::StatusChanged(state));
        }
    }

    fn transition(&self, from: &[ServerState], to: ServerState) -> bool {
        let moved = self.state.transition(from, to);
        if moved {
            tracing::info!("Server {to}");
            self.events.publish(ServerEvent::StatusChanged(to));
        }
        moved
    }

    /// Close and unregister `id`. Returns whether it was registered.
    ///
    /// The connection's read task announces the disconnect once it ends.
    fn disconnect(&self, id: ConnectionId) -> bool {
        self.registry.remove(id).is_some()
    }
}

/// Sets the server back to `Stopped` when the accept loop exits, including
/// when the `start` future is dropped.
struct RunGuard<'a> {
    shared: &'a ServerShared,
    local_addr: &'a Mutex<Option<SocketAddr>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.registry.close_all();
        self.shared.set_state(ServerState::Stopped);
    }
}

/// Server endpoint with a registry of client connections.
pub struct Server {
    config: ServerConfig,
    ids: Arc<dyn IdGenerator>,
    shared: Arc<ServerShared>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Create a stopped server using sequential identifiers.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_id_generator(config, Arc::new(SequentialIds::new()))
    }

    /// Create a stopped server drawing identifiers from `ids`.
    pub fn with_id_generator(config: ServerConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let shared = Arc::new(ServerShared {
            registry: ConnectionRegistry::new(),
            state: StateWatch::new(ServerState::Stopped),
            events: EventBus::new(config.event_capacity),
        });
        Self {
            config,
            ids,
            shared,
            local_addr: Mutex::new(None),
        }
    }

    /// The validated listen address.
    pub fn endpoint(&self) -> EndpointConfig {
        self.config.endpoint
    }

    /// Bind, then accept connections until stopped.
    ///
    /// Returns `Ok(())` after [`Server::stop`]. Returns
    /// [`ServerError::AlreadyRunning`] without touching the running server if
    /// it is not stopped, and [`ServerError::Listen`] if binding or accepting
    /// fails; the server is `Stopped` afterwards in both failure cases that
    /// concern this call.
    pub async fn start(&self) -> Result<(), ServerError> {
        let shared = &self.shared;
        if !shared.transition(&[ServerState::Stopped], ServerState::Starting) {
            return Err(ServerError::AlreadyRunning(shared.state.current()));
        }
        let _guard = RunGuard {
            shared,
            local_addr: &self.local_addr,
        };

        let addr = self.config.endpoint.socket_addr();
        let listener = bind_listener(addr, &self.config.socket).map_err(|source| {
            tracing::warn!("Failed to bind {addr}: {source}");
            ServerError::Listen { addr, source }
        })?;

        let bound = listener.local_addr().unwrap_or(addr);
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(bound);

        if !shared.transition(&[ServerState::Starting], ServerState::Running) {
            // Stopped while binding.
            return Ok(());
        }
        tracing::info!("Server listening on {bound}");

        self.accept_loop(listener, shared.state.subscribe())
            .await
            .map_err(|source| ServerError::Listen { addr, source })
    }

    /// Disconnect every client, stop listening and wait until `Stopped`.
    ///
    /// Returns immediately when the server is already stopped.
    pub async fn stop(&self) {
        let shared = &self.shared;
        let mut state = shared.state.subscribe();
        if shared.transition(
            &[ServerState::Starting, ServerState::Running],
            ServerState::Stopping,
        ) {
            shared.registry.close_all();
        }
        // The sender lives in `self`, so this only fails if it was dropped.
        let _ = state.wait_for(|state| *state == ServerState::Stopped).await;
    }

    /// Send `message` to one client.
    ///
    /// A missing or closed client is logged, any stale entry is removed, and
    /// `false` is returned. A write failure disconnects that client.
    pub async fn send_to(&self, id: ConnectionId, message: &str) -> bool {
        self.send_bytes(id, &codec::encode(message)).await
    }

    /// Send `message` to every registered client. Returns how many received it.
    ///
    /// A failing client is disconnected without affecting the others.
    pub async fn broadcast(&self, message: &str) -> usize {
        let bytes = codec::encode(message);
        let mut delivered = 0;
        for connection in self.shared.registry.snapshot() {
            if self.deliver(&connection, &bytes).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close and remove one client. Returns `false` if it was not registered.
    pub fn disconnect_client(&self, id: ConnectionId) -> bool {
        let removed = self.shared.disconnect(id);
        if removed {
            tracing::info!("Disconnected client {id}");
        } else {
            tracing::warn!("Cannot disconnect client {id}: not connected");
        }
        removed
    }

    /// Current state.
    pub fn state(&self) -> ServerState {
        self.shared.state.current()
    }

    /// Whether the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Watch the state without consuming events.
    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.shared.state.subscribe()
    }

    /// Wait until the server is running. Returns `false` if the start
    /// attempt ends without reaching `Running`.
    ///
    /// A stopped server counts as about to start, so this waits for the next
    /// call to [`Server::start`].
    pub async fn wait_until_running(&self) -> bool {
        let mut rx = self.watch_state();
        let mut changed = false;
        loop {
            match *rx.borrow_and_update() {
                ServerState::Running => return true,
                ServerState::Stopping => return false,
                ServerState::Stopped if changed => return false,
                ServerState::Starting | ServerState::Stopped => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
            changed = true;
        }
    }

    /// Register an observer for status changes, connections and messages.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Address actually bound while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Identifiers of the connected clients.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// The open connection registered under `id`.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.registry.get(id)
    }

    async fn send_bytes(&self, id: ConnectionId, bytes: &[u8]) -> bool {
        let registered = self.shared.registry.contains(id);
        // `get` evicts a closed entry before reporting it absent.
        match self.shared.registry.get(id) {
            Some(connection) => self.deliver(&connection, bytes).await,
            None => {
                if registered {
                    tracing::warn!("Client {id} was closed; removed stale entry");
                } else {
                    tracing::warn!("Client {id} not found");
                }
                false
            }
        }
    }

    async fn deliver(&self, connection: &Arc<Connection>, bytes: &[u8]) -> bool {
        let id = connection.id();
        match connection.write(bytes).await {
            Ok(()) => true,
            Err(err @ ConnectionError::PayloadTooLarge { .. }) => {
                tracing::warn!("Not sending to client {id}: {err}");
                false
            }
            Err(err) => {
                tracing::warn!("Send to client {id} failed: {err}");
                self.shared.registry.evict_if_same(connection);
                false
            }
        }
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        mut state: watch::Receiver<ServerState>,
    ) -> std::io::Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut state) => {
                    tracing::info!("Server shutting down");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, peer) = result.inspect_err(|e| {
                        tracing::warn!("Accept failed: {e}");
                    })?;
                    self.register(stream, peer);
                }
            }
        }
    }

    fn register(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if let Err(e) = tune_stream(&stream, &self.config.socket) {
            tracing::warn!("Failed to configure socket for {peer}: {e}");
        }

        let Some(id) = (0..MAX_ID_ATTEMPTS)
            .map(|_| self.ids.next_id())
            .find(|id| self.shared.registry.get(*id).is_none())
        else {
            tracing::warn!("No free connection identifier, rejecting {peer}");
            return;
        };

        let connection = match Connection::new(
            id,
            stream,
            self.config.framing.clone(),
            self.config.write_timeout,
        ) {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                tracing::warn!("Dropping connection from {peer}: {e}");
                return;
            }
        };
        // The accept loop is the only inserter, so the id checked above is still free.
        if let Err(e) = self.shared.registry.insert(Arc::clone(&connection)) {
            connection.close();
            tracing::warn!("Rejecting {peer}: {e}");
            return;
        }

        tracing::info!("Accepted connection {id} from {peer}");
        self.shared
            .events
            .publish(ServerEvent::ClientConnected { id, peer });

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            Self::read_loop(&connection, &shared).await;
        });
    }

    /// Per-connection reader: publish chunks until the connection ends, then
    /// unregister it. This is the only place a disconnect is announced, so
    /// each connection is announced exactly once however it was closed.
    async fn read_loop(connection: &Arc<Connection>, shared: &ServerShared) {
        let id = connection.id();
        let mut chunks = connection.read_loop();
        while let Some(chunk) = chunks.next().await {
            tracing::debug!("Client {id} sent {} bytes", chunk.len());
            shared.events.publish(ServerEvent::Message {
                id,
                text: codec::decode(&chunk),
            });
        }

        shared.registry.evict_if_same(connection);
        tracing::info!("Connection {id} closed");
        shared
            .events
            .publish(ServerEvent::ClientDisconnected { id });
    }
}

async fn stop_requested(state: &mut watch::Receiver<ServerState>) {
    let _ = state.wait_for(|state| *state != ServerState::Running).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Helper: start a server on an ephemeral port and return it with its bound address.
    async fn start_test_server() -> (Arc<Server>, SocketAddr) {
        let server = Arc::new(Server::new(ServerConfig::new("127.0.0.1", 0)));
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.start().await.unwrap();
        });
        assert!(server.wait_until_running().await);
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    /// Helper: wait until the registry holds `n` clients.
    async fn wait_for_clients(server: &Server, n: usize) {
        for _ in 0..200 {
            if server.client_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} clients, have {}", server.client_count());
    }

    #[tokio::test]
    async fn test_server_accepts_and_registers() {
        let (server, addr) = start_test_server().await;
        let mut streams = Vec::new();
        for _ in 0..5 {
            streams.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for_clients(&server, 5).await;
        assert_eq!(
            server.connection_ids(),
            (1..=5).map(ConnectionId).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (server, _addr) = start_test_server().await;
        let result = server.start().await;
        assert!(matches!(
            result,
            Err(ServerError::AlreadyRunning(ServerState::Running))
        ));
        assert!(server.is_running());
    }

    #[tokio::test]
    async fn test_send_to_delivers_bytes() {
        let (server, addr) = start_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 1).await;

        assert!(server.send_to(ConnectionId(1), "hi there").await);
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi there");
    }

    #[tokio::test]
    async fn test_send_to_unknown_id_is_harmless() {
        let (server, addr) = start_test_server().await;
        let _stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 1).await;

        assert!(!server.send_to(ConnectionId(999), "x").await);
        assert_eq!(server.client_count(), 1);
    }

    #[tokio::test]
    async fn test_received_chunks_become_events() {
        let (server, addr) = start_test_server().await;
        let mut events = server.subscribe();
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"hello").await.unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                ServerEvent::ClientConnected { id, .. } => assert_eq!(id, ConnectionId(1)),
                ServerEvent::Message { id, text } => {
                    assert_eq!(id, ConnectionId(1));
                    assert_eq!(text, "hello");
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_disconnect_unregisters() {
        let (server, addr) = start_test_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 1).await;

        drop(stream);
        wait_for_clients(&server, 0).await;
    }

    #[tokio::test]
    async fn test_disconnect_client_reports_absent_id() {
        let (server, addr) = start_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 1).await;

        assert!(server.disconnect_client(ConnectionId(1)));
        assert!(!server.disconnect_client(ConnectionId(1)));
        assert_eq!(server.client_count(), 0);

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "client should see EOF");
    }

    #[tokio::test]
    async fn test_stop_closes_connections_and_listener() {
        let (server, addr) = start_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 1).await;

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.client_count(), 0);
        assert!(server.local_addr().is_none());

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "client should see EOF after stop");
    }

    #[tokio::test]
    async fn test_stop_without_start_returns() {
        let server = Server::new(ServerConfig::default());
        tokio::time::timeout(Duration::from_secs(1), server.stop())
            .await
            .expect("stop should not block");
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (server, _addr) = start_test_server().await;
        server.stop().await;

        let srv = Arc::clone(&server);
        let run = tokio::spawn(async move { srv.start().await });
        assert!(server.wait_until_running().await);
        server.stop().await;
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_surfaces_listen_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = ServerConfig {
            socket: SocketOptions {
                reuse_addr: false,
                ..Default::default()
            },
            ..ServerConfig::new("127.0.0.1", i64::from(port))
        };
        let server = Server::new(config);

        let result = server.start().await;
        assert!(matches!(result, Err(ServerError::Listen { .. })));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_stalled_client_is_evicted_after_write_timeout() {
        let config = ServerConfig {
            write_timeout: Some(Duration::from_millis(50)),
            ..ServerConfig::new("127.0.0.1", 0)
        };
        let server = Arc::new(Server::new(config));
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.start().await.unwrap();
        });
        assert!(server.wait_until_running().await);
        let addr = server.local_addr().unwrap();
        let mut events = server.subscribe();

        // Never reads, so writes to it eventually block.
        let _stalled = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 1).await;
        let id = server.connection_ids()[0];

        let chunk = "x".repeat(1 << 20);
        let mut sends = 0;
        while server.send_to(id, &chunk).await {
            sends += 1;
            assert!(sends < 256, "writes to a stalled client never timed out");
        }

        assert_eq!(server.client_count(), 0);
        assert!(server.connection(id).is_none());
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("disconnect should be announced")
                .unwrap();
            if event == (ServerEvent::ClientDisconnected { id }) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_survives_one_stalled_client() {
        let config = ServerConfig {
            write_timeout: Some(Duration::from_millis(50)),
            ..ServerConfig::new("127.0.0.1", 0)
        };
        let server = Arc::new(Server::new(config));
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.start().await.unwrap();
        });
        assert!(server.wait_until_running().await);
        let addr = server.local_addr().unwrap();

        let _stalled = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 1).await;
        let stalled_id = server.connection_ids()[0];

        let mut healthy = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 2).await;
        let healthy_id = *server
            .connection_ids()
            .iter()
            .find(|id| **id != stalled_id)
            .unwrap();
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            while healthy.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let chunk = "x".repeat(1 << 20);
        let mut rounds = 0;
        let delivered = loop {
            let delivered = server.broadcast(&chunk).await;
            if delivered != 2 {
                break delivered;
            }
            rounds += 1;
            assert!(rounds < 256, "writes to a stalled client never timed out");
        };

        assert_eq!(delivered, 1);
        assert!(server.connection(stalled_id).is_none());
        assert_eq!(server.connection_ids(), vec![healthy_id]);
        drain.abort();
    }

    #[test]
    fn test_invalid_config_falls_back() {
        let config = ServerConfig::new("300.1.1.1", 70_000);
        assert_eq!(config.endpoint, EndpointConfig::default());
    }
}
