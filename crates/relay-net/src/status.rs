//! Endpoint status and observer notification.
//!
//! Each endpoint keeps its current state in a [`StateWatch`] (latest value,
//! readable without blocking) and publishes every state change and received
//! message on an [`EventBus`]. Subscribers get a bounded queue each; a
//! subscriber that falls behind loses the oldest events and learns how many
//! through [`broadcast::error::RecvError::Lagged`]. Publishing never waits for
//! subscribers.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::{broadcast, watch};

use crate::connection::ConnectionId;

/// Default number of undelivered events kept per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Client connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Dialing the server.
    Connecting,
    /// Connected and reading.
    Connected,
}

impl ConnectionState {
    /// Whether the client is connected.
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        }
    }
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not listening.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Shutting down.
    Stopping,
}

impl ServerState {
    /// Whether the server is accepting connections.
    pub fn is_running(self) -> bool {
        self == ServerState::Running
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            ServerState::Stopped => "Stopped",
            ServerState::Starting => "Starting",
            ServerState::Running => "Running",
            ServerState::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Events published by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection state changed.
    StatusChanged(ConnectionState),
    /// One received chunk, decoded as text.
    Message(String),
}

/// Events published by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The server state changed.
    StatusChanged(ServerState),
    /// A connection was accepted and registered.
    ClientConnected {
        /// The new connection.
        id: ConnectionId,
        /// Remote address.
        peer: SocketAddr,
    },
    /// A connection was closed and unregistered.
    ClientDisconnected {
        /// The closed connection.
        id: ConnectionId,
    },
    /// One chunk received on a connection, decoded as text.
    Message {
        /// Source connection.
        id: ConnectionId,
        /// Decoded text.
        text: String,
    },
}

/// Observable state backed by a [`watch`] channel.
pub struct StateWatch<S> {
    tx: watch::Sender<S>,
}

impl<S: Copy + PartialEq> StateWatch<S> {
    /// Create a watch holding `initial`.
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Set the state. Returns `true` if it changed.
    pub fn set(&self, state: S) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    /// Move to `to` only if the state is one of `from`. Returns `true` on success.
    pub fn transition(&self, from: &[S], to: S) -> bool {
        self.tx.send_if_modified(|current| {
            if from.contains(current) && *current != to {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> S {
        *self.tx.borrow()
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }
}

/// Fan-out of endpoint events to any number of subscribers.
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus keeping up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a subscriber. It receives events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Publish `event`. Having no subscribers is not an error.
    pub fn publish(&self, event: E) {
        let _ = self.tx.send(event);
    }
}
