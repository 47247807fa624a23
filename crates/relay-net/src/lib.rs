//! TCP messaging: a single-connection client, a multi-connection server,
//! connection lifecycle, framing and local address lookup.

pub mod addr;
pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod framing;
pub mod platform;
pub mod registry;
pub mod status;
pub mod tcp_client;
pub mod tcp_server;

pub use addr::{AddressFamily, local_address};
pub use connection::{Connection, ConnectionError, ConnectionId, ReadLoop};
pub use endpoint::{DEFAULT_ADDRESS, DEFAULT_PORT, EndpointConfig, ValidationError};
pub use framing::{FrameConfig, FrameError, Framing, read_frame, write_frame};
pub use platform::{KeepaliveOptions, SocketOptions};
pub use registry::{ConnectionRegistry, DuplicateId, IdGenerator, RandomIds, SequentialIds};
pub use status::{
    ClientEvent, ConnectionState, EventBus, ServerEvent, ServerState, StateWatch,
};
pub use tcp_client::{Client, ClientConfig, ClientError};
pub use tcp_server::{Server, ServerConfig, ServerError};
