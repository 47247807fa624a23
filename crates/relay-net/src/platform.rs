//! TCP socket tuning shared by both endpoints.
//!
//! [`SocketOptions`] carries the options applied to every dialed or accepted
//! stream. Listeners are built through `socket2` so `SO_REUSEADDR` can be set
//! before binding.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Pending-connection queue length for listeners.
const LISTEN_BACKLOG: i32 = 128;

/// Socket options applied to every connection.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm. Default: true.
    pub nodelay: bool,
    /// TCP keepalive probing, `None` to leave the OS default. Default: enabled.
    pub keepalive: Option<KeepaliveOptions>,
    /// Set `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
}

/// TCP keepalive timings.
#[derive(Debug, Clone)]
pub struct KeepaliveOptions {
    /// Idle time before the first probe. Default: 60s.
    pub idle: Duration,
    /// Interval between probes. Default: 10s.
    pub interval: Duration,
    /// Failed probes before the connection is dropped (Linux and Windows only). Default: 3.
    pub retries: u32,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            retries: 3,
        }
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(KeepaliveOptions::default()),
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Apply `options` to a connected stream.
pub fn tune_stream(stream: &TcpStream, options: &SocketOptions) -> std::io::Result<()> {
    stream.set_nodelay(options.nodelay)?;

    if let Some(keepalive) = &options.keepalive {
        let params = TcpKeepalive::new()
            .with_time(keepalive.idle)
            .with_interval(keepalive.interval);

        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let params = params.with_retries(keepalive.retries);

        SockRef::from(stream).set_tcp_keepalive(&params)?;
    }

    Ok(())
}

/// Bind and listen on `addr`.
pub fn bind_listener(addr: SocketAddr, options: &SocketOptions) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if options.reuse_addr {
        socket.set_reuse_address(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Dial `addr`, optionally bounded by `timeout`, and tune the resulting stream.
pub async fn dial(
    addr: SocketAddr,
    options: &SocketOptions,
    timeout: Option<Duration>,
) -> std::io::Result<TcpStream> {
    let stream = match timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??,
        None => TcpStream::connect(addr).await?,
    };
    tune_stream(&stream, options)?;
    Ok(stream)
}
