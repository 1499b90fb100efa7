// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Transport seam: how the agent opens connections.
//!
//! The agent never performs socket I/O itself. It asks a [`Transport`] for a
//! new [`Connection`] and afterwards only touches lifecycle hooks
//! (writability, keep-alive, destroy).

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

#[cfg(unix)]
use tokio::net::UnixStream;

use crate::options::ConnectOptions;

/// Opens connections for the agent
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connection type produced by this transport
    type Conn: Connection;

    /// Open a connection described by `options`
    async fn connect(&self, options: &ConnectOptions) -> io::Result<Self::Conn>;
}

/// Lifecycle hooks of a pooled connection
pub trait Connection: Send + 'static {
    /// Whether the connection can still be written to
    fn is_writable(&self) -> bool;

    /// Whether the connection has been destroyed
    fn is_destroyed(&self) -> bool;

    /// Tear the connection down
    fn destroy(&mut self);

    /// Configure TCP keep-alive probes
    fn set_keep_alive(&mut self, enable: bool, initial_delay: Duration);

    /// Inactivity timeout the owner should enforce, if any
    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    /// Keep the event loop alive while this connection exists
    fn set_ref(&mut self, _referenced: bool) {}
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// TCP or Unix domain socket connection opened by [`TcpTransport`]
pub struct TcpConnection {
    stream: Option<Stream>,
    keep_alive: Option<Duration>,
    referenced: bool,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.stream {
            Some(Stream::Tcp(_)) => "tcp",
            #[cfg(unix)]
            Some(Stream::Unix(_)) => "unix",
            None => "destroyed",
        };
        f.debug_struct("TcpConnection")
            .field("kind", &kind)
            .field("keep_alive", &self.keep_alive)
            .field("referenced", &self.referenced)
            .finish()
    }
}

impl TcpConnection {
    fn new(stream: Stream) -> Self {
        Self {
            stream: Some(stream),
            keep_alive: None,
            referenced: true,
        }
    }

    /// The TCP stream, unless this is a Unix socket or destroyed
    pub fn tcp_mut(&mut self) -> Option<&mut TcpStream> {
        match self.stream.as_mut()? {
            Stream::Tcp(stream) => Some(stream),
            #[cfg(unix)]
            Stream::Unix(_) => None,
        }
    }

    /// The Unix stream, unless this is a TCP socket or destroyed
    #[cfg(unix)]
    pub fn unix_mut(&mut self) -> Option<&mut UnixStream> {
        match self.stream.as_mut()? {
            Stream::Unix(stream) => Some(stream),
            Stream::Tcp(_) => None,
        }
    }

    /// Remote address of a TCP connection
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.stream.as_ref()? {
            Stream::Tcp(stream) => stream.peer_addr().ok(),
            #[cfg(unix)]
            Stream::Unix(_) => None,
        }
    }

    /// Keep-alive delay last requested by the agent
    pub fn keep_alive_delay(&self) -> Option<Duration> {
        self.keep_alive
    }

    /// Whether the connection currently holds the event loop open
    pub fn is_referenced(&self) -> bool {
        self.referenced
    }
}

impl Connection for TcpConnection {
    fn is_writable(&self) -> bool {
        self.stream.is_some()
    }

    fn is_destroyed(&self) -> bool {
        self.stream.is_none()
    }

    fn destroy(&mut self) {
        // Dropping the stream closes the descriptor
        self.stream = None;
    }

    fn set_keep_alive(&mut self, enable: bool, initial_delay: Duration) {
        // SO_KEEPALIVE itself is set at connect time; the probe delay is
        // left to the OS default.
        self.keep_alive = enable.then_some(initial_delay);
    }

    fn set_ref(&mut self, referenced: bool) {
        self.referenced = referenced;
    }
}

/// Opens TCP connections with tokio, or Unix domain sockets when
/// `socket_path` is set
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
}

impl TcpTransport {
    /// Create a transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort connection attempts that take longer than `timeout`
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    async fn connect_tcp(&self, options: &ConnectOptions) -> io::Result<TcpStream> {
        let host = options.host_or_default();
        let port = options.port.unwrap_or(80);
        let local: Option<IpAddr> = match options.local_address.as_deref() {
            Some(addr) => Some(addr.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid local address '{}'", addr),
                )
            })?),
            None => None,
        };

        let mut last_err = None;
        for addr in tokio::net::lookup_host((host, port)).await? {
            let family_ok = match options.family {
                Some(4) => addr.is_ipv4(),
                Some(6) => addr.is_ipv6(),
                _ => true,
            };
            if !family_ok {
                continue;
            }

            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if let Some(local) = local {
                socket.bind(SocketAddr::new(local, 0))?;
            }
            if options.keep_alive {
                socket.set_keepalive(true)?;
            }

            match socket.connect(addr).await {
                Ok(stream) => {
                    tracing::debug!(%addr, "connected");
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}:{}", host, port),
            )
        }))
    }

    async fn open(&self, options: &ConnectOptions) -> io::Result<TcpConnection> {
        if let Some(path) = options.socket_path.as_deref() {
            #[cfg(unix)]
            {
                let stream = UnixStream::connect(path).await?;
                return Ok(TcpConnection::new(Stream::Unix(stream)));
            }
            #[cfg(not(unix))]
            {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unix sockets are not supported here: {}", path),
                ));
            }
        }
        let stream = self.connect_tcp(options).await?;
        Ok(TcpConnection::new(Stream::Tcp(stream)))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Conn = TcpConnection;

    async fn connect(&self, options: &ConnectOptions) -> io::Result<TcpConnection> {
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.open(options))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))?,
            None => self.open(options).await,
        }
    }
}
