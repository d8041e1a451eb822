//! Tokio socket implementations.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use super::{Connector, Listener, Stream, UdpOptions, UdpSocket};

impl UdpSocket for tokio::net::UdpSocket {
    async fn bind(addr: SocketAddr) -> io::Result<Self> {
        tokio::net::UdpSocket::bind(addr).await
    }

    async fn bind_with(addr: SocketAddr, options: &UdpOptions) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if options.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if options.broadcast {
            socket.set_broadcast(true)?;
        }

        #[cfg(target_os = "linux")]
        if let Some(device) = &options.device {
            if let Err(e) = socket.bind_device(Some(device.as_bytes())) {
                warn!("udp: could not bind to device {:?}: {}", device, e);
            }
        }

        if let Some(size) = options.receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
            let effective = socket.recv_buffer_size()?;
            if effective < size {
                // raising further would need CAP_NET_ADMIN
                warn!(
                    "udp: SO_RCVBUF is {} (requested {})",
                    effective, size
                );
            } else {
                info!("udp: SO_RCVBUF is {}", effective);
            }
        }

        if let Some(interface) = options.multicast_interface_v4 {
            socket.set_multicast_if_v4(&interface)?;
        }
        if let Some(scope) = options.multicast_interface_v6 {
            socket.set_multicast_if_v6(scope)?;
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        tokio::net::UdpSocket::from_std(std_socket)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf).await
    }

    fn join_multicast_v4(&self, multiaddr: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        tokio::net::UdpSocket::join_multicast_v4(self, multiaddr, interface)
    }

    fn leave_multicast_v4(&self, multiaddr: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        tokio::net::UdpSocket::leave_multicast_v4(self, multiaddr, interface)
    }

    fn join_multicast_v6(&self, multiaddr: Ipv6Addr, interface: u32) -> io::Result<()> {
        tokio::net::UdpSocket::join_multicast_v6(self, &multiaddr, interface)
    }

    fn leave_multicast_v6(&self, multiaddr: Ipv6Addr, interface: u32) -> io::Result<()> {
        tokio::net::UdpSocket::leave_multicast_v6(self, &multiaddr, interface)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

impl Stream for tokio::net::TcpStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await
    }
}

#[cfg(unix)]
impl Stream for tokio::net::UnixStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await
    }
}

// ============================================================================
// Local channel: unix-domain stream or TCP loopback
// ============================================================================

/// Address of a local-channel peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalTarget {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

/// A local-channel stream: TCP loopback or unix-domain.
#[derive(Debug)]
pub enum LocalStream {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl LocalStream {
    pub async fn connect(target: &LocalTarget) -> io::Result<Self> {
        match target {
            LocalTarget::Tcp(addr) => {
                Ok(LocalStream::Tcp(tokio::net::TcpStream::connect(addr).await?))
            }
            #[cfg(unix)]
            LocalTarget::Unix(path) => Ok(LocalStream::Unix(
                tokio::net::UnixStream::connect(path).await?,
            )),
        }
    }
}

impl Stream for LocalStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LocalStream::Tcp(stream) => AsyncReadExt::read(stream, buf).await,
            #[cfg(unix)]
            LocalStream::Unix(stream) => AsyncReadExt::read(stream, buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            LocalStream::Tcp(stream) => AsyncWriteExt::write_all(stream, buf).await,
            #[cfg(unix)]
            LocalStream::Unix(stream) => AsyncWriteExt::write_all(stream, buf).await,
        }
    }
}

/// Acceptor for local-channel streams.
#[derive(Debug)]
pub enum LocalListener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl LocalListener {
    /// Bind a TCP loopback listener on an ephemeral port.
    pub async fn bind_loopback() -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        Ok(LocalListener::Tcp(listener))
    }

    /// Bind a unix-domain listener at `path`, replacing a stale socket file.
    #[cfg(unix)]
    pub fn bind_unix(path: &std::path::Path) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);
        Ok(LocalListener::Unix(tokio::net::UnixListener::bind(path)?))
    }
}

impl Listener for LocalListener {
    type Stream = LocalStream;

    async fn accept(&self) -> io::Result<LocalStream> {
        match self {
            LocalListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(LocalStream::Tcp(stream))
            }
            #[cfg(unix)]
            LocalListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(LocalStream::Unix(stream))
            }
        }
    }

    fn local_port(&self) -> u16 {
        match self {
            LocalListener::Tcp(listener) => {
                listener.local_addr().map(|addr| addr.port()).unwrap_or(0)
            }
            #[cfg(unix)]
            LocalListener::Unix(_) => 0,
        }
    }
}

/// Connector for TCP loopback targets.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub address: SocketAddr,
}

impl Connector for TcpConnector {
    type Stream = LocalStream;

    async fn connect(&self) -> io::Result<LocalStream> {
        LocalStream::connect(&LocalTarget::Tcp(self.address)).await
    }
}

/// Connector for unix-domain targets.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    pub path: PathBuf,
}

impl Connector for UnixConnector {
    type Stream = LocalStream;

    async fn connect(&self) -> io::Result<LocalStream> {
        #[cfg(unix)]
        {
            LocalStream::connect(&LocalTarget::Unix(self.path.clone())).await
        }
        #[cfg(not(unix))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix-domain routing channel requires a unix platform",
            ))
        }
    }
}

/// Generic connector over both local-channel shapes, picked from the
/// configuration.
#[derive(Debug, Clone)]
pub enum LocalConnector {
    Tcp(TcpConnector),
    Unix(UnixConnector),
}

impl Connector for LocalConnector {
    type Stream = LocalStream;

    async fn connect(&self) -> io::Result<LocalStream> {
        match self {
            LocalConnector::Tcp(connector) => connector.connect().await,
            LocalConnector::Unix(connector) => connector.connect().await,
        }
    }
}
