//! Turmoil socket implementations for deterministic network simulation.
//! Enabled with the `turmoil` feature.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Connector, Listener, Stream, UdpOptions, UdpSocket};

impl UdpSocket for turmoil::net::UdpSocket {
    async fn bind(addr: SocketAddr) -> io::Result<Self> {
        turmoil::net::UdpSocket::bind(addr).await
    }

    async fn bind_with(addr: SocketAddr, _options: &UdpOptions) -> io::Result<Self> {
        // simulated sockets have no socket options
        turmoil::net::UdpSocket::bind(addr).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        turmoil::net::UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        turmoil::net::UdpSocket::recv_from(self, buf).await
    }

    fn join_multicast_v4(&self, multiaddr: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        turmoil::net::UdpSocket::join_multicast_v4(self, multiaddr, interface)
    }

    fn leave_multicast_v4(&self, multiaddr: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        turmoil::net::UdpSocket::leave_multicast_v4(self, multiaddr, interface)
    }

    fn join_multicast_v6(&self, _multiaddr: Ipv6Addr, _interface: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "turmoil does not simulate IPv6 multicast",
        ))
    }

    fn leave_multicast_v6(&self, _multiaddr: Ipv6Addr, _interface: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "turmoil does not simulate IPv6 multicast",
        ))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        turmoil::net::UdpSocket::local_addr(self)
    }
}

impl Stream for turmoil::net::TcpStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await
    }
}

impl Listener for turmoil::net::TcpListener {
    type Stream = turmoil::net::TcpStream;

    async fn accept(&self) -> io::Result<turmoil::net::TcpStream> {
        let (stream, _) = turmoil::net::TcpListener::accept(self).await?;
        Ok(stream)
    }

    fn local_port(&self) -> u16 {
        turmoil::net::TcpListener::local_addr(self)
            .map(|addr| addr.port())
            .unwrap_or(0)
    }
}

/// Connector for simulated TCP targets.
#[derive(Debug, Clone)]
pub struct TurmoilConnector {
    pub address: SocketAddr,
}

impl Connector for TurmoilConnector {
    type Stream = turmoil::net::TcpStream;

    async fn connect(&self) -> io::Result<turmoil::net::TcpStream> {
        turmoil::net::TcpStream::connect(self.address).await
    }
}
