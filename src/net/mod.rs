//! # Network Abstraction Layer
//!
//! Traits that abstract the three socket shapes the crate uses, so endpoint
//! logic can run against production sockets or simulated ones:
//!
//! | Trait | Capability | Production impl | Testing impl |
//! |-------|------------|-----------------|--------------|
//! | [`UdpSocket`] | connectionless: bind, send_to, recv_from, multicast | `tokio::net::UdpSocket` | `turmoil::net::UdpSocket` |
//! | [`Stream`] | connection-oriented: read, write | TCP or unix stream | `turmoil::net::TcpStream` |
//! | [`Listener`] | accept [`Stream`]s | TCP or unix listener | `turmoil::net::TcpListener` |
//!
//! [`Connector`] captures how a client endpoint (re)establishes its stream;
//! the sender endpoint keeps one and calls it on every reconnect attempt.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

mod tokio_impl;

#[cfg(feature = "turmoil")]
mod turmoil_impl;

pub use tokio_impl::{
    LocalConnector, LocalListener, LocalStream, LocalTarget, TcpConnector, UnixConnector,
};

#[cfg(feature = "turmoil")]
pub use turmoil_impl::TurmoilConnector;

/// Socket options applied when opening a server-side UDP socket.
#[derive(Debug, Clone, Default)]
pub struct UdpOptions {
    /// Allow address reuse (`SO_REUSEADDR`).
    pub reuse_address: bool,
    /// Enable broadcast.
    pub broadcast: bool,
    /// Requested receive buffer size (`SO_RCVBUF`).
    pub receive_buffer_size: Option<usize>,
    /// Bind to a network device (`SO_BINDTODEVICE`, Linux only).
    pub device: Option<String>,
    /// Outbound multicast interface, IPv4.
    pub multicast_interface_v4: Option<Ipv4Addr>,
    /// Outbound multicast interface scope id, IPv6.
    pub multicast_interface_v6: Option<u32>,
}

/// Connectionless socket capability set.
pub trait UdpSocket: Send + Sync + Sized + 'static {
    /// Bind a plain socket.
    fn bind(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send;

    /// Bind a server socket with the given options applied before the bind.
    /// Implementations without real sockets may ignore the options.
    fn bind_with(
        addr: SocketAddr,
        options: &UdpOptions,
    ) -> impl Future<Output = io::Result<Self>> + Send;

    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    fn join_multicast_v4(&self, multiaddr: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()>;

    fn leave_multicast_v4(&self, multiaddr: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()>;

    fn join_multicast_v6(&self, multiaddr: Ipv6Addr, interface: u32) -> io::Result<()>;

    fn leave_multicast_v6(&self, multiaddr: Ipv6Addr, interface: u32) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Connection-oriented stream capability set.
pub trait Stream: Send + 'static {
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// Acceptor for [`Stream`]s.
pub trait Listener: Send + Sync + Sized + 'static {
    type Stream: Stream;

    fn accept(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Port to announce during application registration; 0 for unix-domain
    /// listeners.
    fn local_port(&self) -> u16;
}

/// How a client endpoint establishes its stream. Called again on every
/// reconnect attempt.
pub trait Connector: Send + Sync + Clone + 'static {
    type Stream: Stream;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}
