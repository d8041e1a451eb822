//! # Configuration
//!
//! Static configuration for the routing client and its endpoints.
//!
//! ## Quick start
//!
//! ```
//! use routeip::Config;
//!
//! let config = Config::builder()
//!     .application_name("brake_monitor")
//!     .build();
//! ```
//!
//! ## Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `routing_host` | unix socket under `/tmp/routeip` | where the routing host listens |
//! | `unicast` | `0.0.0.0:30509` | local UDP endpoint address |
//! | `sd_port` | 30490 | port reserved for service discovery traffic |
//! | `max_message_size` | 1400 | largest unsegmented UDP message |
//! | `endpoint_queue_limit` | unlimited | per-target send queue byte budget |
//! | `connect_timeout` | 100 ms | initial reconnect delay of the sender |
//! | `register_timeout` | 3 s | watchdog for assignment/registration |
//! | `keepalive_interval` | off | host liveness probing while registered |
//! | `request_debounce` | 0 ms | batching window for service requests |
//!
//! Per-(service, method) debounce/retention timings and TP segmentation
//! parameters are configured through [`ConfigBuilder::timing`] and
//! [`ConfigBuilder::tp_method`].

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use crate::{MethodId, ServiceId};

/// Default port of the UDP server endpoint.
pub const DEFAULT_UNICAST_PORT: u16 = 30509;

/// Default service-discovery port. TP-flagged messages arriving here are
/// rejected and SD body-length guardrails apply.
pub const DEFAULT_SD_PORT: u16 = 30490;

/// Default maximum size of an unsegmented UDP message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1400;

/// Default receive buffer requested for UDP sockets.
pub const DEFAULT_UDP_RECEIVE_BUFFER_SIZE: usize = 1_703_936;

/// Initial reconnect delay of the sender endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Ceiling for the exponentially growing reconnect delay.
pub const MAX_CONNECT_TIMEOUT: Duration = Duration::from_millis(1600);

/// Consecutive failures after which the reconnect delay starts doubling.
pub const RECONNECT_BACKOFF_THRESHOLD: u32 = 30;

/// Watchdog armed around client assignment and application registration.
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(3);

/// Idle window after which a TP reassembly context is evicted.
pub const DEFAULT_TP_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-(service, method) transmission timing constraints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodTiming {
    /// Minimum delay between successive transmissions of this identifier.
    pub debounce: Duration,
    /// Maximum delay an enqueued message may wait before transmission.
    pub max_retention: Duration,
}

/// Per-(service, method) SOME/IP-TP segmentation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpMethodConfig {
    /// Maximum payload bytes per segment; multiple of 16.
    pub max_segment_length: u16,
    /// Minimum spacing between segment transmissions, in microseconds.
    pub separation_time_us: u32,
}

impl Default for TpMethodConfig {
    fn default() -> Self {
        Self {
            max_segment_length: 1392,
            separation_time_us: 0,
        }
    }
}

/// How to reach the routing host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingHost {
    /// Unix-domain stream socket (local routing, POSIX default).
    Local { path: PathBuf },
    /// TCP loopback socket (non-local routing).
    Tcp { address: SocketAddr },
}

/// Static configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application name announced during client assignment.
    pub application_name: String,
    /// Routing host channel.
    pub routing_host: RoutingHost,
    /// Local address of the UDP server endpoint.
    pub unicast: SocketAddr,
    /// IPv4 netmask used for the same-subnet check on multicast receives.
    pub netmask: Ipv4Addr,
    /// IPv6 prefix length used for the same-subnet check.
    pub prefix: u8,
    /// Service-discovery port.
    pub sd_port: u16,
    /// Network device to bind UDP sockets to, if any.
    pub device: Option<String>,
    /// Receive buffer size requested for UDP sockets.
    pub udp_receive_buffer_size: usize,
    /// Largest message accepted without TP segmentation.
    pub max_message_size: usize,
    /// Per-target send queue byte budget; `None` means unlimited.
    pub endpoint_queue_limit: Option<usize>,
    /// Initial reconnect delay of the sender endpoint.
    pub connect_timeout: Duration,
    /// Ceiling for the reconnect delay after backoff.
    pub max_connect_timeout: Duration,
    /// Reconnect attempts before `max-reconnects-reached` is signalled;
    /// `None` means unlimited.
    pub max_reconnects: Option<u32>,
    /// Assignment/registration watchdog.
    pub register_timeout: Duration,
    /// Keepalive probe interval while registered; `None` disables probing.
    pub keepalive_interval: Option<Duration>,
    /// Batching window for service requests issued before registration.
    pub request_debounce: Duration,
    /// Idle eviction window of TP reassembly contexts.
    pub tp_reassembly_timeout: Duration,
    /// Deliver own multicast transmissions to the dedicated callback.
    pub receive_own_multicast: bool,
    timings: HashMap<(ServiceId, MethodId), MethodTiming>,
    tp_methods: HashMap<(ServiceId, MethodId), TpMethodConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application_name: String::new(),
            routing_host: RoutingHost::Local {
                path: PathBuf::from("/tmp/routeip"),
            },
            unicast: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                DEFAULT_UNICAST_PORT,
            )),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            prefix: 64,
            sd_port: DEFAULT_SD_PORT,
            device: None,
            udp_receive_buffer_size: DEFAULT_UDP_RECEIVE_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            endpoint_queue_limit: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connect_timeout: MAX_CONNECT_TIMEOUT,
            max_reconnects: None,
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
            keepalive_interval: None,
            request_debounce: Duration::ZERO,
            tp_reassembly_timeout: DEFAULT_TP_REASSEMBLY_TIMEOUT,
            receive_own_multicast: false,
            timings: HashMap::new(),
            tp_methods: HashMap::new(),
        }
    }
}

impl Config {
    /// Create a new builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Debounce/retention timing for a (service, method). Service-discovery
    /// traffic always uses zero timings.
    pub fn timing(&self, service: ServiceId, method: MethodId) -> MethodTiming {
        if service == crate::wire::SD_SERVICE && method == crate::wire::SD_METHOD {
            return MethodTiming::default();
        }
        self.timings
            .get(&(service, method))
            .copied()
            .unwrap_or_default()
    }

    /// TP configuration for a (service, method), if segmentation is enabled
    /// for it.
    pub fn tp_method(&self, service: ServiceId, method: MethodId) -> Option<TpMethodConfig> {
        self.tp_methods.get(&(service, method)).copied()
    }

    /// Whether TP segmentation/reassembly is enabled for a (service, method).
    pub fn tp_enabled(&self, service: ServiceId, method: MethodId) -> bool {
        self.tp_methods.contains_key(&(service, method))
    }

    /// Whether the local address belongs to the same v4 network or v6 prefix
    /// as `remote`. Used to gate multicast deliveries.
    pub fn is_same_subnet(&self, local: IpAddr, remote: IpAddr) -> bool {
        match (local, remote) {
            (IpAddr::V4(local), IpAddr::V4(remote)) => {
                let mask = u32::from(self.netmask);
                (u32::from(local) & mask) == (u32::from(remote) & mask)
            }
            (IpAddr::V6(local), IpAddr::V6(remote)) => {
                let bits = u128::from_be_bytes(local.octets())
                    ^ u128::from_be_bytes(remote.octets());
                let prefix = u32::from(self.prefix.min(128));
                prefix == 0 || bits.leading_zeros() >= prefix
            }
            _ => false,
        }
    }
}

/// Builder for [`Config`].
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the application name announced during client assignment.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Use a unix-domain routing channel at the given base path.
    pub fn routing_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.routing_host = RoutingHost::Local { path: path.into() };
        self
    }

    /// Use a TCP loopback routing channel ("non-local routing").
    pub fn routing_address(mut self, address: SocketAddr) -> Self {
        self.config.routing_host = RoutingHost::Tcp { address };
        self
    }

    /// Set the local UDP endpoint address.
    pub fn unicast(mut self, address: SocketAddr) -> Self {
        self.config.unicast = address;
        self
    }

    /// Set the IPv4 netmask for the same-subnet check.
    pub fn netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.config.netmask = netmask;
        self
    }

    /// Set the IPv6 prefix length for the same-subnet check.
    pub fn prefix(mut self, prefix: u8) -> Self {
        self.config.prefix = prefix;
        self
    }

    /// Set the service-discovery port.
    pub fn sd_port(mut self, port: u16) -> Self {
        self.config.sd_port = port;
        self
    }

    /// Bind UDP sockets to a specific network device.
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.device = Some(device.into());
        self
    }

    /// Set the UDP receive buffer size.
    pub fn udp_receive_buffer_size(mut self, size: usize) -> Self {
        self.config.udp_receive_buffer_size = size;
        self
    }

    /// Set the maximum unsegmented message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the per-target send queue byte budget.
    pub fn endpoint_queue_limit(mut self, limit: usize) -> Self {
        self.config.endpoint_queue_limit = Some(limit);
        self
    }

    /// Set the initial reconnect delay.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Cap the number of reconnect attempts.
    pub fn max_reconnects(mut self, attempts: u32) -> Self {
        self.config.max_reconnects = Some(attempts);
        self
    }

    /// Set the assignment/registration watchdog.
    pub fn register_timeout(mut self, timeout: Duration) -> Self {
        self.config.register_timeout = timeout;
        self
    }

    /// Enable keepalive probing with the given interval.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = Some(interval);
        self
    }

    /// Set the request batching window.
    pub fn request_debounce(mut self, window: Duration) -> Self {
        self.config.request_debounce = window;
        self
    }

    /// Set the TP reassembly eviction window.
    pub fn tp_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.config.tp_reassembly_timeout = timeout;
        self
    }

    /// Deliver own multicast transmissions to the dedicated callback.
    pub fn receive_own_multicast(mut self, enabled: bool) -> Self {
        self.config.receive_own_multicast = enabled;
        self
    }

    /// Configure debounce/retention timing for a (service, method).
    pub fn timing(
        mut self,
        service: ServiceId,
        method: MethodId,
        debounce: Duration,
        max_retention: Duration,
    ) -> Self {
        self.config.timings.insert(
            (service, method),
            MethodTiming {
                debounce,
                max_retention,
            },
        );
        self
    }

    /// Enable TP segmentation for a (service, method).
    pub fn tp_method(
        mut self,
        service: ServiceId,
        method: MethodId,
        max_segment_length: u16,
        separation_time_us: u32,
    ) -> Self {
        self.config.tp_methods.insert(
            (service, method),
            TpMethodConfig {
                max_segment_length,
                separation_time_us,
            },
        );
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_defaults_to_zero() {
        let config = Config::default();
        assert_eq!(config.timing(0x1234, 0x0001), MethodTiming::default());
    }

    #[test]
    fn sd_traffic_never_debounced() {
        let config = Config::builder()
            .timing(
                crate::wire::SD_SERVICE,
                crate::wire::SD_METHOD,
                Duration::from_millis(50),
                Duration::from_millis(200),
            )
            .build();
        assert_eq!(
            config.timing(crate::wire::SD_SERVICE, crate::wire::SD_METHOD),
            MethodTiming::default()
        );
    }

    #[test]
    fn same_subnet_v4() {
        let config = Config::default();
        let local = "192.168.1.10".parse().unwrap();
        assert!(config.is_same_subnet(local, "192.168.1.77".parse().unwrap()));
        assert!(!config.is_same_subnet(local, "192.168.2.77".parse().unwrap()));
        assert!(!config.is_same_subnet(local, "::1".parse().unwrap()));
    }

    #[test]
    fn same_subnet_v6_prefix() {
        let config = Config::builder().prefix(16).build();
        let local = "fd00::1".parse().unwrap();
        assert!(config.is_same_subnet(local, "fd00::2:3".parse().unwrap()));
        assert!(!config.is_same_subnet(local, "fe80::1".parse().unwrap()));
    }
}
