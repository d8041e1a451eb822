//! # routeip
//!
//! Transport and routing core for a SOME/IP service-oriented middleware.
//!
//! Applications on one host attach to a *routing host* process over a local
//! stream channel. The routing host arbitrates client identities, service
//! registrations and subscriptions, and forwards SOME/IP traffic to and from
//! the wire. This crate implements the two subsystems an application embeds:
//!
//! - the **UDP server endpoint** ([`endpoint::udp`]): a connection-less
//!   SOME/IP transport multiplexing unicast and multicast I/O over one
//!   logical endpoint, with SOME/IP-TP segmentation and reassembly,
//!   per-target send queues with separation timing, inbound validation and
//!   a two-socket asynchronous shutdown;
//! - the **routing-manager client** ([`routing`]): the local participant
//!   that negotiates a client identifier with the routing host, batches
//!   outbound messages into debounced trains, tracks pending and live
//!   subscriptions, and replays its provider/requester/event/subscription
//!   state after a disconnect.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use routeip::{Config, routing::{RoutingApp, RoutingClient}};
//!
//! struct BrakeMonitor;
//!
//! impl RoutingApp for BrakeMonitor {
//!     // registration, availability, message and subscription callbacks
//! #   fn on_state(&self, _: routeip::routing::RegistrationState) {}
//! #   fn on_availability(&self, _: u16, _: u16, _: bool, _: u8, _: u32) {}
//! #   fn on_message(&self, _: bytes::Bytes, _: u16, _: u16) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> routeip::Result<()> {
//!     let config = Config::builder()
//!         .application_name("brake_monitor")
//!         .build();
//!     let client = RoutingClient::start(config, Arc::new(BrakeMonitor));
//!     client.offer_service(0x1234, 0x0001, 1, 0)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency model
//!
//! Every endpoint owns a single task (its *strand*); all socket writes,
//! timer callbacks and state transitions for that endpoint execute there.
//! `send()` and `stop()` may be called from any task: they post a command
//! onto the endpoint's channel and return. At most one asynchronous write
//! is outstanding per socket, and the train scheduler's admission step never
//! interleaves with its dispatch timer.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod net;
pub mod protocol;
pub mod routing;
pub mod tp;
pub mod train;
pub mod wire;

pub use config::{Config, ConfigBuilder, MethodTiming, TpMethodConfig};
pub use error::{Error, Result};

// ============================================================================
// PROTOCOL IDENTIFIERS
// ============================================================================

/// Service identifier (16 bit).
pub type ServiceId = u16;
/// Service instance identifier (16 bit).
pub type InstanceId = u16;
/// Method or event identifier (16 bit). Events have bit 15 set.
pub type MethodId = u16;
/// Event identifier (16 bit).
pub type EventId = u16;
/// Eventgroup identifier (16 bit).
pub type EventgroupId = u16;
/// Client identifier (16 bit), assigned by the routing host.
pub type ClientId = u16;
/// Session identifier (16 bit).
pub type SessionId = u16;
/// Interface major version (8 bit).
pub type MajorVersion = u8;
/// Interface minor version (32 bit), exchanged out of band.
pub type MinorVersion = u32;

/// Client id reserved for the routing host itself.
pub const ROUTING_CLIENT: ClientId = 0x0000;

/// Sentinel returned while no client id has been assigned yet.
pub const CLIENT_UNSET: ClientId = 0xFFFF;

/// Wildcard event id ("any event of the eventgroup").
pub const ANY_EVENT: EventId = 0xFFFF;

/// Wildcard service id.
pub const ANY_SERVICE: ServiceId = 0xFFFF;

/// Wildcard instance id.
pub const ANY_INSTANCE: InstanceId = 0xFFFF;

/// Wildcard major version.
pub const ANY_MAJOR: MajorVersion = 0xFF;

/// Pending-id sentinel tagging a subscribe command as *local*: the routing
/// client acknowledges it itself instead of a remote-subscription controller.
pub const PENDING_ID_LOCAL: u16 = 0xFFFF;
