//! # Routing-Protocol Commands
//!
//! Commands exchanged between an application's routing client and the
//! routing host over the local channel, and between peer applications for
//! direct local sends.
//!
//! ## Frame layout
//!
//! ```text
//! ┌────────┬─────────┬───────────┬──────────┬──────────────┐
//! │ id (1) │ ver (1) │ client(2) │ size (4) │ body (size)  │
//! └────────┴─────────┴───────────┴──────────┴──────────────┘
//! ```
//!
//! All integers are big-endian. `client` identifies the sender of the frame
//! (for `NotifyOne` it identifies the target client instead). The stream is
//! resynchronized only by reading exact frames; a frame that cannot be
//! decoded poisons the connection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, MalformedKind};
use crate::{
    ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, Result, ServiceId,
};

/// Version byte carried in every frame.
pub const COMMAND_VERSION: u8 = 0x01;

/// Size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest accepted frame body. Guards the stream decoder against absurd
/// length fields.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Supporting types
// ============================================================================

/// A (service, instance, major, minor) tuple as carried by offer/request
/// commands and routing-info entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceEntry {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub minor: MinorVersion,
}

/// Kind of a registered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// Plain event, no cached value.
    Event,
    /// Field: latest value is cached and replayed to new subscribers.
    Field,
}

impl EventKind {
    fn value(self) -> u8 {
        match self {
            EventKind::Event => 0,
            EventKind::Field => 1,
        }
    }

    fn parse(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(EventKind::Event),
            1 => Ok(EventKind::Field),
            _ => Err(Error::Malformed(MalformedKind::Command)),
        }
    }
}

/// One event registration inside a `RegisterEvents` command.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventRegistration {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub event: EventId,
    pub kind: EventKind,
    pub provided: bool,
    pub cyclic: bool,
    pub eventgroups: Vec<EventgroupId>,
}

/// Optional debounce filter attached to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DebounceFilter {
    pub interval_ms: u32,
    pub on_change: bool,
}

/// Type of a routing-info entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingEntryType {
    AddClient,
    DeleteClient,
    AddServiceInstance,
    DeleteServiceInstance,
}

impl RoutingEntryType {
    fn value(self) -> u8 {
        match self {
            RoutingEntryType::AddClient => 0,
            RoutingEntryType::DeleteClient => 1,
            RoutingEntryType::AddServiceInstance => 2,
            RoutingEntryType::DeleteServiceInstance => 3,
        }
    }

    fn parse(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(RoutingEntryType::AddClient),
            1 => Ok(RoutingEntryType::DeleteClient),
            2 => Ok(RoutingEntryType::AddServiceInstance),
            3 => Ok(RoutingEntryType::DeleteServiceInstance),
            _ => Err(Error::Malformed(MalformedKind::Command)),
        }
    }
}

/// One entry of a `RoutingInfo` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub entry_type: RoutingEntryType,
    pub client: ClientId,
    /// Peer endpoint for guest applications reachable over TCP loopback.
    pub endpoint: Option<SocketAddr>,
    pub services: Vec<ServiceEntry>,
}

// ============================================================================
// Commands
// ============================================================================

/// A routing-protocol command, decoded from or encoded into one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AssignClient {
        name: String,
    },
    AssignClientAck {
        assigned: ClientId,
    },
    RegisterApplication {
        /// Port of the application's local server endpoint.
        port: u16,
    },
    DeregisterApplication,
    RegisteredAck,
    Ping,
    Pong,
    OfferService(ServiceEntry),
    StopOfferService(ServiceEntry),
    RequestService {
        services: Vec<ServiceEntry>,
    },
    ReleaseService {
        service: ServiceId,
        instance: InstanceId,
    },
    RegisterEvents {
        registrations: Vec<EventRegistration>,
    },
    UnregisterEvent {
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        provided: bool,
    },
    Subscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event: EventId,
        pending_id: u16,
        filter: Option<DebounceFilter>,
    },
    Unsubscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        pending_id: u16,
    },
    SubscribeAck {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: ClientId,
        event: EventId,
        pending_id: u16,
    },
    SubscribeNack {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: ClientId,
        event: EventId,
        pending_id: u16,
    },
    UnsubscribeAck {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        pending_id: u16,
    },
    Expire {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        pending_id: u16,
    },
    /// Embedded SOME/IP message, request/response path.
    Send {
        instance: InstanceId,
        reliable: bool,
        status: u8,
        message: Bytes,
    },
    /// Embedded SOME/IP notification for all subscribers.
    Notify {
        instance: InstanceId,
        reliable: bool,
        status: u8,
        message: Bytes,
    },
    /// Embedded SOME/IP notification for the client in the frame header.
    NotifyOne {
        instance: InstanceId,
        reliable: bool,
        status: u8,
        message: Bytes,
    },
    RoutingInfo {
        entries: Vec<RoutingEntry>,
    },
    ResendProvidedEvents,
    Suspend,
    UpdateSecurityPolicy {
        update_id: u32,
        payload: Bytes,
    },
    RemoveSecurityPolicy {
        update_id: u32,
        payload: Bytes,
    },
    DistributeSecurityPolicies {
        payload: Bytes,
    },
    UpdateSecurityCredentials {
        payload: Bytes,
    },
}

impl Command {
    /// One-byte command id.
    pub fn id(&self) -> u8 {
        match self {
            Command::AssignClient { .. } => 0x01,
            Command::AssignClientAck { .. } => 0x02,
            Command::RegisterApplication { .. } => 0x03,
            Command::DeregisterApplication => 0x04,
            Command::RegisteredAck => 0x05,
            Command::Ping => 0x06,
            Command::Pong => 0x07,
            Command::OfferService(_) => 0x10,
            Command::StopOfferService(_) => 0x11,
            Command::RequestService { .. } => 0x12,
            Command::ReleaseService { .. } => 0x13,
            Command::RegisterEvents { .. } => 0x14,
            Command::UnregisterEvent { .. } => 0x15,
            Command::Subscribe { .. } => 0x16,
            Command::Unsubscribe { .. } => 0x17,
            Command::SubscribeAck { .. } => 0x18,
            Command::SubscribeNack { .. } => 0x19,
            Command::UnsubscribeAck { .. } => 0x1A,
            Command::Expire { .. } => 0x1B,
            Command::Send { .. } => 0x20,
            Command::Notify { .. } => 0x21,
            Command::NotifyOne { .. } => 0x22,
            Command::RoutingInfo { .. } => 0x30,
            Command::ResendProvidedEvents => 0x31,
            Command::Suspend => 0x32,
            Command::UpdateSecurityPolicy { .. } => 0x40,
            Command::RemoveSecurityPolicy { .. } => 0x41,
            Command::DistributeSecurityPolicies { .. } => 0x42,
            Command::UpdateSecurityCredentials { .. } => 0x43,
        }
    }

    /// Encode the command into a complete frame.
    pub fn encode(&self, client: ClientId) -> Bytes {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.put_u8(self.id());
        frame.put_u8(COMMAND_VERSION);
        frame.put_u16(client);
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        frame.freeze()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Command::AssignClient { name } => {
                buf.put_slice(name.as_bytes());
            }
            Command::AssignClientAck { assigned } => {
                buf.put_u16(*assigned);
            }
            Command::RegisterApplication { port } => {
                buf.put_u16(*port);
            }
            Command::DeregisterApplication
            | Command::RegisteredAck
            | Command::Ping
            | Command::Pong
            | Command::ResendProvidedEvents
            | Command::Suspend => {}
            Command::OfferService(entry) | Command::StopOfferService(entry) => {
                put_service_entry(buf, entry);
            }
            Command::RequestService { services } => {
                buf.put_u16(services.len() as u16);
                for entry in services {
                    put_service_entry(buf, entry);
                }
            }
            Command::ReleaseService { service, instance } => {
                buf.put_u16(*service);
                buf.put_u16(*instance);
            }
            Command::RegisterEvents { registrations } => {
                buf.put_u16(registrations.len() as u16);
                for reg in registrations {
                    buf.put_u16(reg.service);
                    buf.put_u16(reg.instance);
                    buf.put_u16(reg.event);
                    buf.put_u8(reg.kind.value());
                    buf.put_u8(u8::from(reg.provided));
                    buf.put_u8(u8::from(reg.cyclic));
                    buf.put_u16(reg.eventgroups.len() as u16);
                    for eventgroup in &reg.eventgroups {
                        buf.put_u16(*eventgroup);
                    }
                }
            }
            Command::UnregisterEvent {
                service,
                instance,
                event,
                provided,
            } => {
                buf.put_u16(*service);
                buf.put_u16(*instance);
                buf.put_u16(*event);
                buf.put_u8(u8::from(*provided));
            }
            Command::Subscribe {
                service,
                instance,
                eventgroup,
                major,
                event,
                pending_id,
                filter,
            } => {
                buf.put_u16(*service);
                buf.put_u16(*instance);
                buf.put_u16(*eventgroup);
                buf.put_u8(*major);
                buf.put_u16(*event);
                buf.put_u16(*pending_id);
                match filter {
                    Some(filter) => {
                        buf.put_u8(1);
                        buf.put_u32(filter.interval_ms);
                        buf.put_u8(u8::from(filter.on_change));
                    }
                    None => buf.put_u8(0),
                }
            }
            Command::Unsubscribe {
                service,
                instance,
                eventgroup,
                event,
                pending_id,
            }
            | Command::Expire {
                service,
                instance,
                eventgroup,
                event,
                pending_id,
            } => {
                buf.put_u16(*service);
                buf.put_u16(*instance);
                buf.put_u16(*eventgroup);
                buf.put_u16(*event);
                buf.put_u16(*pending_id);
            }
            Command::SubscribeAck {
                service,
                instance,
                eventgroup,
                subscriber,
                event,
                pending_id,
            }
            | Command::SubscribeNack {
                service,
                instance,
                eventgroup,
                subscriber,
                event,
                pending_id,
            } => {
                buf.put_u16(*service);
                buf.put_u16(*instance);
                buf.put_u16(*eventgroup);
                buf.put_u16(*subscriber);
                buf.put_u16(*event);
                buf.put_u16(*pending_id);
            }
            Command::UnsubscribeAck {
                service,
                instance,
                eventgroup,
                pending_id,
            } => {
                buf.put_u16(*service);
                buf.put_u16(*instance);
                buf.put_u16(*eventgroup);
                buf.put_u16(*pending_id);
            }
            Command::Send {
                instance,
                reliable,
                status,
                message,
            }
            | Command::Notify {
                instance,
                reliable,
                status,
                message,
            }
            | Command::NotifyOne {
                instance,
                reliable,
                status,
                message,
            } => {
                buf.put_u16(*instance);
                buf.put_u8(u8::from(*reliable));
                buf.put_u8(*status);
                buf.put_slice(message);
            }
            Command::RoutingInfo { entries } => {
                buf.put_u16(entries.len() as u16);
                for entry in entries {
                    buf.put_u8(entry.entry_type.value());
                    buf.put_u16(entry.client);
                    put_endpoint(buf, entry.endpoint);
                    buf.put_u16(entry.services.len() as u16);
                    for service in &entry.services {
                        put_service_entry(buf, service);
                    }
                }
            }
            Command::UpdateSecurityPolicy { update_id, payload }
            | Command::RemoveSecurityPolicy { update_id, payload } => {
                buf.put_u32(*update_id);
                buf.put_slice(payload);
            }
            Command::DistributeSecurityPolicies { payload }
            | Command::UpdateSecurityCredentials { payload } => {
                buf.put_slice(payload);
            }
        }
    }

    /// Decode a command from id + body.
    pub fn decode(id: u8, mut body: Bytes) -> Result<Self> {
        let buf = &mut body;
        let command = match id {
            0x01 => Command::AssignClient {
                name: String::from_utf8(buf.copy_to_bytes(buf.remaining()).to_vec())
                    .map_err(|_| Error::Malformed(MalformedKind::Command))?,
            },
            0x02 => Command::AssignClientAck {
                assigned: get_u16(buf)?,
            },
            0x03 => Command::RegisterApplication {
                port: get_u16(buf)?,
            },
            0x04 => Command::DeregisterApplication,
            0x05 => Command::RegisteredAck,
            0x06 => Command::Ping,
            0x07 => Command::Pong,
            0x10 => Command::OfferService(get_service_entry(buf)?),
            0x11 => Command::StopOfferService(get_service_entry(buf)?),
            0x12 => {
                let count = get_u16(buf)? as usize;
                let mut services = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    services.push(get_service_entry(buf)?);
                }
                Command::RequestService { services }
            }
            0x13 => Command::ReleaseService {
                service: get_u16(buf)?,
                instance: get_u16(buf)?,
            },
            0x14 => {
                let count = get_u16(buf)? as usize;
                let mut registrations = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    let service = get_u16(buf)?;
                    let instance = get_u16(buf)?;
                    let event = get_u16(buf)?;
                    let kind = EventKind::parse(get_u8(buf)?)?;
                    let provided = get_u8(buf)? != 0;
                    let cyclic = get_u8(buf)? != 0;
                    let eventgroup_count = get_u16(buf)? as usize;
                    let mut eventgroups = Vec::with_capacity(eventgroup_count.min(256));
                    for _ in 0..eventgroup_count {
                        eventgroups.push(get_u16(buf)?);
                    }
                    registrations.push(EventRegistration {
                        service,
                        instance,
                        event,
                        kind,
                        provided,
                        cyclic,
                        eventgroups,
                    });
                }
                Command::RegisterEvents { registrations }
            }
            0x15 => Command::UnregisterEvent {
                service: get_u16(buf)?,
                instance: get_u16(buf)?,
                event: get_u16(buf)?,
                provided: get_u8(buf)? != 0,
            },
            0x16 => {
                let service = get_u16(buf)?;
                let instance = get_u16(buf)?;
                let eventgroup = get_u16(buf)?;
                let major = get_u8(buf)?;
                let event = get_u16(buf)?;
                let pending_id = get_u16(buf)?;
                let filter = match get_u8(buf)? {
                    0 => None,
                    _ => Some(DebounceFilter {
                        interval_ms: get_u32(buf)?,
                        on_change: get_u8(buf)? != 0,
                    }),
                };
                Command::Subscribe {
                    service,
                    instance,
                    eventgroup,
                    major,
                    event,
                    pending_id,
                    filter,
                }
            }
            0x17 => Command::Unsubscribe {
                service: get_u16(buf)?,
                instance: get_u16(buf)?,
                eventgroup: get_u16(buf)?,
                event: get_u16(buf)?,
                pending_id: get_u16(buf)?,
            },
            0x18 => {
                let (service, instance, eventgroup, subscriber, event, pending_id) =
                    get_subscribe_ack_body(buf)?;
                Command::SubscribeAck {
                    service,
                    instance,
                    eventgroup,
                    subscriber,
                    event,
                    pending_id,
                }
            }
            0x19 => {
                let (service, instance, eventgroup, subscriber, event, pending_id) =
                    get_subscribe_ack_body(buf)?;
                Command::SubscribeNack {
                    service,
                    instance,
                    eventgroup,
                    subscriber,
                    event,
                    pending_id,
                }
            }
            0x1A => Command::UnsubscribeAck {
                service: get_u16(buf)?,
                instance: get_u16(buf)?,
                eventgroup: get_u16(buf)?,
                pending_id: get_u16(buf)?,
            },
            0x1B => Command::Expire {
                service: get_u16(buf)?,
                instance: get_u16(buf)?,
                eventgroup: get_u16(buf)?,
                event: get_u16(buf)?,
                pending_id: get_u16(buf)?,
            },
            0x20 | 0x21 | 0x22 => {
                let instance = get_u16(buf)?;
                let reliable = get_u8(buf)? != 0;
                let status = get_u8(buf)?;
                let message = buf.copy_to_bytes(buf.remaining());
                match id {
                    0x20 => Command::Send {
                        instance,
                        reliable,
                        status,
                        message,
                    },
                    0x21 => Command::Notify {
                        instance,
                        reliable,
                        status,
                        message,
                    },
                    _ => Command::NotifyOne {
                        instance,
                        reliable,
                        status,
                        message,
                    },
                }
            }
            0x30 => {
                let count = get_u16(buf)? as usize;
                let mut entries = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    let entry_type = RoutingEntryType::parse(get_u8(buf)?)?;
                    let client = get_u16(buf)?;
                    let endpoint = get_endpoint(buf)?;
                    let service_count = get_u16(buf)? as usize;
                    let mut services = Vec::with_capacity(service_count.min(256));
                    for _ in 0..service_count {
                        services.push(get_service_entry(buf)?);
                    }
                    entries.push(RoutingEntry {
                        entry_type,
                        client,
                        endpoint,
                        services,
                    });
                }
                Command::RoutingInfo { entries }
            }
            0x31 => Command::ResendProvidedEvents,
            0x32 => Command::Suspend,
            0x40 => Command::UpdateSecurityPolicy {
                update_id: get_u32(buf)?,
                payload: buf.copy_to_bytes(buf.remaining()),
            },
            0x41 => Command::RemoveSecurityPolicy {
                update_id: get_u32(buf)?,
                payload: buf.copy_to_bytes(buf.remaining()),
            },
            0x42 => Command::DistributeSecurityPolicies {
                payload: buf.copy_to_bytes(buf.remaining()),
            },
            0x43 => Command::UpdateSecurityCredentials {
                payload: buf.copy_to_bytes(buf.remaining()),
            },
            _ => return Err(Error::Malformed(MalformedKind::Command)),
        };
        Ok(command)
    }
}

// ============================================================================
// Frame decoding
// ============================================================================

/// A decoded frame: sender (or target, for `NotifyOne`) plus command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub client: ClientId,
    pub command: Command,
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame.
/// On success the consumed bytes are removed from `buf`.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let id = buf[0];
    if buf[1] != COMMAND_VERSION {
        return Err(Error::Malformed(MalformedKind::Command));
    }
    let client = u16::from_be_bytes([buf[2], buf[3]]);
    let size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if size > MAX_BODY_SIZE {
        return Err(Error::Malformed(MalformedKind::Command));
    }
    if buf.len() < FRAME_HEADER_SIZE + size {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_SIZE);
    let body = buf.split_to(size).freeze();
    let command = Command::decode(id, body)?;
    Ok(Some(Frame { client, command }))
}

// ============================================================================
// Body helpers
// ============================================================================

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::Malformed(MalformedKind::Command));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::Malformed(MalformedKind::Command));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::Malformed(MalformedKind::Command));
    }
    Ok(buf.get_u32())
}

fn put_service_entry(buf: &mut BytesMut, entry: &ServiceEntry) {
    buf.put_u16(entry.service);
    buf.put_u16(entry.instance);
    buf.put_u8(entry.major);
    buf.put_u32(entry.minor);
}

fn get_service_entry(buf: &mut Bytes) -> Result<ServiceEntry> {
    Ok(ServiceEntry {
        service: get_u16(buf)?,
        instance: get_u16(buf)?,
        major: get_u8(buf)?,
        minor: get_u32(buf)?,
    })
}

fn get_subscribe_ack_body(buf: &mut Bytes) -> Result<(u16, u16, u16, u16, u16, u16)> {
    Ok((
        get_u16(buf)?,
        get_u16(buf)?,
        get_u16(buf)?,
        get_u16(buf)?,
        get_u16(buf)?,
        get_u16(buf)?,
    ))
}

fn put_endpoint(buf: &mut BytesMut, endpoint: Option<SocketAddr>) {
    match endpoint {
        None => buf.put_u8(0),
        Some(SocketAddr::V4(v4)) => {
            buf.put_u8(4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        Some(SocketAddr::V6(v6)) => {
            buf.put_u8(6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
    }
}

fn get_endpoint(buf: &mut Bytes) -> Result<Option<SocketAddr>> {
    match get_u8(buf)? {
        0 => Ok(None),
        4 => {
            if buf.remaining() < 6 {
                return Err(Error::Malformed(MalformedKind::Command));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(octets)),
                port,
            )))
        }
        6 => {
            if buf.remaining() < 18 {
                return Err(Error::Malformed(MalformedKind::Command));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }
        _ => Err(Error::Malformed(MalformedKind::Command)),
    }
}

// ============================================================================
// Tests
// ============================================================================
