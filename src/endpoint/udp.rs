//! # UDP Server Endpoint
//!
//! One logical SOME/IP endpoint multiplexing a unicast socket and on-demand
//! multicast group sockets. Outbound traffic runs through per-target train
//! schedulers and send queues with TP separation timing; inbound datagrams
//! are framed, validated and (for TP segments) reassembled before delivery
//! to the host.
//!
//! ```text
//!            ┌───────────────────────────────────────────┐
//!   send_to ─▶ targets: { remote → trains + queue }      │
//!            │        │ dispatch task (one send at a time)│──▶ unicast socket
//!            │        ▼                                   │
//!            │  separation timing (TP segments)           │
//!            ├───────────────────────────────────────────┤
//!   unicast ─▶ framing ─ validation ─ TP reassembly ─▶ host.on_message
//!  multicast ─▶ same-subnet check ─ has_received marking │
//!            └───────────────────────────────────────────┘
//! ```
//!
//! Shutdown is a two-phase cancel: the unicast receiver and the multicast
//! receivers each acknowledge the stop, and the sockets are closed only
//! after both acknowledgements arrived (the multicast side is optional and
//! acknowledgements may arrive in either order). A requested restart then
//! re-runs `init`, re-issues every join and resumes receiving.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::endpoint::SendQueue;
use crate::error::{Error, Result};
use crate::net::{UdpOptions, UdpSocket};
use crate::tp::{self, TpReassembler};
use crate::train::TrainScheduler;
use crate::wire::{self, Header, MessageType};
use crate::{ClientId, MethodId, ServiceId, SessionId};

/// Receive buffer for one datagram.
const RECV_BUFFER_SIZE: usize = 65535;

/// Bytes of the service-discovery header following the SOME/IP header.
const SD_HEADER_MIN: usize = 12;

/// Client id carried by magic-cookie messages; never tracked.
const MAGIC_COOKIE_CLIENT: ClientId = 0xDEAD;

// ============================================================================
// Host interface
// ============================================================================

/// The routing host side of the endpoint. Implementations are referenced
/// weakly: the endpoint never keeps its host alive.
pub trait UdpHost: Send + Sync + 'static {
    /// A complete, validated SOME/IP message arrived.
    fn on_message(&self, message: Bytes, remote: SocketAddr, is_multicast: bool);

    /// A malformed-length datagram arrived for a non-SD service.
    fn on_error(&self, data: Bytes, remote: SocketAddr) {
        let _ = (data, remote);
    }

    /// One of our own multicast transmissions was received and
    /// `receive_own_multicast` is enabled.
    fn on_own_multicast(&self, message: Bytes) {
        let _ = message;
    }
}

// ============================================================================
// Shutdown FSM
// ============================================================================

/// Two-phase shutdown of the unicast/multicast socket pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Idle,
    WaitingFirstCancel,
    WaitingUnicastCancel,
    WaitingMulticastCancel,
}

/// Advance the FSM on one cancel acknowledgement. Returns the next state
/// and whether both sides have now drained (sockets may be closed).
fn advance_shutdown(
    state: ShutdownState,
    has_multicast: bool,
    is_unicast: bool,
) -> (ShutdownState, bool) {
    match state {
        ShutdownState::WaitingFirstCancel if !has_multicast => {
            if is_unicast {
                (ShutdownState::Idle, true)
            } else {
                (state, false)
            }
        }
        ShutdownState::WaitingFirstCancel => {
            if is_unicast {
                (ShutdownState::WaitingMulticastCancel, false)
            } else {
                (ShutdownState::WaitingUnicastCancel, false)
            }
        }
        ShutdownState::WaitingUnicastCancel => {
            if is_unicast {
                (ShutdownState::Idle, true)
            } else {
                (state, false)
            }
        }
        ShutdownState::WaitingMulticastCancel => {
            if !is_unicast {
                (ShutdownState::Idle, true)
            } else {
                (state, false)
            }
        }
        ShutdownState::Idle => {
            warn!("udp: spurious cancel acknowledgement while idle");
            (ShutdownState::Idle, false)
        }
    }
}

// ============================================================================
// Inbound framing and validation
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InboundAction {
    /// Deliver a complete message to the host.
    Deliver(Bytes),
    /// Echo the truncated head of a wrong-protocol-version message back to
    /// the sender.
    ErrorEcho(Bytes),
    /// Hand a malformed-length buffer to the host error handler.
    HostError(Bytes),
}

/// Inbound state shared between the receive paths.
#[derive(Debug)]
pub(crate) struct InboundState {
    clients: HashMap<(ServiceId, MethodId, ClientId), HashMap<SessionId, SocketAddr>>,
    reassembler: TpReassembler,
}

impl InboundState {
    fn new(config: &Config) -> Self {
        Self {
            clients: HashMap::new(),
            reassembler: TpReassembler::new(
                config.max_message_size * 64,
                config.tp_reassembly_timeout,
            ),
        }
    }

    fn track_client(&mut self, header: &Header, remote: SocketAddr) {
        if header.client == MAGIC_COOKIE_CLIENT {
            return;
        }
        self.clients
            .entry((header.service, header.method, header.client))
            .or_default()
            .insert(header.session, remote);
    }

    fn take_client(&mut self, data: &[u8]) -> Option<SocketAddr> {
        let (service, method) = wire::peek_service_method(data)?;
        let (client, session) = wire::peek_client_session(data)?;
        let sessions = self.clients.get_mut(&(service, method, client))?;
        let remote = sessions.remove(&session);
        if remote.is_none() {
            warn!(
                "udp: no tracked session {:04x} for client {:04x} and [{:04x}.{:04x}]",
                session, client, service, method
            );
        }
        remote
    }
}

/// Frame one received datagram into SOME/IP messages, validating each
/// against the protocol rules. Mutates client tracking and TP reassembly
/// state; returns the deliveries and error reactions in order.
pub(crate) fn process_datagram(
    state: &mut InboundState,
    config: &Config,
    local_port: u16,
    data: &[u8],
    remote: SocketAddr,
    now: Instant,
) -> Vec<InboundAction> {
    let mut actions = Vec::new();
    let mut i = 0usize;

    while i < data.len() {
        let remaining = data.len() - i;
        let declared = wire::declared_message_size(&data[i..]);
        let size = declared.unwrap_or(0);

        if size <= wire::HEADER_SIZE || size > remaining {
            // bad length field: non-SD services get the host error handler
            match wire::peek_service_method(&data[i..]) {
                Some((service, _)) if service != wire::SD_SERVICE => {
                    if declared.is_none() || size == 8 {
                        error!(
                            "udp: ignoring message with unusable length field from {}",
                            remote
                        );
                    } else {
                        actions.push(InboundAction::HostError(Bytes::copy_from_slice(&data[i..])));
                    }
                }
                _ => {
                    error!("udp: received message with bad length field from {}", remote);
                }
            }
            break;
        }

        let message = &data[i..i + size];
        let header = match Header::parse(message) {
            Some(header) => header,
            None => break,
        };

        if header.protocol_version != wire::PROTOCOL_VERSION {
            error!(
                "udp: wrong protocol version 0x{:02x} from {}",
                header.protocol_version, remote
            );
            // echo the truncated head so the peer observes the rejection
            let echo = message.len().min(wire::HEADER_SIZE + 8);
            actions.push(InboundAction::ErrorEcho(Bytes::copy_from_slice(
                &message[..echo],
            )));
            break;
        }
        let Some(message_type) = MessageType::parse(header.message_type_raw) else {
            error!(
                "udp: invalid message type 0x{:02x} from {}",
                header.message_type_raw, remote
            );
            break;
        };
        if !wire::is_valid_return_code(header.return_code) {
            error!(
                "udp: invalid return code 0x{:02x} from {}",
                header.return_code, remote
            );
            break;
        }
        if header.is_tp() && local_port == config.sd_port {
            warn!("udp: received a SOME/IP-TP message on the SD port from {}", remote);
            break;
        }

        if message_type.is_request() {
            state.track_client(&header, remote);
        }

        if header.is_tp() {
            if !config.tp_enabled(header.service, header.method) {
                warn!(
                    "udp: TP message for [{:04x}.{:04x}] which is not configured for TP",
                    header.service, header.method
                );
                break;
            }
            if let Some(complete) = state.reassembler.feed(remote, message, now) {
                if let Some(complete_header) = Header::parse(&complete) {
                    if complete_header
                        .message_type()
                        .is_some_and(MessageType::is_request)
                    {
                        state.track_client(&complete_header, remote);
                    }
                }
                actions.push(InboundAction::Deliver(complete));
            }
        } else if header.service == wire::SD_SERVICE {
            let closes_datagram = size >= remaining;
            let has_sd_header = size >= wire::HEADER_SIZE + SD_HEADER_MIN;
            if closes_datagram && (local_port != config.sd_port || has_sd_header) {
                actions.push(InboundAction::Deliver(Bytes::copy_from_slice(message)));
            } else {
                error!(
                    "udp: dropping service-discovery message with too short length from {}",
                    remote
                );
            }
        } else {
            actions.push(InboundAction::Deliver(Bytes::copy_from_slice(message)));
        }

        i += size;
    }

    actions
}

// ============================================================================
// Endpoint
// ============================================================================

#[derive(Debug)]
struct Target {
    scheduler: TrainScheduler,
    queue: SendQueue,
    is_sending: bool,
}

impl Target {
    fn new(config: &Config, now: Instant) -> Self {
        Self {
            scheduler: TrainScheduler::new(config.max_message_size, now),
            queue: SendQueue::new(config.endpoint_queue_limit),
            is_sending: false,
        }
    }
}

#[derive(Debug)]
struct JoinedGroup {
    has_received: bool,
    generation: u64,
    /// Wakes the group's receiver on an explicit leave; dropping the
    /// receiver's socket is what leaves the group at the kernel.
    cancel: Arc<Notify>,
}

struct Shared {
    targets: HashMap<SocketAddr, Target>,
    inbound: InboundState,
    joined: HashMap<IpAddr, JoinedGroup>,
    sending_blocked: bool,
    stopped: bool,
    restart_requested: bool,
    shutdown: ShutdownState,
    /// Snapshot of "was a multicast receiver active" taken at stop time.
    stop_has_multicast: bool,
    /// Multicast receivers still running; the last one to exit acknowledges
    /// the multicast cancel.
    active_multicast: usize,
    /// Reference clock for TP separation timing.
    last_sent: Option<Instant>,
    generation: u64,
}

struct Inner<U: UdpSocket> {
    config: Arc<Config>,
    host: Weak<dyn UdpHost>,
    shared: Mutex<Shared>,
    unicast: Mutex<Option<Arc<U>>>,
    notify: Notify,
    stop_tx: watch::Sender<u64>,
}

/// Handle to a running UDP server endpoint.
pub struct UdpServerEndpoint<U: UdpSocket = tokio::net::UdpSocket> {
    inner: Arc<Inner<U>>,
}

impl<U: UdpSocket> Clone for UdpServerEndpoint<U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<U: UdpSocket> UdpServerEndpoint<U> {
    /// Open the unicast socket and start receiving.
    pub async fn start(config: Arc<Config>, host: Weak<dyn UdpHost>) -> Result<Self> {
        let (stop_tx, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                targets: HashMap::new(),
                inbound: InboundState::new(&config),
                joined: HashMap::new(),
                sending_blocked: false,
                stopped: false,
                restart_requested: false,
                shutdown: ShutdownState::Idle,
                stop_has_multicast: false,
                active_multicast: 0,
                last_sent: None,
                generation: 0,
            }),
            unicast: Mutex::new(None),
            config,
            host,
            notify: Notify::new(),
            stop_tx,
        });

        init(&inner).await?;
        spawn_unicast_receiver(&inner);

        let dispatch_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            dispatch_loop(dispatch_inner).await;
        });
        let cleanup_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            tp_cleanup_loop(cleanup_inner).await;
        });

        Ok(Self { inner })
    }

    /// Queue a message for `target` through the train scheduler, segmenting
    /// oversized messages when TP is enabled for the method.
    pub fn send_to(&self, target: SocketAddr, data: &[u8]) -> bool {
        let accepted = self.send_intern(target, data);
        if accepted {
            self.inner.notify.notify_one();
        }
        accepted
    }

    /// Route a local provider's response back to the tracked requester.
    pub fn send(&self, data: &[u8]) -> bool {
        let target = {
            let mut shared = self.inner.shared.lock().expect("udp lock");
            if shared.sending_blocked {
                return false;
            }
            shared.inbound.take_client(data)
        };
        match target {
            Some(target) => self.send_to(target, data),
            None => false,
        }
    }

    /// Queue a raw error reply, bypassing train scheduling.
    pub fn send_error(&self, target: SocketAddr, data: Bytes) -> bool {
        {
            let mut shared = self.inner.shared.lock().expect("udp lock");
            if shared.sending_blocked || data.len() > self.inner.config.max_message_size {
                return false;
            }
            let now = Instant::now();
            let config = &self.inner.config;
            let target_state = shared
                .targets
                .entry(target)
                .or_insert_with(|| Target::new(config, now));
            if !target_state.queue.check_limit(data.len()) {
                warn!("udp: queue limit reached, dropping error reply to {}", target);
                return false;
            }
            target_state.queue.push(data, 0);
        }
        self.inner.notify.notify_one();
        true
    }

    fn send_intern(&self, target: SocketAddr, data: &[u8]) -> bool {
        let mut shared = self.inner.shared.lock().expect("udp lock");
        if shared.sending_blocked {
            return false;
        }

        let Some((service, method)) = wire::peek_service_method(data) else {
            return false;
        };
        let config = &self.inner.config;
        let timing = config.timing(service, method);
        let now = Instant::now();

        let target_state = shared
            .targets
            .entry(target)
            .or_insert_with(|| Target::new(config, now));

        if !target_state.queue.check_limit(data.len()) {
            let (client, session) = wire::peek_client_session(data).unwrap_or((0, 0));
            warn!(
                "udp: queue limit reached, dropping ({:04x}): [{:04x}.{:04x}.{:04x}] to {}",
                client, service, method, session, target
            );
            return false;
        }

        if data.len() > config.max_message_size {
            let Some(tp_config) = config.tp_method(service, method) else {
                error!(
                    "udp: dropping too-big message ({} bytes, maximum {})",
                    data.len(),
                    config.max_message_size
                );
                return false;
            };
            let segments = tp::split_message(data, tp_config.max_segment_length);
            if segments.is_empty() {
                return false;
            }
            target_state.scheduler.prepare_segments(timing, now);
            for segment in segments {
                target_state
                    .queue
                    .push(segment, tp_config.separation_time_us);
            }
            return true;
        }

        target_state
            .scheduler
            .enqueue(data, service, method, timing, now);
        true
    }

    /// Join a multicast group; the local address (v4) or scope id (v6)
    /// selects the interface. Re-joins silently when the group was joined
    /// but no datagram was observed yet.
    pub fn join(&self, group: IpAddr) {
        let rejoin = {
            let shared = self.inner.shared.lock().expect("udp lock");
            match shared.joined.get(&group) {
                Some(state) if state.has_received => return,
                Some(_) => true,
                None => false,
            }
        };
        if rejoin {
            self.leave(group);
        }

        info!(
            "udp: joining multicast group {} from {}",
            group, self.inner.config.unicast
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = join_group(&inner, group).await {
                error!("udp: joining {} failed: {}", group, e);
            }
        });
    }

    /// Leave a multicast group.
    pub fn leave(&self, group: IpAddr) {
        let removed = {
            let mut shared = self.inner.shared.lock().expect("udp lock");
            shared.joined.remove(&group)
        };
        if let Some(state) = removed {
            info!("udp: leaving multicast group {}", group);
            state.cancel.notify_one();
        }
    }

    /// Whether a join was issued for `group`, and whether a datagram was
    /// observed on it since.
    pub fn is_joined(&self, group: IpAddr) -> (bool, bool) {
        let shared = self.inner.shared.lock().expect("udp lock");
        match shared.joined.get(&group) {
            Some(state) => (true, state.has_received),
            None => (false, false),
        }
    }

    /// Whether any multicast group is joined.
    pub fn is_joining(&self) -> bool {
        !self.inner.shared.lock().expect("udp lock").joined.is_empty()
    }

    /// Sum of queued bytes over all targets.
    pub fn queue_bytes(&self) -> usize {
        let shared = self.inner.shared.lock().expect("udp lock");
        shared.targets.values().map(|t| t.queue.bytes()).sum()
    }

    /// Begin the two-phase shutdown. Idempotent; sockets close only after
    /// both receive sides acknowledged the cancel.
    pub fn stop(&self) {
        {
            let mut shared = self.inner.shared.lock().expect("udp lock");
            if shared.stopped {
                return;
            }
            shared.stopped = true;
            shared.sending_blocked = true;
            shared.shutdown = ShutdownState::WaitingFirstCancel;
            shared.stop_has_multicast = shared.active_multicast > 0;
            shared.generation += 1;
            for group in shared.joined.values_mut() {
                group.has_received = false;
            }
            shared.inbound.reassembler.clear();
        }
        self.inner.stop_tx.send_modify(|epoch| *epoch += 1);
        self.inner.notify.notify_one();
    }

    /// Stop and, once both sockets drained, re-run `init`, re-issue the
    /// outstanding joins and resume receiving.
    pub fn restart(&self) {
        {
            let mut shared = self.inner.shared.lock().expect("udp lock");
            shared.restart_requested = true;
        }
        self.stop();
    }

    /// Whether the endpoint is stopped.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.lock().expect("udp lock").stopped
    }

    /// Local address of the unicast socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let unicast = self.inner.unicast.lock().expect("udp socket lock");
        unicast.as_ref().and_then(|socket| socket.local_addr().ok())
    }
}

// ============================================================================
// Socket setup
// ============================================================================

fn udp_options(config: &Config) -> UdpOptions {
    let mut options = UdpOptions {
        reuse_address: true,
        broadcast: true,
        receive_buffer_size: Some(config.udp_receive_buffer_size),
        device: config.device.clone(),
        multicast_interface_v4: None,
        multicast_interface_v6: None,
    };
    match config.unicast {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => {
            options.multicast_interface_v4 = Some(*v4.ip());
        }
        SocketAddr::V6(v6) if v6.scope_id() != 0 => {
            options.multicast_interface_v6 = Some(v6.scope_id());
        }
        _ => {}
    }
    options
}

async fn init<U: UdpSocket>(inner: &Arc<Inner<U>>) -> Result<()> {
    let options = udp_options(&inner.config);
    let socket = U::bind_with(inner.config.unicast, &options)
        .await
        .map_err(Error::TransportFailed)?;
    *inner.unicast.lock().expect("udp socket lock") = Some(Arc::new(socket));
    Ok(())
}

fn spawn_unicast_receiver<U: UdpSocket>(inner: &Arc<Inner<U>>) {
    let socket = {
        let unicast = inner.unicast.lock().expect("udp socket lock");
        match unicast.as_ref() {
            Some(socket) => Arc::clone(socket),
            None => return,
        }
    };
    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        unicast_receive_loop(task_inner, socket).await;
    });
}

fn join_group<U: UdpSocket>(
    inner: &Arc<Inner<U>>,
    group: IpAddr,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
    Box::pin(join_group_inner(inner, group))
}

async fn join_group_inner<U: UdpSocket>(inner: &Arc<Inner<U>>, group: IpAddr) -> Result<()> {
    let config = &inner.config;
    let local_port = config.unicast.port();
    let bind_addr: SocketAddr = match group {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), local_port),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), local_port),
    };
    let options = UdpOptions {
        reuse_address: true,
        broadcast: false,
        receive_buffer_size: Some(config.udp_receive_buffer_size),
        device: config.device.clone(),
        multicast_interface_v4: None,
        multicast_interface_v6: None,
    };
    let socket = U::bind_with(bind_addr, &options)
        .await
        .map_err(Error::TransportFailed)?;

    match (group, config.unicast) {
        (IpAddr::V4(multiaddr), SocketAddr::V4(local)) => socket
            .join_multicast_v4(multiaddr, *local.ip())
            .map_err(Error::TransportFailed)?,
        (IpAddr::V6(multiaddr), SocketAddr::V6(local)) => socket
            .join_multicast_v6(multiaddr, local.scope_id())
            .map_err(Error::TransportFailed)?,
        _ => return Err(Error::TransportFailed(std::io::Error::other(
            "multicast group family does not match the local endpoint",
        ))),
    }

    let cancel = Arc::new(Notify::new());
    let generation = {
        let mut shared = inner.shared.lock().expect("udp lock");
        if shared.stopped {
            return Err(Error::Canceled);
        }
        let current_generation = shared.generation;
        shared.joined.insert(
            group,
            JoinedGroup {
                has_received: false,
                generation: current_generation,
                cancel: Arc::clone(&cancel),
            },
        );
        shared.active_multicast += 1;
        shared.generation
    };

    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        multicast_receive_loop(task_inner, Arc::new(socket), group, generation, cancel).await;
    });
    Ok(())
}

// ============================================================================
// Receive paths
// ============================================================================

fn deliver_actions<U: UdpSocket>(
    inner: &Arc<Inner<U>>,
    endpoint: &UdpServerEndpoint<U>,
    actions: Vec<InboundAction>,
    remote: SocketAddr,
    is_multicast: bool,
) {
    let host = inner.host.upgrade();
    for action in actions {
        match action {
            InboundAction::Deliver(message) => {
                if let Some(host) = &host {
                    host.on_message(message, remote, is_multicast);
                }
            }
            InboundAction::ErrorEcho(data) => {
                endpoint.send_error(remote, data);
            }
            InboundAction::HostError(data) => {
                if let Some(host) = &host {
                    host.on_error(data, remote);
                }
            }
        }
    }
}

async fn unicast_receive_loop<U: UdpSocket>(inner: Arc<Inner<U>>, socket: Arc<U>) {
    let endpoint = UdpServerEndpoint {
        inner: Arc::clone(&inner),
    };
    let local_port = socket
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or(inner.config.unicast.port());
    let mut stop_rx = inner.stop_tx.subscribe();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, remote)) => {
                        let actions = {
                            let mut shared = inner.shared.lock().expect("udp lock");
                            if shared.stopped {
                                break;
                            }
                            process_datagram(
                                &mut shared.inbound,
                                &inner.config,
                                local_port,
                                &buf[..len],
                                remote,
                                Instant::now(),
                            )
                        };
                        deliver_actions(&inner, &endpoint, actions, remote, false);
                    }
                    Err(e) => {
                        let stopped = inner.shared.lock().expect("udp lock").stopped;
                        if stopped {
                            break;
                        }
                        warn!("udp: unicast receive failed: {}", e);
                    }
                }
            }
            _ = stop_rx.changed() => break,
        }
    }

    drop(socket);
    shutdown_and_close(&inner, true).await;
}

async fn multicast_receive_loop<U: UdpSocket>(
    inner: Arc<Inner<U>>,
    socket: Arc<U>,
    group: IpAddr,
    generation: u64,
    cancel: Arc<Notify>,
) {
    let endpoint = UdpServerEndpoint {
        inner: Arc::clone(&inner),
    };
    let local_ip = inner.config.unicast.ip();
    let local_port = inner.config.unicast.port();
    let mut stop_rx = inner.stop_tx.subscribe();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut report_cancel = false;

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, remote)) => {
                        let actions = {
                            let mut shared = inner.shared.lock().expect("udp lock");
                            if shared.stopped {
                                report_cancel = true;
                                break;
                            }
                            // a leave or rejoin replaced this receiver
                            let current = shared
                                .joined
                                .get(&group)
                                .is_some_and(|g| g.generation == generation);
                            if !current {
                                break;
                            }

                            if remote.ip() == local_ip {
                                if inner.config.receive_own_multicast {
                                    if let Some(host) = inner.host.upgrade() {
                                        host.on_own_multicast(Bytes::copy_from_slice(&buf[..len]));
                                    }
                                }
                                continue;
                            }
                            if !inner.config.is_same_subnet(local_ip, remote.ip()) {
                                debug!(
                                    "udp: ignoring multicast from {} outside the local subnet",
                                    remote
                                );
                                continue;
                            }
                            if let Some(joined) = shared.joined.get_mut(&group) {
                                joined.has_received = true;
                            }
                            process_datagram(
                                &mut shared.inbound,
                                &inner.config,
                                local_port,
                                &buf[..len],
                                remote,
                                Instant::now(),
                            )
                        };
                        deliver_actions(&inner, &endpoint, actions, remote, true);
                    }
                    Err(e) => {
                        let mut shared = inner.shared.lock().expect("udp lock");
                        if shared.stopped {
                            report_cancel = true;
                            break;
                        }
                        let current = shared
                            .joined
                            .get(&group)
                            .is_some_and(|g| g.generation == generation);
                        if !current {
                            break;
                        }
                        drop(shared);
                        warn!("udp: multicast receive on {} failed: {}", group, e);
                    }
                }
            }
            _ = stop_rx.changed() => {
                report_cancel = true;
                break;
            }
            () = cancel.notified() => break,
        }
    }

    drop(socket);
    let last = {
        let mut shared = inner.shared.lock().expect("udp lock");
        shared.active_multicast = shared.active_multicast.saturating_sub(1);
        shared.active_multicast == 0
    };
    if report_cancel && last {
        shutdown_and_close(&inner, false).await;
    }
}

/// Acknowledge a cancelled receive side; when both sides have drained,
/// close the sockets and perform a pending restart.
async fn shutdown_and_close<U: UdpSocket>(inner: &Arc<Inner<U>>, is_unicast: bool) {
    let close = {
        let mut shared = inner.shared.lock().expect("udp lock");
        let (next, close) =
            advance_shutdown(shared.shutdown, shared.stop_has_multicast, is_unicast);
        shared.shutdown = next;
        close
    };
    if !close {
        return;
    }

    *inner.unicast.lock().expect("udp socket lock") = None;
    debug!("udp: sockets closed");

    let restart = {
        let mut shared = inner.shared.lock().expect("udp lock");
        std::mem::take(&mut shared.restart_requested)
    };
    if !restart {
        inner.notify.notify_one();
        return;
    }

    info!("udp: restarting endpoint on {}", inner.config.unicast);
    if let Err(e) = init(inner).await {
        error!("udp: restart failed: {}", e);
        return;
    }

    let groups: Vec<IpAddr> = {
        let mut shared = inner.shared.lock().expect("udp lock");
        shared.stopped = false;
        shared.sending_blocked = false;
        shared.shutdown = ShutdownState::Idle;
        let groups = shared.joined.keys().copied().collect();
        shared.joined.clear();
        groups
    };

    spawn_unicast_receiver(inner);
    for group in groups {
        info!("udp: re-joining multicast group {}", group);
        if let Err(e) = join_group(inner, group).await {
            error!("udp: re-joining {} failed: {}", group, e);
        }
    }
    inner.notify.notify_one();
}

// ============================================================================
// Dispatch path
// ============================================================================

async fn dispatch_loop<U: UdpSocket>(inner: Arc<Inner<U>>) {
    loop {
        // move due trains into the queues, then pick one target with work
        let (pending, deadline) = {
            let mut shared = inner.shared.lock().expect("udp lock");
            if shared.stopped {
                if shared.shutdown == ShutdownState::Idle && !shared.restart_requested {
                    break;
                }
                (None, None)
            } else {
                let now = Instant::now();
                let mut deadline: Option<Instant> = None;
                let mut pending = None;
                for (addr, target) in shared.targets.iter_mut() {
                    while let Some(buffer) = target.scheduler.flush(now) {
                        target.queue.push(buffer, 0);
                    }
                    if let Some(next) = target.scheduler.next_departure() {
                        deadline = Some(deadline.map_or(next, |d: Instant| d.min(next)));
                    }
                    if pending.is_none() && !target.is_sending {
                        if let Some(entry) = target.queue.front() {
                            target.is_sending = true;
                            pending = Some((*addr, entry.clone()));
                        }
                    }
                }
                (pending, deadline)
            }
        };

        let Some((target, entry)) = pending else {
            tokio::select! {
                () = inner.notify.notified() => {}
                () = wait_deadline(deadline) => {}
            }
            continue;
        };

        // TP separation: space segment transmissions apart
        if entry.separation_time_us > 0 {
            let wait = {
                let shared = inner.shared.lock().expect("udp lock");
                shared.last_sent.map(|last| {
                    let separation =
                        std::time::Duration::from_micros(u64::from(entry.separation_time_us));
                    separation.saturating_sub(last.elapsed())
                })
            };
            if let Some(wait) = wait {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            inner.shared.lock().expect("udp lock").last_sent = Some(Instant::now());
        } else {
            inner.shared.lock().expect("udp lock").last_sent = None;
        }

        let socket = {
            let unicast = inner.unicast.lock().expect("udp socket lock");
            unicast.as_ref().map(Arc::clone)
        };
        let result = match socket {
            Some(socket) => socket.send_to(&entry.buffer, target).await.map(|_| ()),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        };

        let mut shared = inner.shared.lock().expect("udp lock");
        match result {
            Ok(()) => {
                if let Some(target_state) = shared.targets.get_mut(&target) {
                    target_state.queue.pop();
                    target_state.is_sending = false;
                    target_state.scheduler.record_departure(Instant::now());
                }
            }
            Err(e) => {
                if !shared.stopped {
                    warn!(
                        "udp: send to {} failed: {}, dropping its {} queued bytes",
                        target,
                        e,
                        shared
                            .targets
                            .get(&target)
                            .map(|t| t.queue.bytes())
                            .unwrap_or(0)
                    );
                }
                shared.targets.remove(&target);
            }
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Periodically evict stale TP reassembly contexts. Eviction is silent
/// apart from a debug line with the count.
async fn tp_cleanup_loop<U: UdpSocket>(inner: Arc<Inner<U>>) {
    let period = inner.config.tp_reassembly_timeout;
    loop {
        tokio::time::sleep(period).await;
        let mut shared = inner.shared.lock().expect("udp lock");
        if shared.stopped {
            if shared.shutdown == ShutdownState::Idle && !shared.restart_requested {
                break;
            }
            continue;
        }
        let evicted = shared.inbound.reassembler.cleanup(Instant::now());
        if evicted > 0 {
            debug!("udp: evicted {} stale TP reassembly contexts", evicted);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn remote() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    fn build_message(
        service: ServiceId,
        method: MethodId,
        payload: &[u8],
        protocol_version: u8,
        message_type: u8,
        return_code: u8,
    ) -> BytesMut {
        let header = Header {
            service,
            method,
            length: (8 + payload.len()) as u32,
            client: 0x0101,
            session: 0x0001,
            protocol_version,
            interface_version: 0x01,
            message_type_raw: message_type,
            return_code,
        };
        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        buf.put_slice(payload);
        buf
    }

    fn inbound_state(config: &Config) -> InboundState {
        InboundState::new(config)
    }

    #[test_log::test(tokio::test)]
    async fn valid_message_delivered() {
        let config = Config::default();
        let mut state = inbound_state(&config);
        let message = build_message(0x1234, 0x0001, b"data", wire::PROTOCOL_VERSION, 0x00, 0x00);

        let actions = process_datagram(
            &mut state,
            &config,
            30509,
            &message,
            remote(),
            Instant::now(),
        );
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], InboundAction::Deliver(_)));
    }

    #[test_log::test(tokio::test)]
    async fn wrong_protocol_version_echoes_truncated_head() {
        let config = Config::default();
        let mut state = inbound_state(&config);
        // valid header apart from the version byte, 8 payload bytes
        let message = build_message(0x1234, 0x0001, &[0u8; 8], 0x02, 0x00, 0x00);

        let actions = process_datagram(
            &mut state,
            &config,
            30509,
            &message,
            remote(),
            Instant::now(),
        );
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            InboundAction::ErrorEcho(echo) => assert_eq!(echo.len(), 24),
            other => panic!("expected error echo, got {:?}", other),
        }
    }

    #[test_log::test(tokio::test)]
    async fn invalid_message_type_dropped() {
        let config = Config::default();
        let mut state = inbound_state(&config);
        let message = build_message(0x1234, 0x0001, b"x", wire::PROTOCOL_VERSION, 0x55, 0x00);

        let actions = process_datagram(
            &mut state,
            &config,
            30509,
            &message,
            remote(),
            Instant::now(),
        );
        assert!(actions.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn invalid_return_code_dropped() {
        let config = Config::default();
        let mut state = inbound_state(&config);
        let message = build_message(0x1234, 0x0001, b"x", wire::PROTOCOL_VERSION, 0x00, 0x7F);

        let actions = process_datagram(
            &mut state,
            &config,
            30509,
            &message,
            remote(),
            Instant::now(),
        );
        assert!(actions.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn tp_on_sd_port_rejected() {
        let config = Config::builder()
            .tp_method(0x1234, 0x0001, 1392, 0)
            .build();
        let mut state = inbound_state(&config);
        let mut message =
            build_message(0x1234, 0x0001, &[0u8; 20], wire::PROTOCOL_VERSION, 0x20, 0x00);
        // tp word
        message[wire::MESSAGE_TYPE_POS] = 0x20;

        let actions = process_datagram(
            &mut state,
            &config,
            config.sd_port,
            &message,
            remote(),
            Instant::now(),
        );
        assert!(actions.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn tp_for_unconfigured_method_dropped() {
        let config = Config::default();
        let mut state = inbound_state(&config);
        let message =
            build_message(0x1234, 0x0001, &[0u8; 20], wire::PROTOCOL_VERSION, 0x20, 0x00);

        let actions = process_datagram(
            &mut state,
            &config,
            30509,
            &message,
            remote(),
            Instant::now(),
        );
        assert!(actions.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn tp_segments_reassembled_and_delivered() {
        let config = Config::builder()
            .tp_method(0x1234, 0x0001, 1392, 0)
            .build();
        let mut state = inbound_state(&config);

        let original = build_message(
            0x1234,
            0x0001,
            &vec![7u8; 3000],
            wire::PROTOCOL_VERSION,
            0x00,
            0x00,
        );
        let segments = tp::split_message(&original, 1392);
        assert!(segments.len() > 1);

        let now = Instant::now();
        let mut delivered = Vec::new();
        for segment in &segments {
            delivered.extend(process_datagram(
                &mut state, &config, 30509, segment, remote(), now,
            ));
        }
        assert_eq!(delivered.len(), 1);
        match &delivered[0] {
            InboundAction::Deliver(message) => assert_eq!(&message[..], &original[..]),
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test_log::test(tokio::test)]
    async fn back_to_back_messages_framed() {
        let config = Config::default();
        let mut state = inbound_state(&config);
        let mut datagram = BytesMut::new();
        datagram.extend_from_slice(&build_message(
            0x1234,
            0x0001,
            b"aa",
            wire::PROTOCOL_VERSION,
            0x00,
            0x00,
        ));
        datagram.extend_from_slice(&build_message(
            0x1234,
            0x0002,
            b"bbbb",
            wire::PROTOCOL_VERSION,
            0x02,
            0x00,
        ));

        let actions = process_datagram(
            &mut state,
            &config,
            30509,
            &datagram,
            remote(),
            Instant::now(),
        );
        assert_eq!(actions.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn truncated_message_reaches_host_error_handler() {
        let config = Config::default();
        let mut state = inbound_state(&config);
        // declared length larger than the datagram
        let mut message = build_message(0x1234, 0x0001, b"aa", wire::PROTOCOL_VERSION, 0x00, 0x00);
        message[wire::LENGTH_POS..wire::LENGTH_POS + 4].copy_from_slice(&1000u32.to_be_bytes());

        let actions = process_datagram(
            &mut state,
            &config,
            30509,
            &message,
            remote(),
            Instant::now(),
        );
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], InboundAction::HostError(_)));
    }

    #[test_log::test(tokio::test)]
    async fn short_sd_message_dropped_on_sd_port() {
        let config = Config::default();
        let mut state = inbound_state(&config);
        // SD message with a 4-byte body, shorter than the SD header
        let message = build_message(
            wire::SD_SERVICE,
            wire::SD_METHOD,
            &[0u8; 4],
            wire::PROTOCOL_VERSION,
            0x02,
            0x00,
        );

        let actions = process_datagram(
            &mut state,
            &config,
            config.sd_port,
            &message,
            remote(),
            Instant::now(),
        );
        assert!(actions.is_empty());

        // ... but tolerated on a non-SD port
        let actions = process_datagram(
            &mut state,
            &config,
            30509,
            &message,
            remote(),
            Instant::now(),
        );
        assert_eq!(actions.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn request_clients_tracked_and_consumed() {
        let config = Config::default();
        let mut state = inbound_state(&config);
        let request = build_message(0x1234, 0x0001, b"rq", wire::PROTOCOL_VERSION, 0x00, 0x00);

        process_datagram(
            &mut state,
            &config,
            30509,
            &request,
            remote(),
            Instant::now(),
        );

        // a response with the same ids routes back to the tracked remote
        let response = build_message(0x1234, 0x0001, b"rp", wire::PROTOCOL_VERSION, 0x80, 0x00);
        assert_eq!(state.take_client(&response), Some(remote()));
        // consumed: a second lookup fails
        assert_eq!(state.take_client(&response), None);
    }

    // ------------------------------------------------------------------
    // shutdown FSM
    // ------------------------------------------------------------------

    #[test]
    fn shutdown_without_multicast_single_phase() {
        let (state, close) = advance_shutdown(ShutdownState::WaitingFirstCancel, false, true);
        assert_eq!(state, ShutdownState::Idle);
        assert!(close);
    }

    #[test]
    fn shutdown_two_phase_either_order() {
        // unicast first
        let (state, close) = advance_shutdown(ShutdownState::WaitingFirstCancel, true, true);
        assert_eq!(state, ShutdownState::WaitingMulticastCancel);
        assert!(!close);
        let (state, close) = advance_shutdown(state, true, false);
        assert_eq!(state, ShutdownState::Idle);
        assert!(close);

        // multicast first
        let (state, close) = advance_shutdown(ShutdownState::WaitingFirstCancel, true, false);
        assert_eq!(state, ShutdownState::WaitingUnicastCancel);
        assert!(!close);
        let (state, close) = advance_shutdown(state, true, true);
        assert_eq!(state, ShutdownState::Idle);
        assert!(close);
    }

    #[test]
    fn shutdown_ignores_duplicate_acknowledgements() {
        let (state, close) = advance_shutdown(ShutdownState::WaitingMulticastCancel, true, true);
        assert_eq!(state, ShutdownState::WaitingMulticastCancel);
        assert!(!close);

        let (state, close) = advance_shutdown(ShutdownState::Idle, true, true);
        assert_eq!(state, ShutdownState::Idle);
        assert!(!close);
    }
}
