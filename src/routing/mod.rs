//! # Routing-Manager Client
//!
//! The local participant of the routing protocol. It negotiates a client
//! identifier with the routing host, registers the application, keeps the
//! host alive-checked, and routes SOME/IP messages between the application,
//! local peer applications and the routing host.
//!
//! ```text
//!  application ──RoutingClient──▶ event loop (one task)
//!                                   │  ├─ sender endpoint ──▶ routing host
//!                                   │  ├─ local server ◀── host + peers
//!                                   │  └─ peer connections ──▶ peers
//!                                   ▼
//!                           RoutingApp callbacks
//! ```
//!
//! All state lives on the event-loop task; handles post operations through a
//! channel. Application callbacks fire on that task, so they observe
//! registration changes, availability and messages in a serialized order.

mod state;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RoutingHost};
use crate::endpoint::sender::{SenderEndpoint, SenderEvent};
use crate::net::{LocalConnector, LocalListener, LocalStream, LocalTarget, Stream, TcpConnector, UnixConnector};
use crate::net::Listener;
use crate::protocol::{Command, DebounceFilter, EventRegistration, Frame, ServiceEntry};
use crate::{
    ClientId, Error, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, Result,
    ServiceId,
};

use state::{Action, RoutingState, SubscriptionData};

pub use state::{RegistrationState, SubscriptionPhase};

/// How long a stop waits for the deregistration round-trip.
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Host-side traits
// ============================================================================

/// Application callbacks. All methods fire on the routing client's event
/// loop; keep them short.
pub trait RoutingApp: Send + Sync + 'static {
    /// Registration state changed.
    fn on_state(&self, state: RegistrationState);

    /// A service instance became available or unavailable.
    fn on_availability(
        &self,
        service: ServiceId,
        instance: InstanceId,
        available: bool,
        major: MajorVersion,
        minor: MinorVersion,
    );

    /// A SOME/IP message was delivered to this application.
    fn on_message(&self, message: Bytes, instance: InstanceId, sender: ClientId);

    /// Decide whether a subscription to one of our eventgroups is accepted.
    fn accept_subscription(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
    ) -> bool {
        let _ = (service, instance, eventgroup, client);
        true
    }

    /// One of our own subscriptions was acknowledged or rejected.
    fn on_subscription_status(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        accepted: bool,
    ) {
        let _ = (service, instance, eventgroup, event, accepted);
    }
}

/// Security predicate gating sends and subscriptions. The policy store that
/// feeds implementations lives outside this crate.
pub trait SecurityPolicy: Send + Sync + 'static {
    fn allow_access(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        method: crate::MethodId,
    ) -> bool;

    fn allow_offer(&self, client: ClientId, service: ServiceId, instance: InstanceId) -> bool;
}

/// Permit-everything policy, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SecurityPolicy for AllowAll {
    fn allow_access(
        &self,
        _client: ClientId,
        _service: ServiceId,
        _instance: InstanceId,
        _method: crate::MethodId,
    ) -> bool {
        true
    }

    fn allow_offer(&self, _client: ClientId, _service: ServiceId, _instance: InstanceId) -> bool {
        true
    }
}

// ============================================================================
// Handle
// ============================================================================

enum ClientOp {
    Offer(ServiceEntry),
    StopOffer(ServiceEntry),
    Request(ServiceEntry),
    Release {
        service: ServiceId,
        instance: InstanceId,
    },
    RegisterEvent(EventRegistration),
    UnregisterEvent {
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        provided: bool,
    },
    Subscribe(SubscriptionData),
    Unsubscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    },
    Send {
        target: ClientId,
        message: Bytes,
        instance: InstanceId,
        reliable: bool,
        reply: oneshot::Sender<bool>,
    },
    Stop,
}

/// Handle to a running routing client. Cloneable and cheap to share.
#[derive(Clone)]
pub struct RoutingClient {
    ops: mpsc::UnboundedSender<ClientOp>,
}

impl RoutingClient {
    /// Spawn the routing client with the permit-everything security policy.
    pub fn start(config: Config, app: Arc<dyn RoutingApp>) -> Self {
        Self::start_with_security(config, app, Arc::new(AllowAll))
    }

    /// Spawn the routing client with an explicit security policy.
    pub fn start_with_security(
        config: Config,
        app: Arc<dyn RoutingApp>,
        security: Arc<dyn SecurityPolicy>,
    ) -> Self {
        let config = Arc::new(config);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (sender_events_tx, sender_events_rx) = mpsc::unbounded_channel();
        let (sender_inbound_tx, sender_inbound_rx) = mpsc::unbounded_channel();

        let connector = match &config.routing_host {
            RoutingHost::Local { path } => LocalConnector::Unix(UnixConnector { path: path.clone() }),
            RoutingHost::Tcp { address } => LocalConnector::Tcp(TcpConnector { address: *address }),
        };
        let sender = SenderEndpoint::start(
            connector,
            Arc::clone(&config),
            sender_events_tx,
            sender_inbound_tx,
        );

        let event_loop = EventLoop {
            state: RoutingState::new(
                config.application_name.clone(),
                !config.request_debounce.is_zero(),
            ),
            config,
            app,
            security,
            sender,
            frame_tx,
            sender_buffer: BytesMut::new(),
            peers: HashMap::new(),
            receiver: None,
            watchdog: None,
            keepalive: None,
            request_debounce: None,
            stop_deadline: None,
        };
        tokio::spawn(event_loop.run(ops_rx, frame_rx, sender_events_rx, sender_inbound_rx));

        Self { ops: ops_tx }
    }

    fn post(&self, op: ClientOp) -> Result<()> {
        self.ops.send(op).map_err(|_| Error::Shutdown)
    }

    /// Offer a service instance. Replayed automatically after reconnects.
    pub fn offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.post(ClientOp::Offer(ServiceEntry {
            service,
            instance,
            major,
            minor,
        }))
    }

    /// Withdraw a service offer.
    pub fn stop_offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.post(ClientOp::StopOffer(ServiceEntry {
            service,
            instance,
            major,
            minor,
        }))
    }

    /// Request a service instance.
    pub fn request_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.post(ClientOp::Request(ServiceEntry {
            service,
            instance,
            major,
            minor,
        }))
    }

    /// Release a requested service instance.
    pub fn release_service(&self, service: ServiceId, instance: InstanceId) -> Result<()> {
        self.post(ClientOp::Release { service, instance })
    }

    /// Register an event or field, provided or requested.
    pub fn register_event(&self, registration: EventRegistration) -> Result<()> {
        self.post(ClientOp::RegisterEvent(registration))
    }

    /// Unregister an event.
    pub fn unregister_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        provided: bool,
    ) -> Result<()> {
        self.post(ClientOp::UnregisterEvent {
            service,
            instance,
            event,
            provided,
        })
    }

    /// Subscribe to an eventgroup. Kept pending across reconnects and
    /// (re)sent whenever the service instance is available.
    pub fn subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event: EventId,
        filter: Option<DebounceFilter>,
    ) -> Result<()> {
        self.post(ClientOp::Subscribe(SubscriptionData {
            service,
            instance,
            eventgroup,
            major,
            event,
            filter,
        }))
    }

    /// Withdraw a subscription.
    pub fn unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    ) -> Result<()> {
        self.post(ClientOp::Unsubscribe {
            service,
            instance,
            eventgroup,
            event,
        })
    }

    /// Route a serialized SOME/IP message. `target` selects the recipient
    /// for notify-one; pass [`crate::ROUTING_CLIENT`] otherwise. Returns
    /// whether the message was admitted.
    pub async fn send(
        &self,
        target: ClientId,
        message: Bytes,
        instance: InstanceId,
        reliable: bool,
    ) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .post(ClientOp::Send {
                target,
                message,
                instance,
                reliable,
                reply: reply_tx,
            })
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Deregister from the routing host and shut the client down.
    pub fn stop(&self) {
        let _ = self.post(ClientOp::Stop);
    }
}

// ============================================================================
// Event loop
// ============================================================================

struct ReceiverHandle {
    client: ClientId,
    port: u16,
    path: Option<PathBuf>,
    task: JoinHandle<()>,
}

struct EventLoop {
    config: Arc<Config>,
    app: Arc<dyn RoutingApp>,
    security: Arc<dyn SecurityPolicy>,
    state: RoutingState,
    sender: SenderEndpoint,
    frame_tx: mpsc::UnboundedSender<Frame>,
    /// Partial frame data read from the sender's bidirectional stream.
    sender_buffer: BytesMut,
    peers: HashMap<ClientId, mpsc::UnboundedSender<Bytes>>,
    receiver: Option<ReceiverHandle>,
    watchdog: Option<Instant>,
    keepalive: Option<Instant>,
    request_debounce: Option<Instant>,
    stop_deadline: Option<Instant>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut ops_rx: mpsc::UnboundedReceiver<ClientOp>,
        mut frame_rx: mpsc::UnboundedReceiver<Frame>,
        mut sender_events_rx: mpsc::UnboundedReceiver<SenderEvent>,
        mut sender_inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let mut stopping = false;
        loop {
            tokio::select! {
                op = ops_rx.recv(), if !stopping => {
                    match op {
                        Some(ClientOp::Stop) | None => {
                            stopping = true;
                            if self.state.state == RegistrationState::Registered {
                                let actions =
                                    vec![Action::SendToHost(Command::DeregisterApplication)];
                                self.execute(actions).await;
                                self.stop_deadline = Some(Instant::now() + STOP_TIMEOUT);
                            } else {
                                break;
                            }
                        }
                        Some(op) => self.handle_op(op).await,
                    }
                }
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { continue };
                    let actions = self.state.on_frame(frame, self.app.as_ref(), self.security.as_ref());
                    self.execute(actions).await;
                    if self.stop_deadline.is_some()
                        && self.state.state == RegistrationState::Deregistered
                    {
                        break;
                    }
                }
                chunk = sender_inbound_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    self.sender_buffer.extend_from_slice(&chunk);
                    let frames = match state::parse_frame_stream(&mut self.sender_buffer) {
                        Ok(frames) => frames,
                        Err(e) => {
                            warn!("routing: undecodable frame from the host: {}", e);
                            self.sender_buffer.clear();
                            Vec::new()
                        }
                    };
                    for frame in frames {
                        let actions = self.state.on_frame(
                            frame,
                            self.app.as_ref(),
                            self.security.as_ref(),
                        );
                        self.execute(actions).await;
                    }
                    if self.stop_deadline.is_some()
                        && self.state.state == RegistrationState::Deregistered
                    {
                        break;
                    }
                }
                event = sender_events_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SenderEvent::Connected => {
                            let actions = self.state.on_connected();
                            self.execute(actions).await;
                        }
                        SenderEvent::Disconnected => {
                            // a partial frame from the old connection must
                            // not poison the next one
                            self.sender_buffer.clear();
                            let actions = self.state.on_disconnected(self.app.as_ref());
                            self.execute(actions).await;
                        }
                        SenderEvent::MaxReconnectsReached => {
                            error!("routing: giving up on the routing host (reconnect cap)");
                            self.app.on_state(RegistrationState::Deregistered);
                            break;
                        }
                    }
                }
                () = wait_deadline(self.watchdog) => {
                    self.watchdog = None;
                    let actions = self.state.on_watchdog_timeout();
                    self.execute(actions).await;
                }
                () = wait_deadline(self.keepalive) => {
                    self.keepalive = self
                        .config
                        .keepalive_interval
                        .map(|interval| Instant::now() + interval);
                    let actions = self.state.on_keepalive_tick(self.app.as_ref());
                    self.execute(actions).await;
                }
                () = wait_deadline(self.request_debounce) => {
                    self.request_debounce = None;
                    let actions = self.state.on_request_debounce();
                    self.execute(actions).await;
                }
                () = wait_deadline(self.stop_deadline) => {
                    warn!("routing: deregistration timed out");
                    break;
                }
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        debug!("routing: event loop shutting down");
        self.sender.stop();
        self.peers.clear();
        if let Some(receiver) = self.receiver.take() {
            receiver.task.abort();
            if let Some(path) = receiver.path {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    async fn handle_op(&mut self, op: ClientOp) {
        let actions = match op {
            ClientOp::Offer(entry) => self.state.offer_service(entry),
            ClientOp::StopOffer(entry) => self.state.stop_offer_service(entry),
            ClientOp::Request(entry) => self.state.request_service(entry),
            ClientOp::Release { service, instance } => {
                self.state.release_service(service, instance)
            }
            ClientOp::RegisterEvent(registration) => self.state.register_event(registration),
            ClientOp::UnregisterEvent {
                service,
                instance,
                event,
                provided,
            } => self
                .state
                .unregister_event(service, instance, event, provided),
            ClientOp::Subscribe(data) => self.state.subscribe(data, self.security.as_ref()),
            ClientOp::Unsubscribe {
                service,
                instance,
                eventgroup,
                event,
            } => self.state.unsubscribe(service, instance, eventgroup, event),
            ClientOp::Send {
                target,
                message,
                instance,
                reliable,
                reply,
            } => {
                let actions = self.state.dispatch_send(
                    target,
                    &message,
                    instance,
                    reliable,
                    self.security.as_ref(),
                );
                let _ = reply.send(actions.is_some());
                actions.unwrap_or_default()
            }
            ClientOp::Stop => Vec::new(),
        };
        self.execute(actions).await;
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::SendToHost(command) => self.send_to_host(self.state.client, command),
                Action::SendToHostFor { client, command } => self.send_to_host(client, command),
                Action::SendToClient { client, command } => self.send_to_client(client, command),
                Action::StartWatchdog => {
                    self.watchdog = Some(Instant::now() + self.config.register_timeout);
                }
                Action::CancelWatchdog => self.watchdog = None,
                Action::StartKeepalive => {
                    if let Some(interval) = self.config.keepalive_interval {
                        info!(
                            "routing: keepalive enabled, interval {} ms",
                            interval.as_millis()
                        );
                        self.keepalive = Some(Instant::now() + interval);
                    }
                }
                Action::CancelKeepalive => self.keepalive = None,
                Action::ArmRequestDebounce => {
                    if self.request_debounce.is_none() {
                        self.request_debounce =
                            Some(Instant::now() + self.config.request_debounce);
                    }
                }
                Action::RestartSender => self.sender.restart(),
                Action::CreateReceiver => match self.create_receiver().await {
                    Ok(port) => queue.extend(self.state.receiver_ready(port)),
                    Err(e) => {
                        error!("routing: creating the local server endpoint failed: {}", e);
                        self.sender.restart();
                    }
                },
                Action::RemovePeer(client) => {
                    self.peers.remove(&client);
                }
                Action::RemoveAllPeers => self.peers.clear(),
            }
        }
    }

    fn send_to_host(&self, frame_client: ClientId, command: Command) {
        let id = command.id();
        let bytes = command.encode(frame_client);
        if !self.sender.send(bytes, u16::from(id), 0) {
            warn!(
                "routing: dropped command 0x{:02x} to the host (sender {:?})",
                id,
                self.sender.state()
            );
        }
    }

    fn send_to_client(&mut self, client: ClientId, command: Command) {
        let bytes = command.encode(self.state.client);
        if let Some(tx) = self.peers.get(&client) {
            if tx.send(bytes.clone()).is_ok() {
                return;
            }
            self.peers.remove(&client);
        }

        let Some(target) = self.peer_target(client) else {
            warn!("routing: no endpoint known for client {:04x}", client);
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            let mut stream = match LocalStream::connect(&target).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("routing: connecting to client {:04x} failed: {}", client, e);
                    return;
                }
            };
            while let Some(data) = rx.recv().await {
                if let Err(e) = stream.write_all(&data).await {
                    warn!("routing: writing to client {:04x} failed: {}", client, e);
                    break;
                }
            }
        });
        let _ = tx.send(bytes);
        self.peers.insert(client, tx);
    }

    fn peer_target(&self, client: ClientId) -> Option<LocalTarget> {
        if let Some(address) = self.state.peer_endpoint(client) {
            return Some(LocalTarget::Tcp(address));
        }
        match &self.config.routing_host {
            #[cfg(unix)]
            RoutingHost::Local { path } => Some(LocalTarget::Unix(local_socket_path(path, client))),
            #[cfg(not(unix))]
            RoutingHost::Local { .. } => None,
            RoutingHost::Tcp { .. } => None,
        }
    }

    async fn create_receiver(&mut self) -> std::io::Result<u16> {
        if let Some(receiver) = &self.receiver {
            if receiver.client == self.state.client {
                info!(
                    "routing: reusing local server endpoint at port {}",
                    receiver.port
                );
                return Ok(receiver.port);
            }
        }
        if let Some(old) = self.receiver.take() {
            old.task.abort();
            if let Some(path) = old.path {
                let _ = std::fs::remove_file(path);
            }
        }

        let (listener, path) = match &self.config.routing_host {
            RoutingHost::Local { path } => {
                #[cfg(unix)]
                {
                    let socket_path = local_socket_path(path, self.state.client);
                    (
                        LocalListener::bind_unix(&socket_path)?,
                        Some(socket_path),
                    )
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "unix-domain routing requires a unix platform",
                    ));
                }
            }
            RoutingHost::Tcp { .. } => (LocalListener::bind_loopback().await?, None),
        };
        let port = listener.local_port();

        let frame_tx = self.frame_tx.clone();
        let task = tokio::spawn(async move {
            accept_loop(listener, frame_tx).await;
        });
        self.receiver = Some(ReceiverHandle {
            client: self.state.client,
            port,
            path,
            task,
        });
        Ok(port)
    }
}

/// Socket path of a local application: the routing base path suffixed with
/// the client id.
fn local_socket_path(base: &Path, client: ClientId) -> PathBuf {
    PathBuf::from(format!("{}-{:04x}", base.display(), client))
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

async fn accept_loop(listener: LocalListener, frame_tx: mpsc::UnboundedSender<Frame>) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                let frame_tx = frame_tx.clone();
                tokio::spawn(async move {
                    connection_reader(stream, frame_tx).await;
                });
            }
            Err(e) => {
                debug!("routing: accept failed: {}", e);
                break;
            }
        }
    }
}

/// Read routing-protocol frames from one accepted connection and forward
/// them to the event loop.
async fn connection_reader(mut stream: LocalStream, frame_tx: mpsc::UnboundedSender<Frame>) {
    let mut buffer = BytesMut::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                match state::parse_frame_stream(&mut buffer) {
                    Ok(frames) => {
                        for frame in frames {
                            if frame_tx.send(frame).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("routing: undecodable frame on local connection: {}", e);
                        break;
                    }
                }
            }
            Err(e) => {
                debug!("routing: local connection read failed: {}", e);
                break;
            }
        }
    }
}
