//! Routing-client state tables and command handlers.
//!
//! Everything here is synchronous: handlers mutate the state and return the
//! [`Action`]s the event loop must execute (sends, timer changes, sender
//! restarts). Application callbacks fire inline so subscription acceptance
//! decisions and state changes stay ordered against routing-info updates.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::protocol::{
    Command, DebounceFilter, EventKind, EventRegistration, Frame, RoutingEntry, RoutingEntryType,
    ServiceEntry,
};
use crate::wire::{self, Header, MessageType};
use crate::{
    ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, Result, ServiceId,
    ANY_MAJOR, CLIENT_UNSET, PENDING_ID_LOCAL, ROUTING_CLIENT,
};

use super::{RoutingApp, SecurityPolicy};

/// Registration progress of the routing client against the routing host.
/// Monotone forward except through an explicit reset on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Deregistered,
    Assigning,
    Assigned,
    Registering,
    Registered,
}

/// State of one subscription from this application's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Pending,
    Confirmed,
    Rejected,
}

/// A subscription request as tracked locally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SubscriptionData {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub eventgroup: EventgroupId,
    pub major: MajorVersion,
    pub event: EventId,
    pub filter: Option<DebounceFilter>,
}

/// Provided or requested event metadata, including the cached latest value
/// of fields for initial notifications to new subscribers.
#[derive(Debug, Default)]
struct EventInfo {
    kind: Option<EventKind>,
    provided: bool,
    eventgroups: BTreeSet<EventgroupId>,
    cached: Option<Bytes>,
}

/// Side effects the event loop executes after a handler returns.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    /// Send a command to the routing host through the sender endpoint.
    SendToHost(Command),
    /// Send a command to the routing host with an explicit frame client,
    /// used by `NotifyOne` where the frame names the target.
    SendToHostFor { client: ClientId, command: Command },
    /// Send a command directly to a local peer application.
    SendToClient { client: ClientId, command: Command },
    /// Arm the assignment/registration watchdog.
    StartWatchdog,
    CancelWatchdog,
    /// Begin keepalive probing (if configured).
    StartKeepalive,
    CancelKeepalive,
    /// Arm the request batching timer (if not already running).
    ArmRequestDebounce,
    /// Restart the sender endpoint, forcing a full reconnect.
    RestartSender,
    /// Create the local server endpoint; the loop calls
    /// [`RoutingState::receiver_ready`] with its port afterwards.
    CreateReceiver,
    /// Drop the outbound connection to one peer.
    RemovePeer(ClientId),
    /// Drop all outbound peer connections except the routing host.
    RemoveAllPeers,
}

/// All tables of the routing-manager client.
pub(crate) struct RoutingState {
    /// Application name announced during assignment.
    name: String,
    /// Request batching window active (from configuration).
    request_debounce_enabled: bool,
    pub client: ClientId,
    pub state: RegistrationState,
    /// Host liveness: set by `Pong`, cleared by each probe.
    keepalive_alive: bool,

    /// service → instance → (major, minor, providing client)
    local_services: HashMap<ServiceId, HashMap<InstanceId, (MajorVersion, MinorVersion, ClientId)>>,
    /// Known local clients and, for guests, their loopback endpoint.
    known_clients: HashMap<ClientId, Option<SocketAddr>>,

    pending_offers: BTreeSet<ServiceEntry>,
    requests: BTreeSet<ServiceEntry>,
    requests_to_debounce: BTreeSet<ServiceEntry>,
    pending_event_registrations: BTreeSet<EventRegistration>,
    pending_subscriptions: BTreeSet<SubscriptionData>,
    /// Subscribes from clients the routing info has not introduced yet.
    pending_incoming_subscriptions: HashMap<ClientId, Vec<SubscriptionData>>,

    /// Subscribers per eventgroup of services we provide. `ROUTING_CLIENT`
    /// stands in for all remote subscribers.
    subscribers: HashMap<(ServiceId, InstanceId, EventgroupId), BTreeSet<ClientId>>,
    /// Remote subscriptions per eventgroup, counted for suspend handling.
    remote_subscriber_count: BTreeMap<(ServiceId, InstanceId, EventgroupId), u32>,
    /// Outgoing subscription phases.
    subscription_phase: HashMap<(ServiceId, InstanceId, EventgroupId, EventId), SubscriptionPhase>,

    events: HashMap<(ServiceId, InstanceId, EventId), EventInfo>,
}

impl RoutingState {
    pub fn new(name: String, request_debounce_enabled: bool) -> Self {
        Self {
            name,
            request_debounce_enabled,
            client: CLIENT_UNSET,
            state: RegistrationState::Deregistered,
            keepalive_alive: false,
            local_services: HashMap::new(),
            known_clients: HashMap::new(),
            pending_offers: BTreeSet::new(),
            requests: BTreeSet::new(),
            requests_to_debounce: BTreeSet::new(),
            pending_event_registrations: BTreeSet::new(),
            pending_subscriptions: BTreeSet::new(),
            pending_incoming_subscriptions: HashMap::new(),
            subscribers: HashMap::new(),
            remote_subscriber_count: BTreeMap::new(),
            subscription_phase: HashMap::new(),
            events: HashMap::new(),
        }
    }

    fn is_registered(&self) -> bool {
        self.state == RegistrationState::Registered
    }

    fn is_known(&self, client: ClientId) -> bool {
        self.known_clients.contains_key(&client)
    }

    pub fn peer_endpoint(&self, client: ClientId) -> Option<SocketAddr> {
        self.known_clients.get(&client).copied().flatten()
    }

    fn find_local_client(&self, service: ServiceId, instance: InstanceId) -> Option<ClientId> {
        self.local_services
            .get(&service)
            .and_then(|instances| instances.get(&instance))
            .map(|(_, _, client)| *client)
    }

    fn is_available(&self, service: ServiceId, instance: InstanceId, major: MajorVersion) -> bool {
        self.local_services
            .get(&service)
            .and_then(|instances| instances.get(&instance))
            .is_some_and(|(available_major, _, _)| {
                major == ANY_MAJOR || *available_major == major
            })
    }

    fn is_offered(&self, service: ServiceId, instance: InstanceId) -> bool {
        self.pending_offers
            .iter()
            .any(|entry| entry.service == service && entry.instance == instance)
    }

    fn offered_major(&self, service: ServiceId, instance: InstanceId) -> MajorVersion {
        self.pending_offers
            .iter()
            .find(|entry| entry.service == service && entry.instance == instance)
            .map(|entry| entry.major)
            .unwrap_or(0)
    }

    // ========================================================================
    // Application-side operations
    // ========================================================================

    pub fn offer_service(&mut self, entry: ServiceEntry) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_registered() {
            actions.push(Action::SendToHost(Command::OfferService(entry)));
        }
        self.pending_offers.insert(entry);
        actions
    }

    pub fn stop_offer_service(&mut self, entry: ServiceEntry) -> Vec<Action> {
        self.remote_subscriber_count
            .retain(|(service, instance, _), _| {
                !(*service == entry.service && *instance == entry.instance)
            });
        self.pending_offers
            .retain(|offer| !(offer.service == entry.service && offer.instance == entry.instance));

        if self.is_registered() {
            vec![Action::SendToHost(Command::StopOfferService(entry))]
        } else {
            Vec::new()
        }
    }

    pub fn request_service(&mut self, entry: ServiceEntry) -> Vec<Action> {
        if self.request_debounce_enabled && !self.is_registered() {
            self.requests_to_debounce.insert(entry);
            return vec![Action::ArmRequestDebounce];
        }
        self.requests.insert(entry);
        if self.is_registered() {
            vec![Action::SendToHost(Command::RequestService {
                services: vec![entry],
            })]
        } else {
            Vec::new()
        }
    }

    pub fn release_service(&mut self, service: ServiceId, instance: InstanceId) -> Vec<Action> {
        self.remove_pending_subscriptions(service, instance);

        let was_debouncing = {
            let before = self.requests_to_debounce.len();
            self.requests_to_debounce
                .retain(|entry| !(entry.service == service && entry.instance == instance));
            before != self.requests_to_debounce.len()
        };
        self.requests
            .retain(|entry| !(entry.service == service && entry.instance == instance));

        if !was_debouncing && self.is_registered() {
            vec![Action::SendToHost(Command::ReleaseService {
                service,
                instance,
            })]
        } else {
            Vec::new()
        }
    }

    pub fn register_event(&mut self, registration: EventRegistration) -> Vec<Action> {
        let is_first = !self.pending_event_registrations.contains(&registration);

        let info = self
            .events
            .entry((
                registration.service,
                registration.instance,
                registration.event,
            ))
            .or_default();
        info.kind = Some(registration.kind);
        info.provided |= registration.provided;
        info.eventgroups
            .extend(registration.eventgroups.iter().copied());

        if is_first {
            self.pending_event_registrations.insert(registration.clone());
        }

        if is_first && self.is_registered() {
            vec![Action::SendToHost(Command::RegisterEvents {
                registrations: vec![registration],
            })]
        } else {
            Vec::new()
        }
    }

    pub fn unregister_event(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        provided: bool,
    ) -> Vec<Action> {
        self.pending_event_registrations.retain(|registration| {
            !(registration.service == service
                && registration.instance == instance
                && registration.event == event
                && registration.provided == provided)
        });
        self.events.remove(&(service, instance, event));

        if self.is_registered() {
            vec![Action::SendToHost(Command::UnregisterEvent {
                service,
                instance,
                event,
                provided,
            })]
        } else {
            Vec::new()
        }
    }

    pub fn subscribe(
        &mut self,
        data: SubscriptionData,
        security: &dyn SecurityPolicy,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_registered() && self.is_available(data.service, data.instance, data.major) {
            actions.extend(self.send_subscribe(&data, security));
        }
        self.subscription_phase.insert(
            (data.service, data.instance, data.eventgroup, data.event),
            SubscriptionPhase::Pending,
        );
        self.pending_subscriptions.insert(data);
        actions
    }

    fn send_subscribe(
        &self,
        data: &SubscriptionData,
        security: &dyn SecurityPolicy,
    ) -> Vec<Action> {
        if !security.allow_access(self.client, data.service, data.instance, data.event) {
            warn!(
                "routing: client {:04x} may not subscribe to [{:04x}.{:04x}.{:04x}]",
                self.client, data.service, data.instance, data.event
            );
            return Vec::new();
        }
        let command = Command::Subscribe {
            service: data.service,
            instance: data.instance,
            eventgroup: data.eventgroup,
            major: data.major,
            event: data.event,
            pending_id: PENDING_ID_LOCAL,
            filter: data.filter,
        };
        match self.find_local_client(data.service, data.instance) {
            Some(provider) if provider != ROUTING_CLIENT && self.is_known(provider) => {
                vec![Action::SendToClient {
                    client: provider,
                    command,
                }]
            }
            _ => vec![Action::SendToHost(command)],
        }
    }

    pub fn unsubscribe(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    ) -> Vec<Action> {
        self.pending_subscriptions.retain(|data| {
            !(data.service == service
                && data.instance == instance
                && (eventgroup == 0xFFFF || data.eventgroup == eventgroup)
                && (event == crate::ANY_EVENT || data.event == event))
        });
        self.subscription_phase
            .remove(&(service, instance, eventgroup, event));

        if !self.is_registered() {
            return Vec::new();
        }
        let command = Command::Unsubscribe {
            service,
            instance,
            eventgroup,
            event,
            pending_id: PENDING_ID_LOCAL,
        };
        match self.find_local_client(service, instance) {
            Some(provider) if provider != ROUTING_CLIENT && self.is_known(provider) => {
                vec![Action::SendToClient {
                    client: provider,
                    command,
                }]
            }
            _ => vec![Action::SendToHost(command)],
        }
    }

    fn remove_pending_subscriptions(&mut self, service: ServiceId, instance: InstanceId) {
        self.pending_subscriptions
            .retain(|data| !(data.service == service && data.instance == instance));
        self.subscription_phase
            .retain(|(s, i, _, _), _| !(*s == service && *i == instance));
    }

    /// Route an outgoing SOME/IP message. Returns `None` when the message
    /// was not sent (unregistered, denied, malformed).
    pub fn dispatch_send(
        &mut self,
        target: ClientId,
        message: &Bytes,
        instance: InstanceId,
        reliable: bool,
        security: &dyn SecurityPolicy,
    ) -> Option<Vec<Action>> {
        if !self.is_registered() {
            return None;
        }
        let header = Header::parse(message)?;
        let message_type = header.message_type()?;

        let mut actions = Vec::new();
        match message_type {
            MessageType::Request | MessageType::RequestNoReturn => {
                if !security.allow_access(self.client, header.service, instance, header.method) {
                    warn!(
                        "routing: denied request to [{:04x}.{:04x}.{:04x}]",
                        header.service, instance, header.method
                    );
                    return None;
                }
                let command = Command::Send {
                    instance,
                    reliable,
                    status: 0,
                    message: message.clone(),
                };
                match self.find_local_client(header.service, instance) {
                    Some(provider) if provider != ROUTING_CLIENT && self.is_known(provider) => {
                        actions.push(Action::SendToClient {
                            client: provider,
                            command,
                        });
                    }
                    _ => actions.push(Action::SendToHost(command)),
                }
            }
            MessageType::Response | MessageType::Error => {
                if !security.allow_offer(self.client, header.service, instance) {
                    warn!(
                        "routing: denied response for [{:04x}.{:04x}]",
                        header.service, instance
                    );
                    return None;
                }
                let command = Command::Send {
                    instance,
                    reliable,
                    status: 0,
                    message: message.clone(),
                };
                if header.client != ROUTING_CLIENT && self.is_known(header.client) {
                    actions.push(Action::SendToClient {
                        client: header.client,
                        command,
                    });
                } else {
                    actions.push(Action::SendToHost(command));
                }
            }
            MessageType::Notification => {
                if !security.allow_offer(self.client, header.service, instance) {
                    warn!(
                        "routing: denied notification for [{:04x}.{:04x}]",
                        header.service, instance
                    );
                    return None;
                }
                if target == ROUTING_CLIENT {
                    actions.extend(self.notify_subscribers(&header, message, instance, reliable));
                } else {
                    // notify-one
                    let command = Command::Send {
                        instance,
                        reliable,
                        status: 0,
                        message: message.clone(),
                    };
                    if self.is_known(target) {
                        actions.push(Action::SendToClient {
                            client: target,
                            command,
                        });
                    } else {
                        actions.push(Action::SendToHostFor {
                            client: target,
                            command: Command::NotifyOne {
                                instance,
                                reliable,
                                status: 0,
                                message: message.clone(),
                            },
                        });
                    }
                }
            }
        }
        Some(actions)
    }

    /// Deliver a notification to all local subscribers; forward to the host
    /// only when remote subscribers exist. Fields cache their latest value.
    fn notify_subscribers(
        &mut self,
        header: &Header,
        message: &Bytes,
        instance: InstanceId,
        reliable: bool,
    ) -> Vec<Action> {
        let key = (header.service, instance, header.method);
        let eventgroups = match self.events.get_mut(&key) {
            Some(info) => {
                if info.kind == Some(EventKind::Field) {
                    info.cached = Some(message.slice(wire::HEADER_SIZE.min(message.len())..));
                }
                info.eventgroups.clone()
            }
            None => BTreeSet::new(),
        };

        let mut local: BTreeSet<ClientId> = BTreeSet::new();
        let mut has_remote = false;
        for eventgroup in &eventgroups {
            if let Some(subscribers) =
                self.subscribers
                    .get(&(header.service, instance, *eventgroup))
            {
                for subscriber in subscribers {
                    if *subscriber == ROUTING_CLIENT {
                        has_remote = true;
                    } else {
                        local.insert(*subscriber);
                    }
                }
            }
            if self
                .remote_subscriber_count
                .get(&(header.service, instance, *eventgroup))
                .copied()
                .unwrap_or(0)
                > 0
            {
                has_remote = true;
            }
        }

        let mut actions = Vec::new();
        for subscriber in local {
            actions.push(Action::SendToClient {
                client: subscriber,
                command: Command::Send {
                    instance,
                    reliable,
                    status: 0,
                    message: message.clone(),
                },
            });
        }
        if has_remote {
            actions.push(Action::SendToHost(Command::Notify {
                instance,
                reliable,
                status: 0,
                message: message.clone(),
            }));
        }
        actions
    }

    // ========================================================================
    // Sender life-cycle
    // ========================================================================

    /// The sender connected: begin client assignment.
    pub fn on_connected(&mut self) -> Vec<Action> {
        if self.state != RegistrationState::Deregistered {
            warn!(
                "routing: connected in {:?}, ignoring client assignment",
                self.state
            );
            return Vec::new();
        }
        info!("routing: assigning client ({})", self.name);
        self.state = RegistrationState::Assigning;
        vec![
            Action::SendToHost(Command::AssignClient {
                name: self.name.clone(),
            }),
            Action::StartWatchdog,
        ]
    }

    /// The sender disconnected: reset and wait for its reconnect.
    pub fn on_disconnected(&mut self, app: &dyn RoutingApp) -> Vec<Action> {
        warn!("routing: disconnected, resetting to deregistered");
        self.state = RegistrationState::Deregistered;
        app.on_state(RegistrationState::Deregistered);
        vec![
            Action::CancelKeepalive,
            Action::CancelWatchdog,
            Action::RemoveAllPeers,
        ]
    }

    /// A forward transition watchdog expired without progress.
    pub fn on_watchdog_timeout(&mut self) -> Vec<Action> {
        if self.is_registered() {
            return Vec::new();
        }
        warn!(
            "routing: registration watchdog expired in {:?}, restarting sender",
            self.state
        );
        self.state = RegistrationState::Deregistered;
        vec![Action::RestartSender]
    }

    /// Keepalive interval elapsed.
    pub fn on_keepalive_tick(&mut self, app: &dyn RoutingApp) -> Vec<Action> {
        if !self.is_registered() {
            return vec![Action::CancelKeepalive];
        }
        if self.keepalive_alive {
            self.keepalive_alive = false;
            vec![Action::SendToHost(Command::Ping)]
        } else {
            warn!(
                "routing: client {:04x} received no keepalive confirmation from the host",
                self.client
            );
            let mut actions = self.on_disconnected(app);
            actions.push(Action::RestartSender);
            actions
        }
    }

    /// The request batching window elapsed.
    pub fn on_request_debounce(&mut self) -> Vec<Action> {
        if self.requests_to_debounce.is_empty() {
            return Vec::new();
        }
        if !self.is_registered() {
            return vec![Action::ArmRequestDebounce];
        }
        let services: Vec<ServiceEntry> = self.requests_to_debounce.iter().copied().collect();
        self.requests.extend(services.iter().copied());
        self.requests_to_debounce.clear();
        vec![Action::SendToHost(Command::RequestService { services })]
    }

    /// The local server endpoint is listening: register the application.
    pub fn receiver_ready(&mut self, port: u16) -> Vec<Action> {
        if self.state != RegistrationState::Assigned {
            warn!("routing: receiver ready in {:?}, ignoring", self.state);
            return Vec::new();
        }
        info!(
            "routing: client {:04x} ({}) registering with local port {}",
            self.client, self.name, port
        );
        self.state = RegistrationState::Registering;
        vec![
            Action::SendToHost(Command::RegisterApplication { port }),
            Action::StartWatchdog,
        ]
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    pub fn on_frame(
        &mut self,
        frame: Frame,
        app: &dyn RoutingApp,
        security: &dyn SecurityPolicy,
    ) -> Vec<Action> {
        match frame.command {
            Command::AssignClientAck { assigned } => self.on_assign_ack(assigned),
            Command::RoutingInfo { entries } => self.on_routing_info(entries, app, security),
            Command::Ping => vec![Action::SendToHost(Command::Pong)],
            Command::Pong => {
                if frame.client == ROUTING_CLIENT {
                    self.keepalive_alive = true;
                }
                Vec::new()
            }
            Command::Subscribe {
                service,
                instance,
                eventgroup,
                major,
                event,
                pending_id,
                filter,
            } => self.on_subscribe(
                frame.client,
                SubscriptionData {
                    service,
                    instance,
                    eventgroup,
                    major,
                    event,
                    filter,
                },
                pending_id,
                app,
            ),
            Command::Unsubscribe {
                service,
                instance,
                eventgroup,
                event,
                pending_id,
            } => self.on_unsubscribe(frame.client, service, instance, eventgroup, event, pending_id),
            Command::Expire {
                service,
                instance,
                eventgroup,
                event,
                pending_id,
            } => self.on_expire(frame.client, service, instance, eventgroup, event, pending_id),
            Command::SubscribeAck {
                service,
                instance,
                eventgroup,
                event,
                ..
            } => {
                self.on_subscription_answer(service, instance, eventgroup, event, true, app);
                Vec::new()
            }
            Command::SubscribeNack {
                service,
                instance,
                eventgroup,
                event,
                ..
            } => {
                self.on_subscription_answer(service, instance, eventgroup, event, false, app);
                Vec::new()
            }
            Command::UnsubscribeAck { .. } => Vec::new(),
            Command::Send {
                instance, message, ..
            }
            | Command::Notify {
                instance, message, ..
            }
            | Command::NotifyOne {
                instance, message, ..
            } => {
                self.deliver(frame.client, instance, message, app, security);
                Vec::new()
            }
            Command::ResendProvidedEvents => self.on_resend_provided_events(),
            Command::Suspend => self.on_suspend(),
            Command::UpdateSecurityPolicy { update_id, .. } => {
                vec![Action::SendToHost(Command::UpdateSecurityPolicy {
                    update_id,
                    payload: Bytes::new(),
                })]
            }
            Command::RemoveSecurityPolicy { update_id, .. } => {
                vec![Action::SendToHost(Command::RemoveSecurityPolicy {
                    update_id,
                    payload: Bytes::new(),
                })]
            }
            Command::DistributeSecurityPolicies { .. }
            | Command::UpdateSecurityCredentials { .. } => Vec::new(),
            other => {
                debug!(
                    "routing: ignoring unexpected command 0x{:02x} from {:04x}",
                    other.id(),
                    frame.client
                );
                Vec::new()
            }
        }
    }

    fn on_assign_ack(&mut self, assigned: ClientId) -> Vec<Action> {
        if self.state != RegistrationState::Assigning {
            warn!(
                "routing: spurious assignment ack ({:04x}) in {:?}, ignoring",
                assigned, self.state
            );
            return Vec::new();
        }
        if assigned == CLIENT_UNSET {
            // the host refused; the watchdog will restart the sender
            warn!(
                "routing: {}: {}",
                self.name,
                crate::Error::AssignmentRefused
            );
            return Vec::new();
        }
        info!("routing: assigned client id {:04x} ({})", assigned, self.name);
        self.client = assigned;
        self.state = RegistrationState::Assigned;
        vec![Action::CancelWatchdog, Action::CreateReceiver]
    }

    fn on_routing_info(
        &mut self,
        entries: Vec<RoutingEntry>,
        app: &dyn RoutingApp,
        security: &dyn SecurityPolicy,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        for entry in entries {
            match entry.entry_type {
                RoutingEntryType::AddClient => {
                    self.known_clients.insert(entry.client, entry.endpoint);
                    if entry.client == self.client {
                        actions.extend(self.on_own_client_added(app));
                    }
                }
                RoutingEntryType::DeleteClient => {
                    self.known_clients.remove(&entry.client);
                    if entry.client == self.client {
                        info!("routing: client {:04x} ({}) deregistered", self.client, self.name);
                        self.state = RegistrationState::Deregistered;
                        app.on_state(RegistrationState::Deregistered);
                    } else if entry.client != ROUTING_CLIENT {
                        actions.push(Action::RemovePeer(entry.client));
                    }
                }
                RoutingEntryType::AddServiceInstance => {
                    // offering clients become known even before they connect
                    self.known_clients.entry(entry.client).or_insert(entry.endpoint);
                    for service in &entry.services {
                        self.local_services
                            .entry(service.service)
                            .or_default()
                            .insert(
                                service.instance,
                                (service.major, service.minor, entry.client),
                            );
                        actions.extend(self.flush_pending_subscriptions(
                            service.service,
                            service.instance,
                            security,
                        ));
                        app.on_availability(
                            service.service,
                            service.instance,
                            true,
                            service.major,
                            service.minor,
                        );
                        info!(
                            "routing: available [{:04x}.{:04x}:{}.{}]",
                            service.service, service.instance, service.major, service.minor
                        );
                    }
                }
                RoutingEntryType::DeleteServiceInstance => {
                    for service in &entry.services {
                        if let Some(instances) = self.local_services.get_mut(&service.service) {
                            instances.remove(&service.instance);
                            if instances.is_empty() {
                                self.local_services.remove(&service.service);
                            }
                        }
                        self.unset_cached_events(service.service, service.instance);
                        app.on_availability(
                            service.service,
                            service.instance,
                            false,
                            service.major,
                            service.minor,
                        );
                        info!(
                            "routing: unavailable [{:04x}.{:04x}:{}.{}]",
                            service.service, service.instance, service.major, service.minor
                        );
                    }
                }
            }
        }

        actions.extend(self.release_pending_incoming(app));
        actions
    }

    /// Our own client appeared in the routing info: the registration is
    /// complete once the acknowledgement and the pending state are replayed.
    fn on_own_client_added(&mut self, app: &dyn RoutingApp) -> Vec<Action> {
        match self.state {
            RegistrationState::Registering => {}
            RegistrationState::Registered => {
                info!("routing: client {:04x} already registered", self.client);
                return Vec::new();
            }
            _ => return Vec::new(),
        }

        let mut actions = vec![Action::SendToHost(Command::RegisteredAck)];

        // replay order: offers, event registrations, requests; pending
        // subscriptions follow the service instances they wait for
        for offer in &self.pending_offers {
            actions.push(Action::SendToHost(Command::OfferService(*offer)));
        }
        if !self.pending_event_registrations.is_empty() {
            actions.push(Action::SendToHost(Command::RegisterEvents {
                registrations: self.pending_event_registrations.iter().cloned().collect(),
            }));
        }
        if !self.requests.is_empty() {
            actions.push(Action::SendToHost(Command::RequestService {
                services: self.requests.iter().copied().collect(),
            }));
        }

        info!("routing: client {:04x} ({}) registered", self.client, self.name);
        self.state = RegistrationState::Registered;
        self.keepalive_alive = true;
        actions.push(Action::CancelWatchdog);
        actions.push(Action::StartKeepalive);
        app.on_state(RegistrationState::Registered);
        actions
    }

    fn flush_pending_subscriptions(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        security: &dyn SecurityPolicy,
    ) -> Vec<Action> {
        if !self.is_registered() {
            return Vec::new();
        }
        let matching: Vec<SubscriptionData> = self
            .pending_subscriptions
            .iter()
            .filter(|data| data.service == service && data.instance == instance)
            .cloned()
            .collect();
        let mut actions = Vec::new();
        for data in matching {
            actions.extend(self.send_subscribe(&data, security));
        }
        actions
    }

    fn release_pending_incoming(&mut self, app: &dyn RoutingApp) -> Vec<Action> {
        if self.pending_incoming_subscriptions.is_empty() {
            return Vec::new();
        }
        let ready: Vec<ClientId> = self
            .pending_incoming_subscriptions
            .keys()
            .copied()
            .filter(|client| self.known_clients.contains_key(client))
            .collect();

        let mut actions = Vec::new();
        for client in ready {
            if let Some(subscriptions) = self.pending_incoming_subscriptions.remove(&client) {
                for data in subscriptions {
                    actions.extend(self.on_subscribe(client, data, PENDING_ID_LOCAL, app));
                }
            }
        }
        actions
    }

    fn on_subscribe(
        &mut self,
        subscriber: ClientId,
        data: SubscriptionData,
        pending_id: u16,
        app: &dyn RoutingApp,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        if pending_id != PENDING_ID_LOCAL {
            // remote subscriber, relayed by the routing host
            if self.is_offered(data.service, data.instance)
                && app.accept_subscription(data.service, data.instance, data.eventgroup, subscriber)
            {
                actions.push(Action::SendToHost(Command::SubscribeAck {
                    service: data.service,
                    instance: data.instance,
                    eventgroup: data.eventgroup,
                    subscriber,
                    event: data.event,
                    pending_id,
                }));
                let inserted = self
                    .subscribers
                    .entry((data.service, data.instance, data.eventgroup))
                    .or_default()
                    .insert(ROUTING_CLIENT);
                if inserted {
                    actions.extend(self.notify_remote_initially(
                        data.service,
                        data.instance,
                        data.eventgroup,
                    ));
                }
                let count = self
                    .remote_subscriber_count
                    .entry((data.service, data.instance, data.eventgroup))
                    .or_insert(0);
                *count += 1;
                info!(
                    "routing: remote subscribe ({:04x}): [{:04x}.{:04x}.{:04x}:{:04x}] {} subscriber(s)",
                    subscriber, data.service, data.instance, data.eventgroup, data.event, count
                );
            } else {
                actions.push(Action::SendToHost(Command::SubscribeNack {
                    service: data.service,
                    instance: data.instance,
                    eventgroup: data.eventgroup,
                    subscriber,
                    event: data.event,
                    pending_id,
                }));
            }
            return actions;
        }

        // local subscriber
        if !self.is_known(subscriber) {
            // set pending until the routing info introduces the client
            self.pending_incoming_subscriptions
                .entry(subscriber)
                .or_default()
                .push(data);
            return actions;
        }

        let accepted = self.is_offered(data.service, data.instance)
            && app.accept_subscription(data.service, data.instance, data.eventgroup, subscriber);
        if accepted {
            actions.push(Action::SendToClient {
                client: subscriber,
                command: Command::SubscribeAck {
                    service: data.service,
                    instance: data.instance,
                    eventgroup: data.eventgroup,
                    subscriber,
                    event: data.event,
                    pending_id: PENDING_ID_LOCAL,
                },
            });
            self.subscribers
                .entry((data.service, data.instance, data.eventgroup))
                .or_default()
                .insert(subscriber);
            info!(
                "routing: subscribe ({:04x}): [{:04x}.{:04x}.{:04x}:{:04x}]",
                subscriber, data.service, data.instance, data.eventgroup, data.event
            );
        } else {
            actions.push(Action::SendToClient {
                client: subscriber,
                command: Command::SubscribeNack {
                    service: data.service,
                    instance: data.instance,
                    eventgroup: data.eventgroup,
                    subscriber,
                    event: data.event,
                    pending_id: PENDING_ID_LOCAL,
                },
            });
        }
        actions
    }

    /// Replay the latest value of every set field of the eventgroup to the
    /// routing host, for forwarding to the new remote subscriber.
    fn notify_remote_initially(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Vec<Action> {
        let major = self.offered_major(service, instance);
        let mut actions = Vec::new();
        for ((event_service, event_instance, event), info) in &self.events {
            if *event_service != service
                || *event_instance != instance
                || info.kind != Some(EventKind::Field)
                || !info.provided
                || !info.eventgroups.contains(&eventgroup)
            {
                continue;
            }
            let Some(payload) = &info.cached else {
                continue;
            };
            let message = build_notification(service, *event, major, payload);
            actions.push(Action::SendToHost(Command::Notify {
                instance,
                reliable: false,
                status: 0,
                message,
            }));
        }
        actions
    }

    fn on_unsubscribe(
        &mut self,
        subscriber: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        pending_id: u16,
    ) -> Vec<Action> {
        info!(
            "routing: unsubscribe ({:04x}): [{:04x}.{:04x}.{:04x}:{:04x}]",
            subscriber, service, instance, eventgroup, event
        );
        if pending_id == PENDING_ID_LOCAL {
            if let Some(subscribers) = self.subscribers.get_mut(&(service, instance, eventgroup)) {
                subscribers.remove(&subscriber);
            }
            return Vec::new();
        }

        let remaining = self.drop_remote_subscriber(service, instance, eventgroup);
        let mut actions = Vec::new();
        if remaining == 0 {
            if let Some(subscribers) = self.subscribers.get_mut(&(service, instance, eventgroup)) {
                subscribers.remove(&ROUTING_CLIENT);
            }
        }
        actions.push(Action::SendToHost(Command::UnsubscribeAck {
            service,
            instance,
            eventgroup,
            pending_id,
        }));
        actions
    }

    fn on_expire(
        &mut self,
        subscriber: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        pending_id: u16,
    ) -> Vec<Action> {
        info!(
            "routing: expired subscription ({:04x}): [{:04x}.{:04x}.{:04x}:{:04x}]",
            subscriber, service, instance, eventgroup, event
        );
        if pending_id == PENDING_ID_LOCAL {
            if let Some(subscribers) = self.subscribers.get_mut(&(service, instance, eventgroup)) {
                subscribers.remove(&subscriber);
            }
        } else if self.drop_remote_subscriber(service, instance, eventgroup) == 0 {
            if let Some(subscribers) = self.subscribers.get_mut(&(service, instance, eventgroup)) {
                subscribers.remove(&ROUTING_CLIENT);
            }
        }
        Vec::new()
    }

    fn drop_remote_subscriber(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> u32 {
        match self.remote_subscriber_count.get_mut(&(service, instance, eventgroup)) {
            Some(count) => {
                *count = count.saturating_sub(1);
                let remaining = *count;
                if remaining == 0 {
                    self.remote_subscriber_count
                        .remove(&(service, instance, eventgroup));
                }
                remaining
            }
            None => 0,
        }
    }

    fn on_subscription_answer(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        accepted: bool,
        app: &dyn RoutingApp,
    ) {
        let phase = if accepted {
            SubscriptionPhase::Confirmed
        } else {
            SubscriptionPhase::Rejected
        };
        self.subscription_phase
            .insert((service, instance, eventgroup, event), phase);
        app.on_subscription_status(service, instance, eventgroup, event, accepted);
    }

    /// Deliver an embedded SOME/IP message to the application, caching field
    /// values carried by notifications.
    fn deliver(
        &mut self,
        sender: ClientId,
        instance: InstanceId,
        message: Bytes,
        app: &dyn RoutingApp,
        security: &dyn SecurityPolicy,
    ) {
        let Some(header) = Header::parse(&message) else {
            warn!("routing: undecodable embedded message from {:04x}", sender);
            return;
        };
        let Some(message_type) = header.message_type() else {
            warn!("routing: embedded message with invalid type from {:04x}", sender);
            return;
        };

        if message_type.is_request() {
            if !security.allow_access(sender, header.service, instance, header.method) {
                warn!(
                    "routing: denied request from {:04x} to [{:04x}.{:04x}.{:04x}]",
                    sender, header.service, instance, header.method
                );
                return;
            }
        } else if !security.allow_offer(sender, header.service, instance) {
            warn!(
                "routing: denied {:?} from {:04x} for [{:04x}.{:04x}]",
                message_type, sender, header.service, instance
            );
            return;
        }

        if message_type.is_notification() {
            self.cache_event_payload(&header, instance, &message);
        }
        app.on_message(message, instance, sender);
    }

    fn cache_event_payload(&mut self, header: &Header, instance: InstanceId, message: &Bytes) {
        let info = self
            .events
            .entry((header.service, instance, header.method))
            .or_insert_with(|| {
                // placeholder until the event is registered with full
                // information
                EventInfo {
                    kind: Some(EventKind::Field),
                    provided: false,
                    eventgroups: BTreeSet::new(),
                    cached: None,
                }
            });
        if info.kind == Some(EventKind::Field) {
            info.cached = Some(message.slice(wire::HEADER_SIZE.min(message.len())..));
        }
    }

    fn unset_cached_events(&mut self, service: ServiceId, instance: InstanceId) {
        for ((event_service, event_instance, _), info) in self.events.iter_mut() {
            if *event_service == service && *event_instance == instance {
                info.cached = None;
            }
        }
    }

    fn on_resend_provided_events(&mut self) -> Vec<Action> {
        let registrations: Vec<EventRegistration> = self
            .pending_event_registrations
            .iter()
            .filter(|registration| registration.provided)
            .cloned()
            .collect();
        let mut actions = Vec::new();
        if !registrations.is_empty() {
            actions.push(Action::SendToHost(Command::RegisterEvents { registrations }));
        }
        actions.push(Action::SendToHost(Command::ResendProvidedEvents));
        actions
    }

    /// Unsubscribe every remote subscriber and clear the counter table;
    /// local state is untouched.
    fn on_suspend(&mut self) -> Vec<Action> {
        info!("routing: suspend, dropping remote subscribers");
        let keys: Vec<(ServiceId, InstanceId, EventgroupId)> =
            self.remote_subscriber_count.keys().copied().collect();
        for key in keys {
            if let Some(subscribers) = self.subscribers.get_mut(&key) {
                subscribers.remove(&ROUTING_CLIENT);
            }
        }
        self.remote_subscriber_count.clear();
        Vec::new()
    }

    /// Phase of an outgoing subscription, if tracked.
    pub fn subscription_phase(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    ) -> Option<SubscriptionPhase> {
        self.subscription_phase
            .get(&(service, instance, eventgroup, event))
            .copied()
    }
}

/// Build a serialized SOME/IP notification for an initial field replay.
fn build_notification(
    service: ServiceId,
    event: EventId,
    major: MajorVersion,
    payload: &Bytes,
) -> Bytes {
    let header = Header {
        service,
        method: event,
        length: (8 + payload.len()) as u32,
        client: ROUTING_CLIENT,
        session: 0,
        protocol_version: wire::PROTOCOL_VERSION,
        interface_version: major,
        message_type_raw: MessageType::Notification.value(),
        return_code: 0,
    };
    let mut buf = BytesMut::with_capacity(wire::HEADER_SIZE + payload.len());
    header.serialize(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Convenience used by the event loop and tests.
pub(crate) fn parse_frame_stream(buffer: &mut BytesMut) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    while let Some(frame) = crate::protocol::decode_frame(buffer)? {
        frames.push(frame);
    }
    Ok(frames)
}
