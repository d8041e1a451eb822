//! Integration tests of the routing-manager client against a scripted
//! routing host on loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use routeip::protocol::{decode_frame, Command, Frame, RoutingEntry, RoutingEntryType, ServiceEntry};
use routeip::routing::{RegistrationState, RoutingApp, RoutingClient};
use routeip::{ClientId, Config, PENDING_ID_LOCAL, ROUTING_CLIENT};

// ============================================================================
// Helpers
// ============================================================================

struct FrameReader {
    stream: TcpStream,
    buffer: BytesMut,
}

impl FrameReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
        }
    }

    async fn next(&mut self) -> Option<Frame> {
        loop {
            match decode_frame(&mut self.buffer) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(e) => panic!("undecodable frame from the app: {}", e),
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Read frames until one matches; panics when the connection closes.
    async fn expect(&mut self, what: &str, matches: impl Fn(&Command) -> bool) -> Frame {
        loop {
            let frame = self
                .next()
                .await
                .unwrap_or_else(|| panic!("connection closed while waiting for {}", what));
            if matches(&frame.command) {
                return frame;
            }
        }
    }

    async fn write(&mut self, client: ClientId, command: Command) {
        self.stream
            .write_all(&command.encode(client))
            .await
            .expect("host write");
    }
}

async fn write_command(stream: &mut TcpStream, client: ClientId, command: Command) {
    stream
        .write_all(&command.encode(client))
        .await
        .expect("host write");
}

#[derive(Default)]
struct TestApp {
    states: std::sync::Mutex<Vec<RegistrationState>>,
}

impl RoutingApp for TestApp {
    fn on_state(&self, state: RegistrationState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_availability(
        &self,
        _service: u16,
        _instance: u16,
        _available: bool,
        _major: u8,
        _minor: u32,
    ) {
    }

    fn on_message(&self, _message: Bytes, _instance: u16, _sender: ClientId) {}
}

/// Drive one handshake session on an accepted app connection: assignment,
/// registration, own-client routing info. Returns the host's outbound
/// connection to the app's local server endpoint.
async fn complete_handshake(reader: &mut FrameReader, assigned: ClientId) -> TcpStream {
    reader
        .expect("AssignClient", |c| matches!(c, Command::AssignClient { .. }))
        .await;
    reader
        .write(ROUTING_CLIENT, Command::AssignClientAck { assigned })
        .await;

    let frame = reader
        .expect("RegisterApplication", |c| {
            matches!(c, Command::RegisterApplication { .. })
        })
        .await;
    let Command::RegisterApplication { port } = frame.command else {
        unreachable!();
    };

    let mut host_out = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to app receiver");
    write_command(
        &mut host_out,
        ROUTING_CLIENT,
        Command::RoutingInfo {
            entries: vec![RoutingEntry {
                entry_type: RoutingEntryType::AddClient,
                client: assigned,
                endpoint: None,
                services: vec![],
            }],
        },
    )
    .await;

    reader
        .expect("RegisteredAck", |c| matches!(c, Command::RegisteredAck))
        .await;
    host_out
}

fn add_service_instance(client: ClientId, endpoint: SocketAddr) -> Command {
    Command::RoutingInfo {
        entries: vec![RoutingEntry {
            entry_type: RoutingEntryType::AddServiceInstance,
            client,
            endpoint: Some(endpoint),
            services: vec![ServiceEntry {
                service: 0x3333,
                instance: 0x0001,
                major: 1,
                minor: 0,
            }],
        }],
    }
}

/// Accept connections as the service provider and forward every decoded
/// frame.
fn spawn_provider(listener: TcpListener, frames: mpsc::UnboundedSender<Frame>) {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let frames = frames.clone();
            tokio::spawn(async move {
                let mut reader = FrameReader::new(stream);
                while let Some(frame) = reader.next().await {
                    if frames.send(frame).is_err() {
                        break;
                    }
                }
            });
        }
    });
}

fn test_config(host_addr: SocketAddr, name: &str) -> Config {
    Config::builder()
        .application_name(name)
        .routing_address(host_addr)
        .connect_timeout(Duration::from_millis(20))
        .build()
}

// ============================================================================
// Tests
// ============================================================================

#[test_log::test(tokio::test)]
async fn registers_and_reports_state() {
    let host_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host_addr = host_listener.local_addr().unwrap();

    let app = Arc::new(TestApp::default());
    let client = RoutingClient::start(test_config(host_addr, "basic"), app.clone());

    let (conn, _) = host_listener.accept().await.unwrap();
    let mut reader = FrameReader::new(conn);
    let _host_out = complete_handshake(&mut reader, 0x0103).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if app
                .states
                .lock()
                .unwrap()
                .contains(&RegistrationState::Registered)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("application registered");

    client.stop();
}

#[test_log::test(tokio::test)]
async fn offers_and_requests_replayed_on_registration() {
    let host_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host_addr = host_listener.local_addr().unwrap();

    let app = Arc::new(TestApp::default());
    let client = RoutingClient::start(test_config(host_addr, "replayer"), app);

    // issued before any connection exists
    client.offer_service(0x1111, 1, 1, 0).unwrap();
    client.request_service(0x2222, 1, 1, 0).unwrap();

    let (conn, _) = host_listener.accept().await.unwrap();
    let mut reader = FrameReader::new(conn);
    let _host_out = complete_handshake(&mut reader, 0x0103).await;

    // offer first, then the request
    let frame = reader
        .expect("OfferService", |c| matches!(c, Command::OfferService(_)))
        .await;
    assert!(matches!(
        frame.command,
        Command::OfferService(ServiceEntry { service: 0x1111, .. })
    ));
    reader
        .expect("RequestService", |c| {
            matches!(c, Command::RequestService { services } if services[0].service == 0x2222)
        })
        .await;

    client.stop();
}

#[test_log::test(tokio::test)]
async fn subscription_replayed_exactly_once_after_reconnect() {
    // the provider the subscription targets
    let provider_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let provider_addr = provider_listener.local_addr().unwrap();
    let (provider_tx, mut provider_rx) = mpsc::unbounded_channel();
    spawn_provider(provider_listener, provider_tx);

    let host_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host_addr = host_listener.local_addr().unwrap();

    let app = Arc::new(TestApp::default());
    let client = RoutingClient::start(test_config(host_addr, "subscriber"), app);

    client.request_service(0x3333, 1, 1, 0).unwrap();
    client
        .subscribe(0x3333, 0x0001, 0x0010, 1, 0x8001, None)
        .unwrap();

    // ---- session 1 ----
    let (conn, _) = host_listener.accept().await.unwrap();
    let mut reader = FrameReader::new(conn);
    let mut host_out = complete_handshake(&mut reader, 0x0103).await;
    write_command(&mut host_out, ROUTING_CLIENT, add_service_instance(0x0105, provider_addr)).await;

    let frame = tokio::time::timeout(Duration::from_secs(2), provider_rx.recv())
        .await
        .expect("subscribe reaches the provider")
        .unwrap();
    match frame.command {
        Command::Subscribe {
            service: 0x3333,
            eventgroup: 0x0010,
            event: 0x8001,
            pending_id,
            ..
        } => assert_eq!(pending_id, PENDING_ID_LOCAL),
        other => panic!("expected Subscribe, got {:?}", other),
    }
    // exactly one
    assert!(
        tokio::time::timeout(Duration::from_millis(150), provider_rx.recv())
            .await
            .is_err(),
        "duplicate subscribe"
    );

    // ---- connection drops ----
    drop(reader);
    drop(host_out);

    // ---- session 2: the client reconnects and replays ----
    let (conn, _) = tokio::time::timeout(Duration::from_secs(3), host_listener.accept())
        .await
        .expect("client reconnects")
        .unwrap();
    let mut reader = FrameReader::new(conn);
    let mut host_out = complete_handshake(&mut reader, 0x0103).await;

    // requested services are re-requested before the service re-appears
    reader
        .expect("re-request", |c| {
            matches!(c, Command::RequestService { services } if services[0].service == 0x3333)
        })
        .await;

    write_command(&mut host_out, ROUTING_CLIENT, add_service_instance(0x0105, provider_addr)).await;

    let frame = tokio::time::timeout(Duration::from_secs(2), provider_rx.recv())
        .await
        .expect("subscribe replayed")
        .unwrap();
    assert!(matches!(frame.command, Command::Subscribe { .. }));
    assert!(
        tokio::time::timeout(Duration::from_millis(150), provider_rx.recv())
            .await
            .is_err(),
        "subscribe replayed more than once"
    );

    client.stop();
}

#[test_log::test(tokio::test)]
async fn keepalive_pings_and_reconnects_on_silence() {
    let host_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host_addr = host_listener.local_addr().unwrap();

    let config = Config::builder()
        .application_name("keepalive")
        .routing_address(host_addr)
        .connect_timeout(Duration::from_millis(20))
        .keepalive_interval(Duration::from_millis(50))
        .build();
    let app = Arc::new(TestApp::default());
    let _client = RoutingClient::start(config, app);

    let (conn, _) = host_listener.accept().await.unwrap();
    let mut reader = FrameReader::new(conn);
    let _host_out = complete_handshake(&mut reader, 0x0103).await;

    // answer the first probe
    reader
        .expect("first Ping", |c| matches!(c, Command::Ping))
        .await;
    reader.write(ROUTING_CLIENT, Command::Pong).await;

    // ignore the following probes: the client declares the host dead and
    // reconnects
    let (conn, _) = tokio::time::timeout(Duration::from_secs(3), host_listener.accept())
        .await
        .expect("client reconnects after keepalive failure")
        .unwrap();
    let mut reader = FrameReader::new(conn);
    reader
        .expect("AssignClient after reconnect", |c| {
            matches!(c, Command::AssignClient { .. })
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn pings_from_host_are_answered() {
    let host_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host_addr = host_listener.local_addr().unwrap();

    let app = Arc::new(TestApp::default());
    let client = RoutingClient::start(test_config(host_addr, "pong"), app);

    let (conn, _) = host_listener.accept().await.unwrap();
    let mut reader = FrameReader::new(conn);
    let mut host_out = complete_handshake(&mut reader, 0x0103).await;

    write_command(&mut host_out, ROUTING_CLIENT, Command::Ping).await;
    let frame = reader
        .expect("Pong", |c| matches!(c, Command::Pong))
        .await;
    assert_eq!(frame.client, 0x0103);

    client.stop();
}

#[test_log::test(tokio::test)]
async fn stop_sends_deregister() {
    let host_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host_addr = host_listener.local_addr().unwrap();

    let app = Arc::new(TestApp::default());
    let client = RoutingClient::start(test_config(host_addr, "stopper"), app);

    let (conn, _) = host_listener.accept().await.unwrap();
    let mut reader = FrameReader::new(conn);
    let mut host_out = complete_handshake(&mut reader, 0x0103).await;

    client.stop();
    reader
        .expect("DeregisterApplication", |c| {
            matches!(c, Command::DeregisterApplication)
        })
        .await;

    // the host confirms with a delete-client entry
    write_command(
        &mut host_out,
        ROUTING_CLIENT,
        Command::RoutingInfo {
            entries: vec![RoutingEntry {
                entry_type: RoutingEntryType::DeleteClient,
                client: 0x0103,
                endpoint: None,
                services: vec![],
            }],
        },
    )
    .await;

    // the sender connection closes
    tokio::time::timeout(Duration::from_secs(2), async {
        while reader.next().await.is_some() {}
    })
    .await
    .expect("connection closed after deregistration");
}
