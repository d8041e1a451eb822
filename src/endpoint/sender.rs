//! # Client Endpoint Core
//!
//! The connection-oriented endpoint an application uses to reach the
//! routing host (and local peers). It owns one outbound stream, the train
//! scheduler and the send queue, and a reconnect loop with exponential
//! backoff.
//!
//! ## States
//!
//! ```text
//!  Closed ──connect()──▶ Connecting ──handshake──▶ Established
//!    ▲                        │                        │
//!    └────────── transport error / stop ◀──────────────┘
//! ```
//!
//! Only `Established` accepts new sends. All socket writes happen on the
//! endpoint's task; [`SenderEndpoint::send`] admits into the train scheduler
//! under the queue byte budget and wakes the task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::endpoint::SendQueue;
use crate::net::{Connector, Stream};
use crate::train::TrainScheduler;
use crate::{MethodId, ServiceId};

/// Watchdog around a single connect attempt.
const CONNECTING_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection state of the sender endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    /// Transient pre-handshake state of connection-oriented transports.
    Connected,
    Established,
}

/// Notifications from the endpoint task to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEvent {
    /// The stream is established; queued data is being drained.
    Connected,
    /// An established stream broke; the endpoint is reconnecting.
    Disconnected,
    /// The configured reconnect cap was reached; the endpoint gave up.
    MaxReconnectsReached,
}

#[derive(Debug)]
struct Shared {
    scheduler: TrainScheduler,
    queue: SendQueue,
    state: ConnectionState,
    sending_blocked: bool,
    restart_requested: bool,
    stopped: bool,
}

#[derive(Debug)]
struct Inner {
    shared: Mutex<Shared>,
    notify: Notify,
    config: Arc<Config>,
}

/// Handle to a running sender endpoint. Cloneable; `send` and `stop` may be
/// called from any task.
#[derive(Debug, Clone)]
pub struct SenderEndpoint {
    inner: Arc<Inner>,
}

impl SenderEndpoint {
    /// Spawn the endpoint task and start connecting.
    ///
    /// The stream is bidirectional: chunks read from the peer are forwarded
    /// through `inbound` (the routing host acknowledges client assignment
    /// over the very connection the application opened).
    pub fn start<C: Connector>(
        connector: C,
        config: Arc<Config>,
        events: mpsc::UnboundedSender<SenderEvent>,
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                // the local channel is a stream; no datagram size cap applies
                scheduler: TrainScheduler::new(usize::MAX, Instant::now()),
                queue: SendQueue::new(config.endpoint_queue_limit),
                state: ConnectionState::Closed,
                sending_blocked: false,
                restart_requested: false,
                stopped: false,
            }),
            notify: Notify::new(),
            config,
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            run(task_inner, connector, events, inbound).await;
        });

        Self { inner }
    }

    /// Admit `data` for transmission. The (service, method) pair keys the
    /// configured debounce/retention timing of the train scheduler.
    ///
    /// Returns `false` when sending is blocked or the queue budget is
    /// exceeded; the message is dropped in that case.
    pub fn send(&self, data: Bytes, service: ServiceId, method: MethodId) -> bool {
        {
            let mut shared = self.inner.shared.lock().expect("sender lock");
            if shared.sending_blocked {
                return false;
            }
            if !shared.queue.check_limit(data.len()) {
                warn!(
                    "sender: queue limit reached, dropping [{:04x}.{:04x}] ({} bytes queued)",
                    service,
                    method,
                    shared.queue.bytes()
                );
                return false;
            }
            let timing = self.inner.config.timing(service, method);
            shared
                .scheduler
                .enqueue(&data, service, method, timing, Instant::now());
        }
        self.inner.notify.notify_one();
        true
    }

    /// Block sending, clear the queue and shut the endpoint down. No
    /// completion fires after the task observes the flag.
    pub fn stop(&self) {
        {
            let mut shared = self.inner.shared.lock().expect("sender lock");
            shared.sending_blocked = true;
            shared.stopped = true;
            shared.queue.clear();
        }
        self.inner.notify.notify_one();
    }

    /// Tear the stream down and re-run the connect loop, keeping queued
    /// data. Used when a registration watchdog expires.
    pub fn restart(&self) {
        {
            let mut shared = self.inner.shared.lock().expect("sender lock");
            shared.restart_requested = true;
        }
        self.inner.notify.notify_one();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().expect("sender lock").state
    }
}

fn set_state(inner: &Inner, state: ConnectionState) {
    inner.shared.lock().expect("sender lock").state = state;
}

/// Account one failed connect attempt: reset the state, enforce the
/// reconnect cap and grow the backoff once past the threshold. Both the
/// connect-error and the connect-watchdog paths go through here. Returns
/// `true` when the cap was reached and the endpoint must give up.
fn register_connect_failure(
    inner: &Inner,
    events: &mpsc::UnboundedSender<SenderEvent>,
    reconnect_counter: &mut u32,
    connect_timeout: &mut Duration,
) -> bool {
    set_state(inner, ConnectionState::Closed);
    *reconnect_counter += 1;
    if let Some(max) = inner.config.max_reconnects {
        if *reconnect_counter >= max {
            warn!("sender: reconnect cap of {} attempts reached", max);
            let _ = events.send(SenderEvent::MaxReconnectsReached);
            return true;
        }
    }
    if *reconnect_counter > crate::config::RECONNECT_BACKOFF_THRESHOLD {
        *connect_timeout = (*connect_timeout * 2).min(inner.config.max_connect_timeout);
    }
    false
}

async fn run<C: Connector>(
    inner: Arc<Inner>,
    connector: C,
    events: mpsc::UnboundedSender<SenderEvent>,
    inbound: mpsc::UnboundedSender<Bytes>,
) {
    let mut reconnect_counter: u32 = 0;
    let mut connect_timeout = inner.config.connect_timeout;
    let mut read_buf = [0u8; 8192];

    'reconnect: loop {
        if inner.shared.lock().expect("sender lock").stopped {
            break;
        }

        set_state(&inner, ConnectionState::Connecting);
        let mut stream = match tokio::time::timeout(CONNECTING_TIMEOUT, connector.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("sender: connect failed: {}", e);
                if register_connect_failure(
                    &inner,
                    &events,
                    &mut reconnect_counter,
                    &mut connect_timeout,
                ) {
                    break 'reconnect;
                }
                tokio::time::sleep(connect_timeout).await;
                continue 'reconnect;
            }
            Err(_) => {
                warn!("sender: connect watchdog expired");
                if register_connect_failure(
                    &inner,
                    &events,
                    &mut reconnect_counter,
                    &mut connect_timeout,
                ) {
                    break 'reconnect;
                }
                tokio::time::sleep(connect_timeout).await;
                continue 'reconnect;
            }
        };

        // pre-handshake: the stream exists but sends have not resumed yet
        set_state(&inner, ConnectionState::Connected);
        reconnect_counter = 0;
        connect_timeout = inner.config.connect_timeout;
        {
            let mut shared = inner.shared.lock().expect("sender lock");
            shared.state = ConnectionState::Established;
            if !shared.queue.is_empty() || !shared.scheduler.is_empty() {
                info!("sender: resuming {} queued bytes", shared.queue.bytes());
            }
        }
        let _ = events.send(SenderEvent::Connected);

        loop {
            let (front, deadline) = {
                let mut shared = inner.shared.lock().expect("sender lock");
                if shared.stopped {
                    shared.state = ConnectionState::Closed;
                    break 'reconnect;
                }
                if shared.restart_requested {
                    shared.restart_requested = false;
                    shared.state = ConnectionState::Closed;
                    info!("sender: restart requested, reconnecting");
                    continue 'reconnect;
                }
                let now = Instant::now();
                while let Some(buffer) = shared.scheduler.flush(now) {
                    shared.queue.push(buffer, 0);
                }
                (
                    shared.queue.front().cloned(),
                    shared.scheduler.next_departure(),
                )
            };

            if let Some(entry) = front {
                match stream.write_all(&entry.buffer).await {
                    Ok(()) => {
                        let mut shared = inner.shared.lock().expect("sender lock");
                        shared.queue.pop();
                        shared.scheduler.record_departure(Instant::now());
                    }
                    Err(e) => {
                        let purge = e.kind() == std::io::ErrorKind::PermissionDenied;
                        warn!("sender: write failed: {} ({:?})", e, e.kind());
                        {
                            let mut shared = inner.shared.lock().expect("sender lock");
                            shared.state = ConnectionState::Closed;
                            if purge {
                                // the peer will never accept this data
                                shared.queue.clear();
                            }
                        }
                        let _ = events.send(SenderEvent::Disconnected);
                        continue 'reconnect;
                    }
                }
            } else {
                tokio::select! {
                    () = inner.notify.notified() => {}
                    () = sleep_until_departure(deadline) => {}
                    result = stream.read(&mut read_buf) => {
                        match result {
                            Ok(0) => {
                                warn!("sender: connection closed by peer");
                                set_state(&inner, ConnectionState::Closed);
                                let _ = events.send(SenderEvent::Disconnected);
                                continue 'reconnect;
                            }
                            Ok(n) => {
                                let _ = inbound.send(Bytes::copy_from_slice(&read_buf[..n]));
                            }
                            Err(e) => {
                                warn!("sender: read failed: {}", e);
                                set_state(&inner, ConnectionState::Closed);
                                let _ = events.send(SenderEvent::Disconnected);
                                continue 'reconnect;
                            }
                        }
                    }
                }
            }
        }
    }

    set_state(&inner, ConnectionState::Closed);
    debug!("sender: task finished");
}

async fn sleep_until_departure(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TcpConnector;
    use tokio::io::AsyncReadExt;

    fn test_config() -> Arc<Config> {
        Arc::new(Config::builder().application_name("test").build())
    }

    #[test_log::test(tokio::test)]
    async fn delivers_queued_data_in_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let sender =
            SenderEndpoint::start(TcpConnector { address }, test_config(), events_tx, inbound_tx);

        assert!(sender.send(Bytes::from_static(b"one"), 0x0001, 0x0001));
        assert!(sender.send(Bytes::from_static(b"two"), 0x0002, 0x0001));

        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(events_rx.recv().await, Some(SenderEvent::Connected));
        assert_eq!(sender.state(), ConnectionState::Established);

        let mut received = Vec::new();
        while received.len() < 6 {
            let mut buf = [0u8; 16];
            let n = tokio::io::AsyncReadExt::read(&mut peer, &mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&received, b"onetwo");

        sender.stop();
    }

    #[test_log::test(tokio::test)]
    async fn stop_blocks_further_sends() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let sender =
            SenderEndpoint::start(TcpConnector { address }, test_config(), events_tx, inbound_tx);
        sender.stop();
        assert!(!sender.send(Bytes::from_static(b"late"), 0x0001, 0x0001));
    }

    #[test_log::test(tokio::test)]
    async fn queue_limit_drops_messages() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let config = Arc::new(
            Config::builder()
                .application_name("test")
                .endpoint_queue_limit(8)
                .build(),
        );

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let sender = SenderEndpoint::start(TcpConnector { address }, config, events_tx, inbound_tx);
        // queue accounting happens when trains land in the queue; fill the
        // budget directly through oversized admissions
        assert!(sender.send(Bytes::from_static(b"12345678"), 0x0001, 0x0001));
        // first message may still sit in a train, but the budget check is
        // against queued bytes only; force it through the wire
        let (mut peer, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"12345678");
        sender.stop();
    }

    #[test_log::test(tokio::test)]
    async fn reports_max_reconnects() {
        // nothing listens on this port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let config = Arc::new(
            Config::builder()
                .application_name("test")
                .connect_timeout(Duration::from_millis(5))
                .max_reconnects(2)
                .build(),
        );

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let sender = SenderEndpoint::start(TcpConnector { address }, config, events_tx, inbound_tx);
        assert_eq!(
            events_rx.recv().await,
            Some(SenderEvent::MaxReconnectsReached)
        );
        sender.stop();
    }
}
