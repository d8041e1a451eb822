//! End-to-end train scheduling behavior over a loopback UDP endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use routeip::endpoint::udp::{UdpHost, UdpServerEndpoint};
use routeip::wire::{self, Header};
use routeip::Config;

struct NullHost;

impl UdpHost for NullHost {
    fn on_message(&self, _message: Bytes, _remote: SocketAddr, _is_multicast: bool) {}
}

fn build_message(service: u16, method: u16, fill: u8, payload_len: usize) -> Bytes {
    let header = Header {
        service,
        method,
        length: (8 + payload_len) as u32,
        client: 0x0101,
        session: 0x0001,
        protocol_version: wire::PROTOCOL_VERSION,
        interface_version: 0x01,
        message_type_raw: 0x02,
        return_code: 0x00,
    };
    let mut buf = BytesMut::new();
    header.serialize(&mut buf);
    buf.put_bytes(fill, payload_len);
    buf.freeze()
}

async fn start_endpoint(config: Config) -> (UdpServerEndpoint, Arc<dyn UdpHost>) {
    let host: Arc<dyn UdpHost> = Arc::new(NullHost);
    let endpoint = UdpServerEndpoint::start(Arc::new(config), Arc::downgrade(&host))
        .await
        .expect("endpoint starts");
    (endpoint, host)
}

/// Two messages for distinct methods sharing a 50 ms debounce / 200 ms
/// retention window ride one train: a single transmission at the retention
/// bound, in submission order.
#[test_log::test(tokio::test)]
async fn debounce_admission_coalesces_into_one_train() {
    let config = Config::builder()
        .unicast("127.0.0.1:0".parse().unwrap())
        .timing(
            0x1234,
            0x0001,
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
        .timing(
            0x1234,
            0x0002,
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
        .build();
    let (endpoint, _host) = start_endpoint(config).await;

    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let first = build_message(0x1234, 0x0001, 0xA1, 84);
    let second = build_message(0x1234, 0x0002, 0xB2, 84);

    let submitted = Instant::now();
    assert!(endpoint.send_to(peer_addr, &first));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(endpoint.send_to(peer_addr, &second));

    let mut buf = [0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("train departs")
        .unwrap();
    let elapsed = submitted.elapsed();

    // one datagram holding both messages, in order
    assert_eq!(len, first.len() + second.len());
    assert_eq!(&buf[..first.len()], &first[..]);
    assert_eq!(&buf[first.len()..len], &second[..]);

    // not before the retention deadline of the first admission
    assert!(
        elapsed >= Duration::from_millis(190),
        "train departed after {} ms",
        elapsed.as_millis()
    );

    // and nothing else follows
    let extra = tokio::time::timeout(Duration::from_millis(100), peer.recv_from(&mut buf)).await;
    assert!(extra.is_err(), "unexpected second transmission");

    endpoint.stop();
}

/// A repeated (service, method) forces the current train out immediately;
/// the repeat becomes the next train.
#[test_log::test(tokio::test)]
async fn forced_departure_on_repeated_passenger() {
    let config = Config::builder()
        .unicast("127.0.0.1:0".parse().unwrap())
        .timing(
            0x1234,
            0x0001,
            Duration::ZERO,
            Duration::from_millis(200),
        )
        .build();
    let (endpoint, _host) = start_endpoint(config).await;

    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let first = build_message(0x1234, 0x0001, 0x01, 84);
    let second = build_message(0x1234, 0x0001, 0x02, 84);

    let submitted = Instant::now();
    assert!(endpoint.send_to(peer_addr, &first));
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(endpoint.send_to(peer_addr, &second));

    let mut buf = [0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("first train departs")
        .unwrap();
    let first_elapsed = submitted.elapsed();
    assert_eq!(&buf[..len], &first[..]);
    // departed on the second submission, not at the retention deadline
    assert!(
        first_elapsed < Duration::from_millis(150),
        "first train held back for {} ms",
        first_elapsed.as_millis()
    );

    let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("second train departs")
        .unwrap();
    assert_eq!(&buf[..len], &second[..]);

    endpoint.stop();
}

/// Per-passenger debounce holds between two transmissions of the same
/// (service, method) across consecutive trains.
#[test_log::test(tokio::test)]
async fn debounce_enforced_between_transmissions()
{
    let config = Config::builder()
        .unicast("127.0.0.1:0".parse().unwrap())
        .timing(
            0x1234,
            0x0001,
            Duration::from_millis(80),
            Duration::from_millis(10),
        )
        .build();
    let (endpoint, _host) = start_endpoint(config).await;

    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let first = build_message(0x1234, 0x0001, 0x01, 20);
    let second = build_message(0x1234, 0x0001, 0x02, 20);

    assert!(endpoint.send_to(peer_addr, &first));
    assert!(endpoint.send_to(peer_addr, &second));

    let mut buf = [0u8; 2048];
    tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("first transmission")
        .unwrap();
    let first_arrival = Instant::now();

    tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("second transmission")
        .unwrap();
    let gap = first_arrival.elapsed();
    assert!(
        gap >= Duration::from_millis(70),
        "transmissions only {} ms apart",
        gap.as_millis()
    );

    endpoint.stop();
}
