/// Integration tests for the tunnel engine
///
/// Exercises the UDP-visible behavior against real loopback sockets:
/// 1. Heartbeat registration, control push and memo persistence
/// 2. Peer change handling
/// 3. Session-table redirects to a secondary socket
/// 4. Client-pushed config appends
/// 5. Control frame fragmentation at the MTU
/// 6. Accessor session learning and forwarding
///
/// The engine runs without a TUN interface (bind false); the TUN paths are
/// covered by unit tests next to the engine.

use docker_connector::server::accessor::Accessor;
use docker_connector::server::config::{ConfigStore, DynamicConfig, StaticConfig};
use docker_connector::server::engine::{ControlLink, Engine};
use docker_connector::server::peer::PeerTracker;
use docker_connector::server::session::SessionTable;
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dc-it-{}-{}", std::process::id(), tag))
}

fn statics() -> StaticConfig {
    StaticConfig {
        addr: "192.168.251.1/24".parse().unwrap(),
        port: 0,
        host: Ipv4Addr::LOCALHOST,
        mtu: 1400,
        bind: false,
        tokens: HashMap::new(),
        expose: None,
    }
}

fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
    let mut pkt = vec![0u8; 40];
    pkt[0] = 0x45;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt
}

struct Harness {
    server_addr: std::net::SocketAddr,
    store: Arc<ConfigStore>,
    sessions: Arc<SessionTable>,
    memo: PathBuf,
    config: PathBuf,
    token: CancellationToken,
}

/// Start an engine without a TUN interface on an ephemeral port.
async fn start_engine(tag: &str, config_content: &str, expose: Option<Arc<UdpSocket>>) -> Harness {
    let config = temp_path(&format!("{}-conf", tag));
    fs::write(&config, config_content).unwrap();
    let store = Arc::new(ConfigStore::load(config.clone(), statics()).unwrap());

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let server_addr = socket.local_addr().unwrap();
    let link = Arc::new(ControlLink::new(socket.clone(), 1400));

    let memo = temp_path(&format!("{}-memo", tag));
    fs::remove_file(&memo).ok();
    let peers = Arc::new(PeerTracker::new(None, memo.clone()));
    let sessions = Arc::new(SessionTable::new());
    let token = CancellationToken::new();

    let engine = Engine::new(
        socket,
        link,
        None,
        expose,
        store.clone(),
        peers,
        sessions.clone(),
        token.clone(),
    );
    tokio::spawn(engine.run());

    Harness {
        server_addr,
        store,
        sessions,
        memo,
        config,
        token,
    }
}

impl Harness {
    fn cleanup(&self) {
        self.token.cancel();
        fs::remove_file(&self.memo).ok();
        fs::remove_file(&self.config).ok();
    }
}

/// Receive the control frame following a heartbeat: the 3-byte header and
/// then payload datagrams until the announced length is complete.
async fn recv_control(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for control header")
        .unwrap();
    assert_eq!(n, 3, "expected a 3-byte control header");
    assert_eq!(buf[0], 0x01);
    let len = ((buf[1] as usize) << 8) | buf[2] as usize;

    let mut payload = Vec::with_capacity(len);
    while payload.len() < len {
        let (n, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for control payload")
            .unwrap();
        payload.extend_from_slice(&buf[..n]);
    }
    assert_eq!(payload.len(), len);
    payload
}

#[tokio::test]
async fn heartbeat_registers_peer_and_pushes_controls() {
    let harness = start_engine("hb", "iptables 10.0.1.0+10.0.2.0\nhosts 1.1.1.1 a\n", None).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&[0u8], harness.server_addr).await.unwrap();

    let payload = recv_control(&client).await;
    assert_eq!(payload, b"connect 10.0.1.0+10.0.2.0\n1.1.1.1 a\n");

    // peer memo persisted as ASCII host:port
    let saved = fs::read_to_string(&harness.memo).unwrap();
    assert_eq!(saved, client.local_addr().unwrap().to_string());

    // a repeated heartbeat from the same source pushes nothing
    client.send_to(&[0u8], harness.server_addr).await.unwrap();
    let mut buf = [0u8; 64];
    let silent = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(silent.is_err(), "unchanged peer must not trigger a push");

    harness.cleanup();
}

#[tokio::test]
async fn heartbeat_with_empty_tables_sends_no_header() {
    let harness = start_engine("hb-empty", "", None).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&[0u8], harness.server_addr).await.unwrap();

    let mut buf = [0u8; 64];
    let silent = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(silent.is_err(), "empty payload must suppress the header");

    harness.cleanup();
}

#[tokio::test]
async fn peer_change_pushes_to_the_new_address() {
    let harness = start_engine("change", "iptables 10.0.1.0+10.0.2.0\n", None).await;

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    first.send_to(&[0u8], harness.server_addr).await.unwrap();
    recv_control(&first).await;

    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    second.send_to(&[0u8], harness.server_addr).await.unwrap();
    let payload = recv_control(&second).await;
    assert_eq!(payload, b"connect 10.0.1.0+10.0.2.0");

    let saved = fs::read_to_string(&harness.memo).unwrap();
    assert_eq!(saved, second.local_addr().unwrap().to_string());

    harness.cleanup();
}

#[tokio::test]
async fn session_hit_redirects_to_secondary_socket() {
    let expose = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let harness = start_engine("session", "", Some(expose)).await;

    let tenant = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    harness
        .sessions
        .insert(Ipv4Addr::new(1, 2, 3, 4), tenant.local_addr().unwrap());

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let pkt = ipv4_packet([172, 17, 0, 2], [1, 2, 3, 4]);
    client.send_to(&pkt, harness.server_addr).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(RECV_TIMEOUT, tenant.recv_from(&mut buf))
        .await
        .expect("expected redirected datagram")
        .unwrap();
    assert_eq!(&buf[..n], pkt.as_slice());

    harness.cleanup();
}

#[tokio::test]
async fn client_config_push_appends_to_the_file() {
    let harness = start_engine("push", "route 172.17.0.0/16\n", None).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut msg = vec![0x01u8];
    msg.extend_from_slice(b"route 172.21.0.0/16\n");
    client.send_to(&msg, harness.server_addr).await.unwrap();

    // give the receive loop a moment to write the file
    tokio::time::sleep(Duration::from_millis(300)).await;
    let content = fs::read_to_string(&harness.config).unwrap();
    assert!(content.ends_with("route 172.21.0.0/16\n"));

    // no other side effect: nothing comes back to the client
    let mut buf = [0u8; 64];
    let silent = timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
    assert!(silent.is_err());

    // the appended route shows up as a reload delta
    let outcome = harness.store.reload().unwrap();
    assert_eq!(outcome.delta.added, vec!["172.21.0.0/16".parse().unwrap()]);

    harness.cleanup();
}

#[tokio::test]
async fn large_control_payload_is_fragmented_in_order() {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let link = ControlLink::new(socket, 1400);

    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let cfg = DynamicConfig {
        hosts: "x".repeat(3200),
        ..DynamicConfig::default()
    };
    link.push(&cfg, receiver.local_addr().unwrap()).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(RECV_TIMEOUT, receiver.recv_from(&mut buf))
        .await
        .expect("expected header")
        .unwrap();
    assert_eq!(n, 3);
    assert_eq!(buf[..3], [0x01, (3200u16 >> 8) as u8, (3200u16 & 0xff) as u8]);

    let mut sizes = Vec::new();
    let mut total = 0;
    while total < 3200 {
        let (n, _) = timeout(RECV_TIMEOUT, receiver.recv_from(&mut buf))
            .await
            .expect("expected payload chunk")
            .unwrap();
        sizes.push(n);
        total += n;
    }
    assert_eq!(sizes, vec![1400, 1400, 400]);
}

#[tokio::test]
async fn accessor_learns_sessions_and_forwards_to_peer() {
    let main_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let link = Arc::new(ControlLink::new(main_socket, 1400));

    let vm_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let memo = temp_path("accessor-memo");
    let peers = Arc::new(PeerTracker::new(
        Some(vm_peer.local_addr().unwrap()),
        memo.clone(),
    ));
    let sessions = Arc::new(SessionTable::new());
    let token = CancellationToken::new();

    let expose = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let expose_addr = expose.local_addr().unwrap();
    Accessor::new(
        expose,
        link,
        peers,
        sessions.clone(),
        token.clone(),
    )
    .spawn();

    let tenant = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let pkt = ipv4_packet([9, 9, 9, 9], [172, 17, 0, 2]);
    tenant.send_to(&pkt, expose_addr).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(RECV_TIMEOUT, vm_peer.recv_from(&mut buf))
        .await
        .expect("expected forwarded packet")
        .unwrap();
    assert_eq!(&buf[..n], pkt.as_slice());

    assert_eq!(
        sessions.lookup(Ipv4Addr::new(9, 9, 9, 9)),
        Some(tenant.local_addr().unwrap())
    );

    token.cancel();
    fs::remove_file(&memo).ok();
}
