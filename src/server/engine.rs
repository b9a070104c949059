use crate::codec::control::ControlFrame;
use crate::codec::frame::{self, Datagram};
use crate::server::config::{ConfigStore, DynamicConfig};
use crate::server::peer::PeerTracker;
use crate::server::session::SessionTable;
use crate::utils::device::DeviceHandler;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Per-read buffer for the primary socket
const READ_BUFFER_SIZE: usize = 2000;

/// Outbound side of the primary socket.
///
/// All sends go through this so one control frame (header plus payload
/// fragments) is never interleaved with a data send. The guard is held
/// only for the duration of a single datagram or a single control frame.
pub struct ControlLink {
    socket: Arc<UdpSocket>,
    send_guard: Mutex<()>,
    mtu: u16,
}

impl ControlLink {
    pub fn new(socket: Arc<UdpSocket>, mtu: u16) -> Self {
        ControlLink {
            socket,
            send_guard: Mutex::new(()),
            mtu,
        }
    }

    /// Forward one data datagram to the peer
    pub async fn send_data(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        let _guard = self.send_guard.lock().await;
        self.socket.send_to(buf, to).await
    }

    /// Encode and send a full control frame: header first, then the payload
    /// in MTU-sized datagrams, in order. Nothing is sent for empty tables.
    pub async fn push(&self, cfg: &DynamicConfig, to: SocketAddr) -> crate::Result<()> {
        let frame = match ControlFrame::encode(&cfg.intents, &cfg.hosts)? {
            Some(frame) => frame,
            None => {
                tracing::info!("no controls to send to client {}", to);
                return Ok(());
            }
        };

        let _guard = self.send_guard.lock().await;
        self.socket.send_to(&frame.header(), to).await?;
        let mut chunks = 0;
        for chunk in frame.chunks(self.mtu as usize) {
            self.socket.send_to(chunk, to).await?;
            chunks += 1;
        }
        tracing::info!(
            "sent control frame to {}: {} bytes in {} chunks",
            to,
            frame.len(),
            chunks
        );
        Ok(())
    }
}

/// The tunnel engine: owns the primary socket and the TUN handler, runs the
/// UDP receive loop inline and the TUN read loop as a task.
pub struct Engine {
    socket: Arc<UdpSocket>,
    link: Arc<ControlLink>,
    device: Option<DeviceHandler>,
    expose_socket: Option<Arc<UdpSocket>>,
    local_ip: Ipv4Addr,
    bind: bool,
    store: Arc<ConfigStore>,
    peers: Arc<PeerTracker>,
    sessions: Arc<SessionTable>,
    token: CancellationToken,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<UdpSocket>,
        link: Arc<ControlLink>,
        device: Option<DeviceHandler>,
        expose_socket: Option<Arc<UdpSocket>>,
        store: Arc<ConfigStore>,
        peers: Arc<PeerTracker>,
        sessions: Arc<SessionTable>,
        token: CancellationToken,
    ) -> Self {
        let statics = store.statics();
        let local_ip = statics.local_ip();
        let bind = statics.bind;
        Engine {
            socket,
            link,
            device,
            expose_socket,
            local_ip,
            bind,
            store,
            peers,
            sessions,
            token,
        }
    }

    pub async fn run(mut self) -> crate::Result<()> {
        let device_tx = self.device.as_ref().map(|d| d.outbound());
        if let Some(device) = self.device.take() {
            let link = self.link.clone();
            let peers = self.peers.clone();
            let token = self.token.clone();
            let local_ip = self.local_ip;
            tokio::spawn(async move {
                tun_to_udp(device, link, peers, local_ip, token).await;
            });
        } else {
            tracing::info!("not bound to an interface");
        }
        self.recv_loop(device_tx).await
    }

    /// The UDP receive loop. Sole writer of the peer state; classifies every
    /// datagram by its first byte and dispatches to the matching sink.
    async fn recv_loop(self, device_tx: Option<mpsc::Sender<Vec<u8>>>) -> crate::Result<()> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let (n, from) = tokio::select! {
                _ = self.token.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        if self.token.is_cancelled() {
                            break;
                        }
                        tracing::warn!("failed to read udp msg: {}", e);
                        continue;
                    }
                },
            };

            match frame::classify(&buf[..n]) {
                Datagram::Heartbeat => {
                    if self.peers.observe_heartbeat(from) {
                        let cfg = self.store.snapshot();
                        if let Err(e) = self.link.push(&cfg, from).await {
                            tracing::warn!("control push to {} failed: {}", from, e);
                        }
                    }
                }

                Datagram::ConfigPush(payload) => {
                    tracing::debug!("client config push from {}: {} bytes", from, payload.len());
                    if let Err(e) = self.store.append(payload) {
                        tracing::warn!("failed to append client config: {}", e);
                    }
                }

                Datagram::Data(view) => {
                    let session = if view.invalid() {
                        None
                    } else {
                        self.sessions.lookup(view.dst())
                    };

                    if let Some(target) = session {
                        tracing::debug!("session forward {} bytes to {}", n, target);
                        match &self.expose_socket {
                            Some(expose) => {
                                if let Err(e) = expose.send_to(&buf[..n], target).await {
                                    tracing::warn!(
                                        "session write error: {} bytes to {}: {}",
                                        n,
                                        target,
                                        e
                                    );
                                }
                            }
                            None => {
                                tracing::warn!(
                                    "session for {} without expose socket, dropping",
                                    view.dst()
                                );
                            }
                        }
                    } else if self.bind {
                        match &device_tx {
                            Some(tx) => {
                                if !view.invalid() {
                                    tracing::debug!(
                                        "udp -> tun {} bytes {} => {}",
                                        n,
                                        view.src(),
                                        view.dst()
                                    );
                                }
                                // best effort, no backpressure: drop on a full queue
                                if tx.try_send(buf[..n].to_vec()).is_err() {
                                    tracing::warn!("tun queue unavailable, dropping {} bytes", n);
                                }
                            }
                            None => {
                                tracing::warn!("interface not available, dropping packet");
                            }
                        }
                    } else {
                        tracing::debug!("not bound to an interface, skipping packet write");
                    }
                }
            }
        }
        tracing::debug!("udp receive loop stopped");
        Ok(())
    }
}

/// The TUN read loop. Packets addressed to the local overlay address loop
/// straight back into the interface; everything else goes to the current
/// peer as a single datagram, or is dropped when no peer is known yet.
async fn tun_to_udp(
    mut device: DeviceHandler,
    link: Arc<ControlLink>,
    peers: Arc<PeerTracker>,
    local_ip: Ipv4Addr,
    token: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => break,
            packet = device.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        if packet.len() >= frame::MIN_IPV4_LEN {
            let view = frame::PacketView::new(&packet);
            if view.dst() == local_ip {
                tracing::debug!("loopback packet to {}", local_ip);
                if let Err(e) = device.send(packet).await {
                    tracing::warn!("local write error: {}", e);
                }
                continue;
            }
            tracing::debug!("tun -> udp {} bytes {} => {}", packet.len(), view.src(), view.dst());
        }

        let Some(peer) = peers.current() else {
            tracing::warn!("no client connected, dropping {} byte packet", packet.len());
            continue;
        };
        if let Err(e) = link.send_data(&packet, peer).await {
            tracing::warn!("udp write error to client {}: {}", peer, e);
        }
    }
    tracing::debug!("tun read loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x45;
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt
    }

    fn temp_memo(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dc-engine-{}-{}", std::process::id(), tag))
    }

    #[tokio::test]
    async fn tun_packet_to_local_ip_loops_back() {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let device = DeviceHandler::from_channels(inbound_rx, outbound_tx);

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let link = Arc::new(ControlLink::new(socket, 1400));
        let peers = Arc::new(PeerTracker::new(None, temp_memo("loopback")));
        let local_ip = Ipv4Addr::new(192, 168, 251, 2);
        let token = CancellationToken::new();

        tokio::spawn(tun_to_udp(device, link, peers, local_ip, token.clone()));

        let pkt = ipv4_packet([192, 168, 251, 1], [192, 168, 251, 2]);
        inbound_tx.send(pkt.clone()).await.unwrap();

        let looped = timeout(Duration::from_secs(1), outbound_rx.recv())
            .await
            .expect("expected loopback write")
            .unwrap();
        assert_eq!(looped, pkt);
        token.cancel();
    }

    #[tokio::test]
    async fn tun_packet_is_forwarded_to_peer_verbatim() {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, _outbound_rx) = mpsc::channel(16);
        let device = DeviceHandler::from_channels(inbound_rx, outbound_tx);

        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_socket.local_addr().unwrap();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let link = Arc::new(ControlLink::new(socket, 1400));
        let peers = Arc::new(PeerTracker::new(Some(peer_addr), temp_memo("forward")));
        let local_ip = Ipv4Addr::new(192, 168, 251, 2);
        let token = CancellationToken::new();

        tokio::spawn(tun_to_udp(device, link, peers, local_ip, token.clone()));

        let pkt = ipv4_packet([192, 168, 251, 2], [172, 17, 0, 2]);
        inbound_tx.send(pkt.clone()).await.unwrap();

        let mut buf = vec![0u8; 2000];
        let (n, _) = timeout(Duration::from_secs(1), peer_socket.recv_from(&mut buf))
            .await
            .expect("expected forwarded datagram")
            .unwrap();
        assert_eq!(&buf[..n], pkt.as_slice());
        token.cancel();
    }

    #[tokio::test]
    async fn tun_packet_without_peer_is_dropped() {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let device = DeviceHandler::from_channels(inbound_rx, outbound_tx);

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let link = Arc::new(ControlLink::new(socket, 1400));
        let memo = temp_memo("drop");
        std::fs::remove_file(&memo).ok();
        let peers = Arc::new(PeerTracker::new(None, memo));
        let token = CancellationToken::new();

        tokio::spawn(tun_to_udp(
            device,
            link,
            peers,
            Ipv4Addr::new(192, 168, 251, 2),
            token.clone(),
        ));

        let pkt = ipv4_packet([192, 168, 251, 2], [172, 17, 0, 2]);
        inbound_tx.send(pkt).await.unwrap();

        // neither looped back nor anything else to observe: the packet is gone
        let looped = timeout(Duration::from_millis(200), outbound_rx.recv()).await;
        assert!(looped.is_err());
        token.cancel();
    }
}
