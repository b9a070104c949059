//! Accessor listener
//!
//! A secondary UDP socket that re-exposes the tunnel to third-party
//! tenants. A tenant sends raw IPv4 packets here; the source overlay
//! address of each packet is recorded in the session table so replies
//! arriving on the primary socket can be redirected back, and the packet
//! itself is forwarded to the current primary peer.

use crate::codec::frame::{PacketView, MIN_IPV4_LEN};
use crate::server::engine::ControlLink;
use crate::server::peer::PeerTracker;
use crate::server::session::SessionTable;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 2000;

pub struct Accessor {
    socket: Arc<UdpSocket>,
    link: Arc<ControlLink>,
    peers: Arc<PeerTracker>,
    sessions: Arc<SessionTable>,
    token: CancellationToken,
}

impl Accessor {
    pub fn new(
        socket: Arc<UdpSocket>,
        link: Arc<ControlLink>,
        peers: Arc<PeerTracker>,
        sessions: Arc<SessionTable>,
        token: CancellationToken,
    ) -> Self {
        Accessor {
            socket,
            link,
            peers,
            sessions,
            token,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(self) {
        match self.socket.local_addr() {
            Ok(addr) => tracing::info!("accessor listening on {}", addr),
            Err(_) => tracing::info!("accessor listening"),
        }
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
                        tracing::warn!("accessor read error: {}", e);
                        continue;
                    }
                },
            };

            let view = PacketView::new(&buf[..n]);
            if n < MIN_IPV4_LEN || view.version() != 4 {
                tracing::debug!("accessor ignoring non-ipv4 datagram from {}", from);
                continue;
            }

            self.sessions.insert(view.src(), from);

            let Some(peer) = self.peers.current() else {
                tracing::warn!("no client connected, dropping exposed packet from {}", from);
                continue;
            };
            if let Err(e) = self.link.send_data(&buf[..n], peer).await {
                tracing::warn!("accessor forward error to {}: {}", peer, e);
            }
        }
        tracing::debug!("accessor stopped");
    }
}
