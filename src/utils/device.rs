use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tun::AbstractDevice;

const CHANNEL_CAPACITY: usize = 1000;

/// Per-read buffer for the TUN device
const READ_BUFFER_SIZE: usize = 2000;

/// Parameters for the point-to-point TUN interface
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Address assigned to the interface (the host end of the pair)
    pub local_ip: Ipv4Addr,
    /// Far end of the pair, taken by the in-VM client
    pub peer_ip: Ipv4Addr,
    /// Overlay network the pair lives in
    pub subnet: Ipv4Net,
    pub mtu: u16,
}

/// Handle to the TUN pump task
///
/// The device task owns the TUN handle; the engine talks to it over bounded
/// channels. `recv` yields packets read from the interface, `send` queues a
/// packet for injection into it.
pub struct DeviceHandler {
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
}

impl DeviceHandler {
    /// Create the TUN interface and spawn its pump task.
    ///
    /// Failure here surfaces the platform error to the caller; when `bind`
    /// is requested this is fatal at startup.
    pub fn open(cfg: TunConfig, token: CancellationToken) -> crate::Result<DeviceHandler> {
        let mut config = tun::Configuration::default();
        config
            .address(cfg.local_ip.to_string())
            .destination(cfg.peer_ip.to_string())
            .netmask(cfg.subnet.netmask().to_string())
            .mtu(cfg.mtu)
            .up();

        #[cfg(target_os = "linux")]
        config.platform_config(|config| {
            config.ensure_root_privileges(true);
        });

        let dev = tun::create_as_async(&config)?;
        match dev.tun_name() {
            Ok(name) => tracing::info!(
                "tun interface {} up: {} -> {} in {}",
                name,
                cfg.local_ip,
                cfg.peer_ip,
                cfg.subnet
            ),
            Err(_) => tracing::info!("tun interface up: {} -> {}", cfg.local_ip, cfg.peer_ip),
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            pump(dev, inbound_tx, outbound_rx, token).await;
        });

        Ok(DeviceHandler {
            inbound_rx,
            outbound_tx,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_channels(
        inbound_rx: mpsc::Receiver<Vec<u8>>,
        outbound_tx: mpsc::Sender<Vec<u8>>,
    ) -> DeviceHandler {
        DeviceHandler {
            inbound_rx,
            outbound_tx,
        }
    }

    /// Next packet read from the interface; None when the device is gone
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound_rx.recv().await
    }

    /// Queue a packet for injection into the interface
    pub async fn send(&self, packet: Vec<u8>) -> crate::Result<()> {
        self.outbound_tx
            .send(packet)
            .await
            .map_err(|e| e.to_string().into())
    }

    /// A cloneable sender for the injection queue, used by the UDP side
    pub fn outbound(&self) -> mpsc::Sender<Vec<u8>> {
        self.outbound_tx.clone()
    }
}

async fn pump(
    mut dev: tun::AsyncDevice,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            amount = dev.read(&mut buf) => {
                let amount = match amount {
                    Ok(amount) => amount,
                    Err(e) => {
                        if token.is_cancelled() {
                            break;
                        }
                        tracing::warn!("tun read error: {}", e);
                        continue;
                    }
                };
                if inbound_tx.send(buf[..amount].to_vec()).await.is_err() {
                    break;
                }
            }

            packet = outbound_rx.recv() => {
                let Some(packet) = packet else { break };
                if let Err(e) = dev.write(packet.as_slice()).await {
                    tracing::warn!("tun write error: {} bytes, error: {}", packet.len(), e);
                }
            }
        }
    }
    tracing::debug!("tun pump stopped");
}
