//! Primary-peer bookkeeping
//!
//! At most one in-VM client is current at any instant. Any source sending a
//! heartbeat becomes the new peer (trust-on-first-connect is intentional;
//! the socket binds to loopback by default). The last seen address is
//! persisted to a memo file so a restart resumes forwarding without waiting
//! for the next heartbeat. A fixed `--cli` address disables persistence.
//!
//! There is no timeout: a silent peer stays current until another address
//! heartbeats or the process stops.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::RwLock;

const MEMO_FILE: &str = "docker-connector.cli";

pub fn default_memo_path() -> PathBuf {
    std::env::temp_dir().join(MEMO_FILE)
}

pub struct PeerTracker {
    /// Current peer, read by the TUN pump and the control-push path
    current: RwLock<Option<SocketAddr>>,
    /// String form of the last heartbeat source, for change detection.
    /// A memo-loaded peer leaves this empty so the first heartbeat still
    /// counts as an init and triggers a control push.
    last_cli: RwLock<String>,
    memo_path: PathBuf,
    fixed: bool,
}

impl PeerTracker {
    pub fn new(fixed: Option<SocketAddr>, memo_path: PathBuf) -> Self {
        PeerTracker {
            current: RwLock::new(fixed),
            last_cli: RwLock::new(String::new()),
            memo_path,
            fixed: fixed.is_some(),
        }
    }

    /// Adopt the memo-file peer, if any. No-op with a fixed peer.
    pub fn load_memo(&self) {
        if self.fixed {
            return;
        }
        match fs::read_to_string(&self.memo_path) {
            Ok(saved) => match saved.trim().parse::<SocketAddr>() {
                Ok(addr) => {
                    tracing::info!("loaded saved peer {}", addr);
                    *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);
                }
                Err(e) => {
                    tracing::warn!("failed to parse saved peer '{}': {}", saved.trim(), e);
                }
            },
            Err(_) => {
                tracing::info!("no saved peer info, waiting for client connection");
            }
        }
    }

    pub fn current(&self) -> Option<SocketAddr> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a heartbeat source. Returns true when the peer changed (first
    /// contact included), in which case the caller pushes a control frame.
    pub fn observe_heartbeat(&self, from: SocketAddr) -> bool {
        let cli = from.to_string();
        {
            let mut last = self.last_cli.write().unwrap_or_else(|e| e.into_inner());
            if *last == cli {
                tracing::debug!("client heartbeat => {}", from);
                return false;
            }
            if last.is_empty() {
                tracing::info!("client init => {}", from);
            } else {
                tracing::info!("client change from {} to {}", last, from);
            }
            *last = cli.clone();
            *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(from);
        }
        if !self.fixed {
            if let Err(e) = fs::write(&self.memo_path, &cli) {
                tracing::warn!("failed to save peer info: {}", e);
            }
        }
        true
    }
}
