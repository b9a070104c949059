//! Session table: destination overlay IP -> secondary UDP address
//!
//! Written by the accessor, read by the engine once per inbound data packet.
//! A hit redirects the packet to the mapped tenant address instead of the
//! local TUN.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::RwLock;

pub struct SessionTable {
    entries: RwLock<HashMap<Ipv4Addr, SocketAddr>>,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, dest: Ipv4Addr, target: SocketAddr) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.insert(dest, target) {
            None => tracing::info!("session init {} => {}", dest, target),
            Some(prev) if prev != target => {
                tracing::info!("session change {} => {} (was {})", dest, target, prev)
            }
            Some(_) => {}
        }
    }

    pub fn lookup(&self, dest: Ipv4Addr) -> Option<SocketAddr> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&dest)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
