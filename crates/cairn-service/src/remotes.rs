//! Remote directory — every peer that has announced and not yet expired.
//!
//! Updates follow timestamp-ordered last-writer-wins with a strict
//! greater-than rule: a record whose `time_ns` is less than or equal to
//! the stored one is dropped. Both ingress paths (UDP packets and object
//! store scans) land here and compare on the same nanosecond scale.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use cairn_core::node::Node;

/// A peer silent for this long is dropped from the directory, and its
/// object-store record is deleted on the next scan.
pub const EXPIRE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub struct RemoteEntry {
    pub addr: SocketAddr,
    pub node: Node,
}

pub struct RemoteDirectory {
    port: u16,
    entries: DashMap<String, RemoteEntry>,
}

impl RemoteDirectory {
    /// `port` is the peer-to-peer UDP port used to resolve announcement
    /// addresses for newly discovered peers.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            entries: DashMap::new(),
        }
    }

    /// Whether a record stamped `time_ns` would replace the stored entry.
    pub fn updatable(&self, ip_addr: &str, time_ns: i64) -> bool {
        match self.entries.get(ip_addr) {
            Some(entry) => entry.node.time_ns < time_ns,
            None => true,
        }
    }

    /// Apply last-writer-wins by `time_ns`. Records that do not win are
    /// silently dropped. Returns the resolved UDP address when the peer
    /// was not previously known — the signal for the transmit loop to
    /// reply immediately with our own full state.
    pub fn update(&self, node: Node) -> Option<SocketAddr> {
        let ip: IpAddr = match node.ip_addr.parse() {
            Ok(ip) => ip,
            Err(_) => {
                tracing::error!(ip_addr = %node.ip_addr, "unresolvable peer address");
                return None;
            }
        };

        match self.entries.entry(node.ip_addr.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().node.time_ns >= node.time_ns {
                    return None;
                }
                occupied.get_mut().node = node;
                None
            }
            Entry::Vacant(vacant) => {
                let addr = SocketAddr::new(ip, self.port);
                tracing::debug!(peer = %vacant.key(), "new peer");
                vacant.insert(RemoteEntry { addr, node });
                Some(addr)
            }
        }
    }

    /// Remove every entry stamped before the threshold. Returns how many
    /// were removed.
    pub fn expire(&self, threshold_ns: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|ip_addr, entry| {
            let keep = entry.node.time_ns >= threshold_ns;
            if !keep {
                tracing::info!(peer = %ip_addr, "expiring");
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.entries.iter().map(|entry| entry.addr).collect()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.entries.iter().map(|entry| entry.node.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
