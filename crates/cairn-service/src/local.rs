//! The local node: this host's authoritative announcement state.
//!
//! The node snapshot sits behind an atomic pointer swap. The config
//! watcher is the only writer; the receive, transmit, storage and state
//! tasks read whole snapshots and never observe a torn feature map.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::net::UdpSocket;

use cairn_core::node::{self, FeatureMap, Node};
use cairn_core::packet::{self, PacketError, PacketMode};

use crate::service::ServeError;

pub struct LocalNode {
    ip_addr: String,
    socket: UdpSocket,
    mode: PacketMode,
    node: ArcSwap<Node>,
}

impl LocalNode {
    /// Bind the peer-to-peer UDP socket and start with an empty snapshot.
    pub async fn bind(ip_addr: &str, port: u16, mode: PacketMode) -> Result<Self, ServeError> {
        let ip: IpAddr = ip_addr
            .parse()
            .map_err(|_| ServeError::BadLocalAddr(ip_addr.to_string()))?;

        let addr = SocketAddr::new(ip, port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ServeError::Bind { addr, source })?;

        Ok(Self {
            ip_addr: ip_addr.to_string(),
            socket,
            mode,
            node: ArcSwap::from_pointee(Node::default()),
        })
    }

    pub fn ip_addr(&self) -> &str {
        &self.ip_addr
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// The complete current snapshot.
    pub fn snapshot(&self) -> Arc<Node> {
        self.node.load_full()
    }

    /// Install a new feature map if it differs from the current one.
    /// Returns whether anything changed. Difference is textual: same names
    /// bound to the same raw JSON value bytes compare equal.
    pub fn update_features(&self, new: FeatureMap) -> bool {
        let old = self.node.load();

        if node::features_equal(&old.features, &new) {
            return false;
        }

        self.node.store(Arc::new(Node {
            features: new,
            ..Node::default()
        }));

        true
    }

    /// Encode one announcement packet stamped with the current wall clock.
    /// A goodbye packet announces an empty feature set so receivers expire
    /// this host promptly.
    pub fn encode_packet(&self, goodbye: bool) -> Result<Vec<u8>, PacketError> {
        let node = Node {
            ip_addr: self.ip_addr.clone(),
            time_ns: node::now_ns(),
            features: if goodbye {
                FeatureMap::new()
            } else {
                self.snapshot().features.clone()
            },
        };

        packet::encode(&node, &self.mode)
    }

    /// The object-store body: `{features}` pretty-printed, no addressing.
    /// The store supplies the key and the timestamp.
    pub fn marshal_for_storage(&self) -> serde_json::Result<Vec<u8>> {
        let snapshot = self.snapshot();

        let mut body = serde_json::Map::new();
        if !snapshot.features.is_empty() {
            let mut features = serde_json::Map::new();
            for (name, value) in &snapshot.features {
                features.insert(name.clone(), serde_json::from_str(value.get())?);
            }
            body.insert("features".into(), serde_json::Value::Object(features));
        }

        node::to_pretty_json(&serde_json::Value::Object(body))
    }
}
