//! Datagram processing path: crafted packets with synthetic origins.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use cairn_core::node::{self, Node};
use cairn_core::packet::{self, PacketMode};
use cairn_service::net::process_datagram;
use cairn_service::RemoteDirectory;

const PORT: u16 = 17106;

fn modes() -> HashMap<u8, PacketMode> {
    let mode = PacketMode::new(0, b"secret".to_vec());
    HashMap::from([(mode.id, mode)])
}

fn announcement(ip_addr: &str, time_ns: i64, pairs: &[(&str, &str)]) -> Vec<u8> {
    let record = Node {
        ip_addr: ip_addr.into(),
        time_ns,
        features: pairs
            .iter()
            .map(|(name, value)| (name.to_string(), serde_json::from_str(value).unwrap()))
            .collect(),
    };
    packet::encode(&record, &PacketMode::new(0, b"secret".to_vec())).unwrap()
}

fn origin(ip: &str) -> SocketAddr {
    format!("{ip}:{PORT}").parse().unwrap()
}

struct Channels {
    notify_tx: mpsc::Sender<()>,
    notify_rx: mpsc::Receiver<()>,
    reply_tx: mpsc::Sender<Vec<SocketAddr>>,
    reply_rx: mpsc::Receiver<Vec<SocketAddr>>,
}

fn channels() -> Channels {
    let (notify_tx, notify_rx) = mpsc::channel(1);
    let (reply_tx, reply_rx) = mpsc::channel(16);
    Channels {
        notify_tx,
        notify_rx,
        reply_tx,
        reply_rx,
    }
}

#[tokio::test]
async fn valid_packet_updates_directory_and_queues_reply() {
    let remotes = RemoteDirectory::new(PORT);
    let mut ch = channels();

    let data = announcement("10.0.0.2", node::now_ns(), &[("foo", "true")]);
    process_datagram(
        &data,
        origin("10.0.0.2"),
        &remotes,
        &modes(),
        &ch.notify_tx,
        &ch.reply_tx,
    )
    .await;

    assert_eq!(remotes.len(), 1);
    let record = &remotes.nodes()[0];
    assert_eq!(record.ip_addr, "10.0.0.2");
    assert_eq!(record.features["foo"].get(), "true");

    assert!(ch.notify_rx.try_recv().is_ok(), "materializer was not pulsed");
    assert_eq!(
        ch.reply_rx.try_recv().unwrap(),
        [origin("10.0.0.2")],
        "new peer was not queued for fast reply"
    );
}

#[tokio::test]
async fn known_peer_produces_no_reply_target() {
    let remotes = RemoteDirectory::new(PORT);
    let mut ch = channels();

    let first = announcement("10.0.0.2", node::now_ns(), &[]);
    process_datagram(&first, origin("10.0.0.2"), &remotes, &modes(), &ch.notify_tx, &ch.reply_tx)
        .await;
    ch.reply_rx.try_recv().unwrap();

    let second = announcement("10.0.0.2", node::now_ns(), &[("foo", "1")]);
    process_datagram(&second, origin("10.0.0.2"), &remotes, &modes(), &ch.notify_tx, &ch.reply_tx)
        .await;

    assert!(ch.reply_rx.try_recv().is_err());
    assert_eq!(remotes.nodes()[0].features["foo"].get(), "1");
}

#[tokio::test]
async fn replayed_packet_is_rejected_by_timestamp() {
    let remotes = RemoteDirectory::new(PORT);
    let ch = channels();

    let t1 = node::now_ns();
    let captured = announcement("10.0.0.2", t1, &[("x", "1")]);

    let t2 = node::now_ns();
    let fresh = announcement("10.0.0.2", t2, &[("x", "2")]);

    process_datagram(&fresh, origin("10.0.0.2"), &remotes, &modes(), &ch.notify_tx, &ch.reply_tx)
        .await;
    // The attacker re-sends the packet captured at t1 < t2.
    process_datagram(&captured, origin("10.0.0.2"), &remotes, &modes(), &ch.notify_tx, &ch.reply_tx)
        .await;

    assert_eq!(remotes.nodes()[0].time_ns, t2);
    assert_eq!(remotes.nodes()[0].features["x"].get(), "2");
}

#[tokio::test]
async fn corrupted_packet_leaves_directory_unchanged() {
    let remotes = RemoteDirectory::new(PORT);
    let ch = channels();

    let mut data = announcement("10.0.0.2", node::now_ns(), &[("x", "1")]);
    let last = data.len() - 1;
    data[last] ^= 0x01;

    process_datagram(&data, origin("10.0.0.2"), &remotes, &modes(), &ch.notify_tx, &ch.reply_tx)
        .await;

    assert!(remotes.is_empty());
}

#[tokio::test]
async fn spoofed_origin_is_rejected() {
    let remotes = RemoteDirectory::new(PORT);
    let ch = channels();

    let data = announcement("10.0.0.2", node::now_ns(), &[]);
    process_datagram(&data, origin("10.0.0.9"), &remotes, &modes(), &ch.notify_tx, &ch.reply_tx)
        .await;

    assert!(remotes.is_empty());
}

#[tokio::test]
async fn non_unicast_origin_is_rejected() {
    let remotes = RemoteDirectory::new(PORT);
    let ch = channels();

    let data = announcement("127.0.0.1", node::now_ns(), &[]);
    process_datagram(&data, origin("127.0.0.1"), &remotes, &modes(), &ch.notify_tx, &ch.reply_tx)
        .await;

    assert!(remotes.is_empty());
}

#[tokio::test]
async fn stale_timestamp_is_fenced() {
    let remotes = RemoteDirectory::new(PORT);
    let ch = channels();

    let stale = node::now_ns() - 16_000_000_000;
    let data = announcement("10.0.0.2", stale, &[]);
    process_datagram(&data, origin("10.0.0.2"), &remotes, &modes(), &ch.notify_tx, &ch.reply_tx)
        .await;

    assert!(remotes.is_empty());
}

#[tokio::test]
async fn unknown_mode_is_rejected() {
    let remotes = RemoteDirectory::new(PORT);
    let ch = channels();

    let mode = PacketMode::new(3, b"other".to_vec());
    let record = Node {
        ip_addr: "10.0.0.2".into(),
        time_ns: node::now_ns(),
        ..Node::default()
    };
    let data = packet::encode(&record, &mode).unwrap();

    process_datagram(&data, origin("10.0.0.2"), &remotes, &modes(), &ch.notify_tx, &ch.reply_tx)
        .await;

    assert!(remotes.is_empty());
}
