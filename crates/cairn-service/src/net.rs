//! UDP receive and transmit loops.
//!
//! Receive drains the socket, authenticates and validates each datagram,
//! and feeds the remote directory. Transmit announces the local state to
//! every known peer on a randomly re-armed interval, in randomly permuted
//! order, so a fleet that started together does not storm together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cairn_core::node;
use cairn_core::packet::{
    self, PacketMode, LARGE_DATAGRAM_SIZE, MAX_DATAGRAM_SIZE, SAFE_DATAGRAM_SIZE,
};

use crate::local::LocalNode;
use crate::remotes::RemoteDirectory;

/// Packets reporting a send time further in the past than this are
/// dropped: the clock-skew fence against replayed announcements.
pub const LATENCY_TOLERANCE: Duration = Duration::from_secs(15);

const MIN_TRANSMIT_INTERVAL: Duration = Duration::from_secs(20);
const MAX_TRANSMIT_INTERVAL: Duration = Duration::from_secs(40);

fn random_transmit_interval() -> Duration {
    rand::thread_rng().gen_range(MIN_TRANSMIT_INTERVAL..=MAX_TRANSMIT_INTERVAL)
}

/// Drain the UDP socket until cancellation.
pub async fn receive_loop(
    local: Arc<LocalNode>,
    remotes: Arc<RemoteDirectory>,
    modes: Arc<HashMap<u8, PacketMode>>,
    notify_state: mpsc::Sender<()>,
    reply: mpsc::Sender<Vec<SocketAddr>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            received = local.socket().recv_from(&mut buf) => match received {
                Ok((len, origin)) => {
                    process_datagram(&buf[..len], origin, &remotes, &modes, &notify_state, &reply)
                        .await;
                }
                Err(e) => tracing::error!(error = %e, "udp receive"),
            },

            () = cancel.cancelled() => return,
        }
    }
}

/// Validate one datagram and apply it to the remote directory.
///
/// Every rejection is logged and dropped; nothing here is fatal. An
/// accepted record pulses the materializer, and a previously unknown
/// sender is queued for an immediate full-state reply.
pub async fn process_datagram(
    data: &[u8],
    origin: SocketAddr,
    remotes: &RemoteDirectory,
    modes: &HashMap<u8, PacketMode>,
    notify_state: &mpsc::Sender<()>,
    reply: &mpsc::Sender<Vec<SocketAddr>>,
) {
    match data.len() {
        len if len > SAFE_DATAGRAM_SIZE => {
            tracing::error!(origin = %origin.ip(), len, "received dangerously large packet");
        }
        len if len > LARGE_DATAGRAM_SIZE => {
            tracing::info!(origin = %origin.ip(), len, "received large packet");
        }
        len => tracing::debug!(origin = %origin.ip(), len, "received packet"),
    }

    if !node::is_global_unicast(&origin.ip().to_canonical()) {
        tracing::error!(origin = %origin.ip(), "bad origin address");
        return;
    }

    let record = match packet::decode(data, modes) {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(origin = %origin.ip(), error = %e, "packet rejected");
            return;
        }
    };

    if let Err(e) = packet::verify_origin(&record, &origin) {
        tracing::error!(error = %e, "packet rejected");
        return;
    }

    let latency_ns = node::now_ns() - record.time_ns;
    if latency_ns > LATENCY_TOLERANCE.as_nanos() as i64 {
        tracing::error!(
            origin = %origin.ip(),
            latency_ms = latency_ns / 1_000_000,
            "intolerable packet latency"
        );
        return;
    }

    let new_addr = remotes.update(record);

    let _ = notify_state.try_send(());

    if let Some(addr) = new_addr {
        let _ = reply.send(vec![addr]).await;
    }
}

/// Announce the local state until cancellation, then say goodbye.
pub async fn transmit_loop(
    local: Arc<LocalNode>,
    remotes: Arc<RemoteDirectory>,
    mut notify: mpsc::Receiver<()>,
    mut reply: mpsc::Receiver<Vec<SocketAddr>>,
    cancel: CancellationToken,
) {
    let mut reply_to: Vec<SocketAddr> = Vec::new();

    let timer = tokio::time::sleep(random_transmit_interval());
    tokio::pin!(timer);

    loop {
        // A pending reply set narrows this round to exactly those peers;
        // otherwise announce to the whole directory.
        let addrs = if reply_to.is_empty() {
            remotes.addrs()
        } else {
            std::mem::take(&mut reply_to)
        };

        transmit(&local, &addrs, false).await;

        tokio::select! {
            received = reply.recv() => match received {
                Some(addrs) => {
                    for addr in addrs {
                        if !reply_to.contains(&addr) {
                            reply_to.push(addr);
                        }
                    }
                }
                None => break,
            },

            received = notify.recv() => match received {
                Some(()) => {
                    timer
                        .as_mut()
                        .reset(tokio::time::Instant::now() + random_transmit_interval());
                }
                None => break,
            },

            () = &mut timer => {
                timer
                    .as_mut()
                    .reset(tokio::time::Instant::now() + random_transmit_interval());
            }

            () = cancel.cancelled() => break,
        }
    }

    transmit(&local, &remotes.addrs(), true).await;
}

async fn transmit(local: &LocalNode, addrs: &[SocketAddr], goodbye: bool) {
    let data = match local.encode_packet(goodbye) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(error = %e, "packet encode");
            return;
        }
    };

    match data.len() {
        len if len > SAFE_DATAGRAM_SIZE => {
            tracing::error!(len, "sending dangerously large packet");
        }
        len if len > LARGE_DATAGRAM_SIZE => tracing::info!(len, "sending large packet"),
        len => tracing::debug!(len, "sending packet"),
    }

    let mut order: Vec<&SocketAddr> = addrs.iter().collect();
    order.shuffle(&mut rand::thread_rng());

    for addr in order {
        tracing::debug!(peer = %addr.ip(), "sending");

        if let Err(e) = local.socket().send_to(&data, addr).await {
            tracing::error!(peer = %addr, error = %e, "udp send");
        }
    }
}
