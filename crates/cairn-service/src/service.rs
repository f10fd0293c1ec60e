//! Service orchestration — wiring the loops together.
//!
//! Startup order matters: the config watcher populates the local node
//! (and queues the first notify pulse) before any loop runs; the receive
//! and transmit loops are live before the storage bootstrap scan so the
//! reply addresses it surfaces are answered promptly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cairn_core::node::FeatureMap;
use cairn_core::packet::PacketMode;

use crate::dispatch;
use crate::local::LocalNode;
use crate::net;
use crate::remotes::RemoteDirectory;
use crate::state::StateTree;
use crate::storage::StorageSync;
use crate::watch;

/// Everything a service instance needs. The caller owns argument parsing,
/// secret loading, and object-store client construction; `s3_client: None`
/// is the dry-run mode that short-circuits all store calls.
pub struct Params {
    /// Local IP address for peer-to-peer messaging. Required.
    pub addr: String,
    /// UDP port for peer-to-peer messaging.
    pub port: u16,
    /// Static features as a JSON document, e.g. `{"feature1":true}`.
    pub features: Option<String>,
    /// Dynamic feature configuration directory.
    pub feature_dir: PathBuf,
    /// Runtime state root.
    pub state_dir: PathBuf,
    /// Mode used for outgoing packets. Required.
    pub send_mode: PacketMode,
    /// Modes accepted on incoming packets. Defaults to the send mode.
    pub receive_modes: Option<HashMap<u8, PacketMode>>,
    /// Object-store client, or None for a dry run.
    pub s3_client: Option<aws_sdk_s3::Client>,
    pub s3_bucket: String,
    pub s3_prefix: String,
}

/// Startup failures. Anything that goes wrong after startup is logged
/// and ridden out, never returned.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("bad local address: {0}")]
    BadLocalAddr(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("peer-to-peer secret is empty")]
    InvalidSecret,

    #[error("bad feature specification: {0}")]
    ConfigParse(#[source] serde_json::Error),

    #[error("feature directory {path}: {source}")]
    FeatureDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("feature directory watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },

    #[error("state directory {path}: {source}")]
    StateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("object store: {0}")]
    CloudConfig(String),
}

/// Serve until the token is cancelled.
pub async fn serve(params: Params, cancel: CancellationToken) -> Result<(), ServeError> {
    if params.send_mode.secret.is_empty() {
        return Err(ServeError::InvalidSecret);
    }

    let receive_modes = Arc::new(params.receive_modes.unwrap_or_else(|| {
        HashMap::from([(params.send_mode.id, params.send_mode.clone())])
    }));

    let static_features: FeatureMap = match &params.features {
        Some(text) => serde_json::from_str(text).map_err(ServeError::ConfigParse)?,
        None => FeatureMap::new(),
    };

    let local = Arc::new(LocalNode::bind(&params.addr, params.port, params.send_mode).await?);
    let remotes = Arc::new(RemoteDirectory::new(params.port));

    tracing::info!(addr = %params.addr, port = params.port, "cairn serving");

    // One raw change channel into the coordinator; one capacity-1 wake
    // channel per consumer; one reply channel carrying fast-reply targets
    // to the transmit loop.
    let (notify_tx, notify_rx) = mpsc::channel(1);
    let (state_tx, state_rx) = mpsc::channel(1);
    let (storage_tx, storage_rx) = mpsc::channel(1);
    let (transmit_tx, transmit_rx) = mpsc::channel(1);
    let (reply_tx, reply_rx) = mpsc::channel(16);

    watch::init_feature_config(
        local.clone(),
        static_features,
        params.feature_dir.clone(),
        notify_tx.clone(),
        cancel.clone(),
    )?;

    let state = StateTree::create(&params.state_dir)?;
    let state_task = tokio::spawn(state.state_loop(local.clone(), remotes.clone(), state_rx));

    let receive_task = tokio::spawn(net::receive_loop(
        local.clone(),
        remotes.clone(),
        receive_modes,
        state_tx.clone(),
        reply_tx.clone(),
        cancel.clone(),
    ));

    let transmit_task = tokio::spawn(net::transmit_loop(
        local.clone(),
        remotes.clone(),
        transmit_rx,
        reply_rx,
        cancel.clone(),
    ));

    let storage = StorageSync::new(
        params.s3_client,
        params.s3_bucket,
        &params.s3_prefix,
        local.ip_addr(),
    );

    if let Err(e) = storage.init(&local, &remotes, &reply_tx, &notify_tx).await {
        // Unwind the already-running loops before surfacing the failure.
        cancel.cancel();
        return Err(ServeError::CloudConfig(e.to_string()));
    }

    let storage_task = tokio::spawn(storage.storage_loop(
        local.clone(),
        remotes.clone(),
        storage_rx,
        reply_tx,
        notify_tx,
        cancel.clone(),
    ));

    // The coordinator runs here until cancellation (or until every
    // notifier has hung up).
    dispatch::dispatch_loop(notify_rx, state_tx, storage_tx, transmit_tx, cancel.clone()).await;

    // Let the transmit loop finish its goodbye and the rest unwind.
    let _ = transmit_task.await;
    let _ = storage_task.await;
    let _ = receive_task.await;
    let _ = state_task.await;

    tracing::info!("cairn stopped");

    Ok(())
}
