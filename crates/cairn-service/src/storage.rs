//! Object-store rendezvous and bootstrap directory.
//!
//! Each host keeps one object under `prefix + ip_addr` holding its
//! storage-variant record; the object's LastModified is the effective
//! timestamp. Scans bootstrap newly started hosts, refresh peers whose
//! UDP packets never arrived, and garbage-collect hosts silent past the
//! expiry threshold.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cairn_core::node::{self, Node};

use crate::local::LocalNode;
use crate::remotes::{RemoteDirectory, EXPIRE_TIMEOUT};

const MIN_STORAGE_INTERVAL: Duration = Duration::from_secs(120);
const MAX_STORAGE_INTERVAL: Duration = Duration::from_secs(240);

fn random_storage_interval() -> Duration {
    rand::thread_rng().gen_range(MIN_STORAGE_INTERVAL..=MAX_STORAGE_INTERVAL)
}

pub struct StorageSync {
    /// None short-circuits every call — the dry-run mode used by tests.
    client: Option<Client>,
    bucket: String,
    prefix: String,
    local_key: String,
}

impl StorageSync {
    pub fn new(
        client: Option<Client>,
        bucket: impl Into<String>,
        prefix: &str,
        local_ip: &str,
    ) -> Self {
        let mut prefix = prefix.to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let local_key = format!("{prefix}{local_ip}");

        Self {
            client,
            bucket: bucket.into(),
            prefix,
            local_key,
        }
    }

    /// Startup round: upload our own record, then bootstrap the directory
    /// from a full scan. Failures here are fatal — a host that cannot
    /// reach the rendezvous cannot join the fleet.
    pub async fn init(
        &self,
        local: &LocalNode,
        remotes: &RemoteDirectory,
        reply: &mpsc::Sender<Vec<SocketAddr>>,
        notify: &mpsc::Sender<()>,
    ) -> anyhow::Result<()> {
        self.update(local).await?;
        self.scan(local, remotes, reply, notify).await?;
        Ok(())
    }

    /// Wake on notify (write-only) or on the timer (write then scan).
    pub async fn storage_loop(
        self,
        local: Arc<LocalNode>,
        remotes: Arc<RemoteDirectory>,
        mut wake: mpsc::Receiver<()>,
        reply: mpsc::Sender<Vec<SocketAddr>>,
        notify: mpsc::Sender<()>,
        cancel: CancellationToken,
    ) {
        let timer = tokio::time::sleep(random_storage_interval());
        tokio::pin!(timer);

        loop {
            let scan = tokio::select! {
                received = wake.recv() => match received {
                    Some(()) => false,
                    None => return,
                },

                () = &mut timer => {
                    timer
                        .as_mut()
                        .reset(tokio::time::Instant::now() + random_storage_interval());
                    true
                }

                () = cancel.cancelled() => return,
            };

            if let Err(e) = self.update(&local).await {
                tracing::error!(error = %e, "object store update");
            }

            if scan {
                if let Err(e) = self.scan(&local, &remotes, &reply, &notify).await {
                    tracing::error!(error = %e, "object store scan");
                }
            }
        }
    }

    async fn update(&self, local: &LocalNode) -> anyhow::Result<()> {
        tracing::debug!(key = %self.local_key, "updating object store");

        let data = local
            .marshal_for_storage()
            .context("storage body encoding")?;

        let Some(client) = &self.client else {
            return Ok(());
        };

        client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.local_key)
            .content_type("application/json")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| anyhow!("PutObject: {}", DisplayErrorContext(&e)))?;

        Ok(())
    }

    async fn scan(
        &self,
        local: &LocalNode,
        remotes: &RemoteDirectory,
        reply: &mpsc::Sender<Vec<SocketAddr>>,
        notify: &mpsc::Sender<()>,
    ) -> anyhow::Result<()> {
        tracing::debug!(prefix = %self.prefix, "scanning object store");

        let Some(client) = &self.client else {
            return Ok(());
        };

        let expire_threshold_ns = node::now_ns() - EXPIRE_TIMEOUT.as_nanos() as i64;

        let mut load_keys: Vec<(String, String)> = Vec::new();
        let mut delete_keys: Vec<(String, String)> = Vec::new();

        let mut pages = client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| anyhow!("ListObjectsV2: {}", DisplayErrorContext(&e)))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };

                let Some(ip_addr) = classify_key(key, &self.prefix, local.ip_addr()) else {
                    continue;
                };

                let Some(last_modified) = object.last_modified() else {
                    continue;
                };
                let time_ns = datetime_ns(last_modified);

                if time_ns < expire_threshold_ns {
                    delete_keys.push((key.to_string(), ip_addr.to_string()));
                } else if remotes.updatable(ip_addr, time_ns) {
                    load_keys.push((key.to_string(), ip_addr.to_string()));
                }
            }
        }

        for (key, ip_addr) in &delete_keys {
            tracing::info!(peer = %ip_addr, "deleting from object store");

            if let Err(e) = client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                tracing::error!(key, error = %DisplayErrorContext(&e), "DeleteObject");
            }
        }

        let mut new_addrs = Vec::new();

        for (key, ip_addr) in &load_keys {
            tracing::debug!(peer = %ip_addr, "loading from object store");

            let output = match client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!(key, error = %DisplayErrorContext(&e), "GetObject");
                    continue;
                }
            };

            let Some(last_modified) = output.last_modified().cloned() else {
                continue;
            };

            let body = match output.body.collect().await {
                Ok(body) => body.into_bytes(),
                Err(e) => {
                    tracing::error!(key, error = %e, "GetObject body");
                    continue;
                }
            };

            let mut record: Node = match serde_json::from_slice(&body) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(peer = %ip_addr, error = %e, "bad object body");
                    continue;
                }
            };

            // The store supplies the addressing the body omits.
            record.ip_addr = ip_addr.clone();
            record.time_ns = datetime_ns(&last_modified);

            if let Some(addr) = remotes.update(record) {
                new_addrs.push(addr);
            }
        }

        if !new_addrs.is_empty() {
            let _ = reply.send(new_addrs).await;
        }

        let expired = remotes.expire(expire_threshold_ns);

        if !load_keys.is_empty() || !delete_keys.is_empty() || expired > 0 {
            let _ = notify.try_send(());
        }

        Ok(())
    }
}

/// Extract and vet the peer address a scanned object key refers to.
/// Returns None for our own key, the bare prefix, foreign keys, and
/// addresses no peer may legitimately claim.
fn classify_key<'a>(key: &'a str, prefix: &str, local_ip: &str) -> Option<&'a str> {
    let ip_addr = key.strip_prefix(prefix)?;

    if ip_addr.is_empty() || ip_addr == local_ip {
        return None;
    }

    let Ok(ip) = ip_addr.parse::<IpAddr>() else {
        tracing::error!(key, "bad object key");
        return None;
    };

    if !node::is_global_unicast(&ip) {
        tracing::error!(key, "bad peer address in object store");
        return None;
    }

    Some(ip_addr)
}

fn datetime_ns(datetime: &aws_sdk_s3::primitives::DateTime) -> i64 {
    datetime.secs() * 1_000_000_000 + i64::from(datetime.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_normalized_with_a_trailing_slash() {
        let sync = StorageSync::new(None, "bucket", "fleet", "10.0.0.1");
        assert_eq!(sync.prefix, "fleet/");
        assert_eq!(sync.local_key, "fleet/10.0.0.1");

        let bare = StorageSync::new(None, "bucket", "", "10.0.0.1");
        assert_eq!(bare.prefix, "");
        assert_eq!(bare.local_key, "10.0.0.1");

        let slashed = StorageSync::new(None, "bucket", "fleet/", "10.0.0.1");
        assert_eq!(slashed.prefix, "fleet/");
    }

    #[test]
    fn key_classification() {
        assert_eq!(
            classify_key("fleet/10.0.0.2", "fleet/", "10.0.0.1"),
            Some("10.0.0.2")
        );

        // Own record, bare prefix, foreign keys.
        assert_eq!(classify_key("fleet/10.0.0.1", "fleet/", "10.0.0.1"), None);
        assert_eq!(classify_key("fleet/", "fleet/", "10.0.0.1"), None);
        assert_eq!(classify_key("other/10.0.0.2", "fleet/", "10.0.0.1"), None);

        // Junk and illegitimate addresses.
        assert_eq!(classify_key("fleet/backup.json", "fleet/", "10.0.0.1"), None);
        assert_eq!(classify_key("fleet/127.0.0.1", "fleet/", "10.0.0.1"), None);
        assert_eq!(classify_key("fleet/224.0.0.1", "fleet/", "10.0.0.1"), None);
    }

    #[test]
    fn datetime_conversion_is_nanoseconds_since_epoch() {
        let datetime = aws_sdk_s3::primitives::DateTime::from_secs(1_400_000_000);
        assert_eq!(datetime_ns(&datetime), 1_400_000_000_000_000_000);
    }

    #[test]
    fn storage_interval_stays_in_bounds() {
        for _ in 0..1000 {
            let interval = random_storage_interval();
            assert!(interval >= MIN_STORAGE_INTERVAL);
            assert!(interval <= MAX_STORAGE_INTERVAL);
        }
    }

    #[tokio::test]
    async fn dry_run_short_circuits() {
        let sync = StorageSync::new(None, "bucket", "fleet", "10.0.0.1");
        let local = LocalNode::bind(
            "127.0.0.1",
            0,
            cairn_core::packet::PacketMode::new(0, b"secret".to_vec()),
        )
        .await
        .unwrap();
        let remotes = RemoteDirectory::new(17106);
        let (reply_tx, _reply_rx) = mpsc::channel(16);
        let (notify_tx, _notify_rx) = mpsc::channel(1);

        sync.init(&local, &remotes, &reply_tx, &notify_tx)
            .await
            .unwrap();
        assert!(remotes.is_empty());
    }
}
