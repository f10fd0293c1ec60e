//! Feature configuration — one file per feature, watched for changes.
//!
//! The feature map is rebuilt from scratch on every change: the static
//! map given on the command line first, then every valid filename in the
//! directory. A file holding only whitespace deletes its feature; a file
//! holding malformed JSON is skipped without disturbing the rest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cairn_core::node::{self, FeatureMap};

use crate::local::LocalNode;
use crate::service::ServeError;

/// Perform the initial scan and spawn the watch task. The initial scan
/// runs before this returns, so the local node is populated (and the
/// first notify pulse queued) before any loop starts.
pub fn init_feature_config(
    local: Arc<LocalNode>,
    static_features: FeatureMap,
    dir: PathBuf,
    notify_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) -> Result<(), ServeError> {
    std::fs::create_dir_all(&dir).map_err(|source| ServeError::FeatureDir {
        path: dir.clone(),
        source,
    })?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let _ = event_tx.send(result);
    })
    .map_err(|source| ServeError::Watch {
        path: dir.clone(),
        source,
    })?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|source| ServeError::Watch {
            path: dir.clone(),
            source,
        })?;

    scan_features(&local, &static_features, &dir, &notify_tx);

    tokio::spawn(async move {
        // Holds the OS watcher for the lifetime of the task.
        let _watcher = watcher;

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(Ok(_)) => scan_features(&local, &static_features, &dir, &notify_tx),
                    Some(Err(e)) => tracing::error!(error = %e, "feature watch"),
                    None => return,
                },
                () = cancel.cancelled() => return,
            }
        }
    });

    Ok(())
}

/// Rebuild the feature map from the static map and the directory
/// contents, and pulse the notify channel if the local node changed.
pub fn scan_features(
    local: &LocalNode,
    static_features: &FeatureMap,
    dir: &Path,
    notify_tx: &mpsc::Sender<()>,
) {
    let mut features = static_features.clone();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "feature directory scan");
            return;
        }
    };

    let mut names = Vec::new();
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        if !node::is_valid_feature_name(&name) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }
        names.push(name);
    }
    names.sort();

    for name in names {
        let path = dir.join(&name);

        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "feature file read");
                continue;
            }
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            features.remove(&name);
            continue;
        }

        match serde_json::from_slice(&data) {
            Ok(value) => {
                features.insert(name, value);
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "feature file parse");
            }
        }
    }

    let summary = features.keys().cloned().collect::<Vec<_>>().join(" ");

    if local.update_features(features) {
        let _ = notify_tx.try_send(());
        tracing::info!(features = %summary, "local features");
    }
}
