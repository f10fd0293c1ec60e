//! Materialized state tree — the merged feature view rendered to files.
//!
//! Layout: `<stateDir>/features/<feature>/<host_ip>` holds the feature's
//! JSON value pretty-printed with a trailing newline, mode 0444, replaced
//! atomically via a temp file under `<stateDir>/.tmp`. Downstream readers
//! watch the tree and must ignore the temp directory.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use walkdir::WalkDir;

use cairn_core::node::{self, Node};

use crate::local::LocalNode;
use crate::remotes::RemoteDirectory;
use crate::service::ServeError;

/// Local features are published under the loopback address regardless of
/// the configured peer-to-peer address.
pub const LOOPBACK_IP_ADDR: &str = "127.0.0.1";

pub struct StateTree {
    feature_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl StateTree {
    pub fn create(state_dir: &Path) -> Result<Self, ServeError> {
        let feature_dir = state_dir.join("features");
        let tmp_dir = state_dir.join(".tmp");

        fs::create_dir_all(&feature_dir).map_err(|source| ServeError::StateDir {
            path: feature_dir.clone(),
            source,
        })?;
        fs::create_dir_all(&tmp_dir).map_err(|source| ServeError::StateDir {
            path: tmp_dir.clone(),
            source,
        })?;

        Ok(Self {
            feature_dir,
            tmp_dir,
        })
    }

    /// One materialization pass per wakeup; exits when the last notifier
    /// hangs up.
    pub async fn state_loop(
        self,
        local: Arc<LocalNode>,
        remotes: Arc<RemoteDirectory>,
        mut wake: mpsc::Receiver<()>,
    ) {
        while wake.recv().await.is_some() {
            self.materialize(&local, &remotes);
        }
    }

    /// Project Local ∪ Remote into the tree, then sweep away every file
    /// that no live (host, feature) pair accounts for.
    pub fn materialize(&self, local: &LocalNode, remotes: &RemoteDirectory) {
        let mut live = HashSet::new();

        self.write_node(LOOPBACK_IP_ADDR, &local.snapshot(), &mut live);

        for record in remotes.nodes() {
            self.write_node(&record.ip_addr, &record, &mut live);
        }

        for entry in WalkDir::new(&self.feature_dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(error = %e, "state tree walk");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if !live.contains(entry.path()) {
                tracing::debug!(path = %entry.path().display(), "removing state file");

                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::error!(path = %entry.path().display(), error = %e, "state file removal");
                }
            }
        }
    }

    fn write_node(&self, ip_addr: &str, record: &Node, live: &mut HashSet<PathBuf>) {
        for (feature, value) in &record.features {
            let dirname = self.feature_dir.join(feature);
            let filename = dirname.join(ip_addr);

            let new_data = match serde_json::from_str::<serde_json::Value>(value.get())
                .and_then(|value| node::to_pretty_json(&value))
            {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!(feature, error = %e, "feature value encoding");
                    continue;
                }
            };

            live.insert(filename.clone());

            match fs::read(&filename) {
                Ok(old_data) if old_data == new_data => continue,
                Ok(_) => tracing::debug!(path = %filename.display(), "updating state file"),
                Err(_) => tracing::debug!(path = %filename.display(), "creating state file"),
            }

            if let Err(e) = self.install(&dirname, &filename, &new_data) {
                tracing::error!(path = %filename.display(), error = %e, "state file write");
            }
        }
    }

    fn install(&self, dirname: &Path, filename: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = tempfile::NamedTempFile::new_in(&self.tmp_dir)?;
        file.write_all(data)?;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o444))?;
        fs::create_dir_all(dirname)?;
        file.persist(filename).map_err(|e| e.error)?;
        Ok(())
    }
}
