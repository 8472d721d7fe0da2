//! Build watcher: publishes a new code version when the build output changes.

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pool::WorkerPool;

/// Summary of a directory tree. Two equal fingerprints mean nothing changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub files: usize,
    pub total_bytes: u64,
    pub newest_modified_ms: u128,
    /// SHA-256 over every file's relative path, size and modification time.
    pub digest: String,
}

/// Fingerprint every regular file below `root`.
pub fn fingerprint(root: &Path) -> io::Result<Fingerprint> {
    let mut entries = Vec::new();
    collect(root, root, &mut entries)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    let mut total_bytes = 0;
    let mut newest_modified_ms = 0;
    for (path, len, modified_ms) in &entries {
        hasher.update(path.as_bytes());
        hasher.update(len.to_le_bytes());
        hasher.update(modified_ms.to_le_bytes());
        total_bytes += len;
        newest_modified_ms = newest_modified_ms.max(*modified_ms);
    }

    Ok(Fingerprint {
        files: entries.len(),
        total_bytes,
        newest_modified_ms,
        digest: format!("{:x}", hasher.finalize()),
    })
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<(String, u64, u128)>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            collect(root, &path, out)?;
        } else if file_type.is_file() {
            let metadata = entry.metadata()?;
            let modified_ms = metadata
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH)
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            out.push((relative, metadata.len(), modified_ms));
        }
    }
    Ok(())
}

/// Watches a build output directory and invalidates the pool on change.
///
/// File events are debounced, then the tree is fingerprinted. Events that
/// leave the tree as it was, such as a temporary file created and removed
/// within one window, do not redeploy.
#[derive(Debug, Clone)]
pub struct BuildWatcher {
    root: PathBuf,
    debounce: Duration,
}

impl BuildWatcher {
    pub fn new(root: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            root: root.into(),
            debounce,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fingerprint the tree on a blocking thread.
    pub async fn scan(&self) -> io::Result<Fingerprint> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || fingerprint(&root))
            .await
            .map_err(io::Error::other)?
    }

    /// Start watching. The fingerprint taken when watching begins is the baseline.
    pub fn spawn(self, pool: WorkerPool) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Bridge from the notify callback thread
            let (tx, mut rx) = mpsc::channel::<DebounceEventResult>(16);
            let mut debouncer = match new_debouncer(self.debounce, move |res: DebounceEventResult| {
                let _ = tx.blocking_send(res);
            }) {
                Ok(debouncer) => debouncer,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create build watcher");
                    return;
                }
            };
            if let Err(e) = debouncer
                .watcher()
                .watch(&self.root, RecursiveMode::Recursive)
            {
                tracing::error!(root = %self.root.display(), error = %e, "Failed to watch build output");
                return;
            }

            let mut baseline = match self.scan().await {
                Ok(fp) => {
                    tracing::debug!(files = fp.files, digest = %fp.digest, "Build baseline recorded");
                    Some(fp)
                }
                Err(e) => {
                    tracing::warn!(root = %self.root.display(), error = %e, "Failed to scan build output");
                    None
                }
            };

            tracing::info!(
                root = %self.root.display(),
                debounce_ms = self.debounce.as_millis() as u64,
                "Watching build output"
            );

            while let Some(result) = rx.recv().await {
                if pool.is_closed().await {
                    break;
                }
                let events = match result {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(error = ?e, "Build watch error");
                        continue;
                    }
                };
                tracing::trace!(events = events.len(), "Build output events");

                let current = match self.scan().await {
                    Ok(fp) => fp,
                    Err(e) => {
                        tracing::warn!(root = %self.root.display(), error = %e, "Failed to scan build output");
                        continue;
                    }
                };

                if baseline.as_ref().is_some_and(|previous| *previous != current) {
                    tracing::info!(
                        files = current.files,
                        total_bytes = current.total_bytes,
                        "Build output changed"
                    );
                    pool.invalidate_all().await;
                }
                baseline = Some(current);
            }
        })
    }
}
