//! Filesystem watcher driving incremental re-indexing.
//!
//! The notify callback only filters and forwards paths over an unbounded
//! channel; it never reads or embeds anything. A dispatcher task coalesces
//! events per path: every event pushes that path's deadline out by the
//! debounce window, and only once a path has been quiet for the whole window
//! is [`Indexer::index_file`] called on it. That call looks at the disk, so
//! a burst ending in a delete removes the file and a burst ending in a write
//! indexes the final content.
//!
//! Moving or deleting a directory produces a single event for the directory
//! itself. Such paths are reconciled as a subtree with
//! [`Indexer::index_subtree`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memdex_core::{MemdexError, MemdexResult};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::has_hidden_segment;
use crate::indexer::{FileOutcome, Indexer};

/// Watcher tuning.
#[derive(Debug, Clone, Copy)]
pub struct WatcherOptions {
    /// Quiet period a path needs before it is indexed.
    pub debounce: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
enum WatchMessage {
    Changed(PathBuf),
    Error(String),
    RootRemoved,
}

/// A running watcher over the indexer's memory root.
///
/// Stop it with [`MemoryWatcher::stop`], which consumes the watcher.
pub struct MemoryWatcher {
    watcher: RecommendedWatcher,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    running: Arc<AtomicBool>,
}

impl MemoryWatcher {
    /// Start watching `indexer.root()` recursively. Must be called from
    /// within a tokio runtime.
    pub fn start(indexer: Arc<Indexer>, options: WatcherOptions) -> MemdexResult<Self> {
        let root = indexer.root().to_path_buf();
        if !root.is_dir() {
            return Err(MemdexError::Watcher(format!(
                "memory root {} is not a directory",
                root.display()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let config = indexer.config().clone();
        let watched_root = root.clone();
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.clone());

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let structural = matches!(
                        event.kind,
                        EventKind::Create(_)
                            | EventKind::Remove(_)
                            | EventKind::Modify(ModifyKind::Name(_))
                    );
                    for path in event.paths {
                        if path == watched_root || path == canonical_root {
                            if matches!(event.kind, EventKind::Remove(_)) {
                                let _ = tx.send(WatchMessage::RootRemoved);
                            }
                            continue;
                        }
                        let Some(rel) = path
                            .strip_prefix(&watched_root)
                            .or_else(|_| path.strip_prefix(&canonical_root))
                            .ok()
                        else {
                            continue;
                        };
                        if has_hidden_segment(rel) {
                            continue;
                        }
                        // Directories (and paths already gone) may hide a
                        // whole subtree of memory files.
                        if config.is_recognized(rel) || (structural && !path.is_file()) {
                            let _ = tx.send(WatchMessage::Changed(path));
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(WatchMessage::Error(e.to_string()));
                }
            }
        })
        .map_err(|e| MemdexError::Watcher(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| {
                MemdexError::Watcher(format!("failed to watch {}: {e}", root.display()))
            })?;

        let running = Arc::new(AtomicBool::new(true));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(dispatch(
            indexer,
            rx,
            shutdown_rx,
            options.debounce,
            running.clone(),
        ));

        info!(
            root = %root.display(),
            debounce_ms = options.debounce.as_millis() as u64,
            "memory watcher started"
        );
        Ok(Self {
            watcher,
            shutdown,
            task,
            running,
        })
    }

    /// False once the dispatcher has exited, e.g. after the root was
    /// deleted.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop event intake and wait for the dispatcher to finish its current
    /// indexing call. Pending, not yet due paths are dropped; the next
    /// `index_all` reconciles them.
    pub async fn stop(self) -> MemdexResult<()> {
        let Self {
            watcher,
            shutdown,
            task,
            ..
        } = self;
        drop(watcher);
        let _ = shutdown.send(());
        task.await
            .map_err(|e| MemdexError::Watcher(format!("watcher task failed: {e}")))?;
        info!("memory watcher stopped");
        Ok(())
    }
}

/// Coalescing loop. Runs until shutdown, channel close, or root removal.
async fn dispatch(
    indexer: Arc<Indexer>,
    mut rx: mpsc::UnboundedReceiver<WatchMessage>,
    mut shutdown: oneshot::Receiver<()>,
    debounce: Duration,
    running: Arc<AtomicBool>,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let next_due = pending.values().min().copied();
        let wait_due = async {
            match next_due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            message = rx.recv() => match message {
                Some(WatchMessage::Changed(path)) => {
                    if !indexer.root().exists() {
                        warn!(
                            root = %indexer.root().display(),
                            "memory root disappeared, stopping watcher"
                        );
                        break;
                    }
                    pending.insert(path, Instant::now() + debounce);
                }
                Some(WatchMessage::Error(e)) => warn!(error = %e, "file watcher error"),
                Some(WatchMessage::RootRemoved) => {
                    warn!(
                        root = %indexer.root().display(),
                        "memory root removed, stopping watcher"
                    );
                    break;
                }
                None => break,
            },
            () = wait_due => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    if path.is_dir() || !indexer.config().is_recognized(&path) {
                        index_tree(&indexer, &path).await;
                    } else {
                        index_path(&indexer, &path).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!(dropped = pending.len(), "watcher dispatcher exited");
}

async fn index_path(indexer: &Indexer, path: &Path) {
    match indexer.index_file(path).await {
        Ok(FileOutcome::Indexed { chunks }) => {
            debug!(path = %path.display(), chunks, "re-indexed after change");
        }
        Ok(outcome) => debug!(path = %path.display(), ?outcome, "change handled"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to index changed file"),
    }
}

async fn index_tree(indexer: &Indexer, path: &Path) {
    match indexer.index_subtree(path).await {
        Ok(report) => debug!(
            path = %path.display(),
            indexed = report.files_indexed,
            removed = report.files_removed,
            "directory change handled"
        ),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to reconcile directory"),
    }
}
