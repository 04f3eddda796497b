//! File-system change notification for tasks files.
//!
//! A `notify::PollWatcher` feeds raw events into a channel; they are filtered
//! down to [`StoreEvent`]s about `tasks.md` files and delivered on an explicit
//! `tokio::sync::mpsc` channel. Watching lasts as long as the returned
//! [`WatchGuard`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::io::task_store::TASKS_FILE;

/// A change to a tasks file under the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

impl StoreEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Changed(path) | Self::Removed(path) => path,
        }
    }
}

/// Keeps the underlying watcher alive. Dropping it stops notifications.
pub struct WatchGuard {
    watcher: Option<PollWatcher>,
    root: PathBuf,
}

impl WatchGuard {
    /// Stop watching now rather than on drop. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(err) = watcher.unwatch(&self.root) {
                debug!(error = %err, "unwatch failed; dropping watcher anyway");
            }
            info!(path = %self.root.display(), "stopped watching specs");
        }
    }

    pub fn is_active(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchGuard")
            .field("root", &self.root)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Watch `root` recursively, sending tasks-file events on `tx`.
pub fn watch_specs(
    root: &Path,
    poll_interval: Duration,
    tx: mpsc::Sender<StoreEvent>,
) -> Result<WatchGuard> {
    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| match res {
            Ok(event) => {
                for store_event in translate(&event) {
                    if tx.try_send(store_event).is_err() {
                        // Full or closed; the store re-reads before every write anyway.
                        debug!("store event dropped");
                    }
                }
            }
            Err(err) => warn!(error = %err, "watch error"),
        },
        notify::Config::default().with_poll_interval(poll_interval),
    )
    .context("create file watcher")?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", root.display()))?;
    info!(path = %root.display(), "watching specs");

    Ok(WatchGuard {
        watcher: Some(watcher),
        root: root.to_path_buf(),
    })
}

/// Reduce a raw notify event to tasks-file events.
pub fn translate(event: &NotifyEvent) -> Vec<StoreEvent> {
    let is_tasks_file = |path: &&PathBuf| path.file_name().is_some_and(|name| name == TASKS_FILE);
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(is_tasks_file)
            .map(|path| StoreEvent::Changed(path.clone()))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter(is_tasks_file)
            .map(|path| StoreEvent::Removed(path.clone()))
            .collect(),
        _ => Vec::new(),
    }
}
