//! Watcher handle: notify callback → typed changes → channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::{translate, FsChange, WatchMessage};
use crate::error::Result;

/// Recursive watch over one root.
///
/// The notify callback only translates and enqueues; all handling happens on
/// the consumer side. Dropping the handle disposes it.
pub struct RootWatcher {
    root: PathBuf,
    inner: Mutex<Option<RecommendedWatcher>>,
    disposed: AtomicBool,
}

impl RootWatcher {
    /// Start watching `root`, sending every change to `tx`.
    pub fn start(root: &Path, tx: mpsc::UnboundedSender<WatchMessage>) -> Result<Self> {
        let tagged_root = root.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let changes = match res {
                Ok(event) => translate(&event),
                Err(e) => {
                    log::warn!("watch error under {}: {}", tagged_root.display(), e);
                    vec![FsChange::Overflow]
                }
            };
            for change in changes {
                let message = WatchMessage {
                    root: tagged_root.clone(),
                    change,
                };
                if tx.send(message).is_err() {
                    // Consumer gone; nothing left to notify
                    return;
                }
            }
        })?;

        watcher.watch(root, RecursiveMode::Recursive)?;
        log::info!("Watching {}", root.display());

        Ok(Self {
            root: root.to_path_buf(),
            inner: Mutex::new(Some(watcher)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop notification delivery and release the OS handle. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let watcher = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut watcher) = watcher {
            if let Err(e) = watcher.unwatch(&self.root) {
                log::debug!("unwatch {}: {}", self.root.display(), e);
            }
            log::info!("Stopped watching {}", self.root.display());
        }
    }
}

impl Drop for RootWatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}
