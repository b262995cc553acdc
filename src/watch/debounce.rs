//! Per-path debounce for created/changed files.
//!
//! Editors and generators write a file in several steps; a path is handed
//! out only once it has been quiet for the configured delay.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

use super::WatchMessage;

pub struct Debouncer {
    delay: Duration,
    pending: HashMap<PathBuf, (Instant, WatchMessage)>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
        }
    }

    /// (Re)start the quiet period for `path`, keeping the latest message.
    pub fn schedule(&mut self, path: PathBuf, message: WatchMessage, now: Instant) {
        self.pending.insert(path, (now + self.delay, message));
    }

    /// Drop the pending entry for `path`, returning it if there was one.
    pub fn cancel(&mut self, path: &Path) -> Option<WatchMessage> {
        self.pending.remove(path).map(|(_, message)| message)
    }

    /// Drop every pending entry at or below `prefix`, returning their paths.
    pub fn cancel_under(&mut self, prefix: &Path) -> Vec<PathBuf> {
        let doomed: Vec<PathBuf> = self
            .pending
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        for path in &doomed {
            self.pending.remove(path);
        }
        doomed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(deadline, _)| *deadline).min()
    }

    /// Remove and return every message whose quiet period has elapsed.
    pub fn take_ready(&mut self, now: Instant) -> Vec<WatchMessage> {
        let mut ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        ready.sort();
        ready
            .iter()
            .filter_map(|path| self.pending.remove(path).map(|(_, message)| message))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::FsChange;

    fn created(path: &str) -> WatchMessage {
        WatchMessage {
            root: PathBuf::from("/r"),
            change: FsChange::FileCreated(PathBuf::from(path)),
        }
    }

    #[test]
    fn test_quiet_period_restarts_on_reschedule() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let t0 = Instant::now();

        debouncer.schedule("/r/a.png".into(), created("/r/a.png"), t0);
        debouncer.schedule("/r/a.png".into(), created("/r/a.png"), t0 + Duration::from_millis(300));
        assert_eq!(debouncer.len(), 1);

        assert!(debouncer.take_ready(t0 + Duration::from_millis(600)).is_empty());
        assert_eq!(debouncer.next_deadline(), Some(t0 + Duration::from_millis(800)));
        assert_eq!(debouncer.take_ready(t0 + Duration::from_millis(800)), vec![created("/r/a.png")]);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn test_cancel_and_cancel_under() {
        let mut debouncer = Debouncer::new(Duration::from_millis(10));
        let now = Instant::now();
        debouncer.schedule("/r/x/1.png".into(), created("/r/x/1.png"), now);
        debouncer.schedule("/r/x/y/2.png".into(), created("/r/x/y/2.png"), now);
        debouncer.schedule("/r/xy/3.png".into(), created("/r/xy/3.png"), now);

        assert_eq!(debouncer.cancel(Path::new("/r/x/1.png")), Some(created("/r/x/1.png")));
        assert_eq!(debouncer.cancel(Path::new("/r/x/1.png")), None);
        assert_eq!(debouncer.cancel_under(Path::new("/r/x")), vec![PathBuf::from("/r/x/y/2.png")]);
        assert_eq!(debouncer.len(), 1);
    }
}
