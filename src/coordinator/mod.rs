//! Ingestion coordinator: owns the watchers and the scan queue, and turns
//! live filesystem changes into catalog mutations and domain events.
//!
//! A single consumer loop routes live changes. Deletes and renames are
//! applied in order by the loop itself; ingesting a created or changed file
//! (decode, thumbnail, registry lookups) runs on its own task. Mutations of
//! a root hold that root's lock, which the scan commit also takes, so a live
//! rename never interleaves with a pass's batch commit.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::catalog;
use crate::db::Db;
use crate::error::{GencatError, Result};
use crate::events::{DomainEvent, EventSink};
use crate::ingest::{discover_directories, file_stat, ingest_file, IngestContext};
use crate::paths::{is_under_ignore_case, path_key};
use crate::registry::ModelCache;
use crate::scan::{RootLocks, ScanProcessor, ScanQueue};
use crate::types::{Folder, Model, ModelKind};
use crate::watch::{Debouncer, FsChange, RootWatcher, WatchMessage};

/// Runtime tuning for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub workers: usize,
    pub debounce: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            debounce: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// State shared by the command surface and the live-change loop.
struct Shared {
    db: Db,
    ctx: IngestContext,
    events: EventSink,
    queue: ScanQueue,
    locks: RootLocks,
    watchers: Mutex<HashMap<String, RootWatcher>>,
    watch_tx: mpsc::UnboundedSender<WatchMessage>,
}

/// Engine entry point
pub struct Coordinator {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

fn root_key(path: &Path) -> String {
    let key = path_key(path);
    let trimmed = key.trim_end_matches(['/', std::path::MAIN_SEPARATOR]);
    if trimmed.is_empty() {
        key
    } else {
        trimmed.to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Coordinator {
    /// Spawn the scan consumer and the live-change loop.
    pub fn start(db: Db, ctx: IngestContext, events: EventSink, settings: CoordinatorSettings) -> Self {
        let (queue, scan_rx) = ScanQueue::new();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let locks = RootLocks::default();
        let cancel = CancellationToken::new();

        let processor = ScanProcessor::new(db.clone(), ctx.clone(), events.clone(), locks.clone(), settings.workers);
        let shared = Arc::new(Shared {
            db,
            ctx,
            events,
            queue,
            locks,
            watchers: Mutex::new(HashMap::new()),
            watch_tx,
        });

        let scan_task = tokio::spawn(processor.run(scan_rx, cancel.clone()));
        let watch_task = tokio::spawn(shared.clone().run_changes(watch_rx, cancel.clone(), settings.debounce));

        Self {
            shared,
            cancel,
            tasks: Mutex::new(vec![scan_task, watch_task]),
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    /// Watch a new root. Returns `false` when an existing root already covers it.
    pub async fn add_folder(&self, path: &Path) -> Result<bool> {
        self.shared.add_folder(path).await
    }

    /// Reconcile persisted roots with the disk and resume watching them.
    pub async fn initialize(&self) -> Result<()> {
        self.shared.initialize().await
    }

    /// Queue a full pass over `root`.
    pub fn enqueue_scan(&self, root: &Path) {
        self.shared.queue.enqueue(root.to_path_buf());
    }

    /// Apply one change immediately, bypassing the debounce.
    pub async fn handle_change(&self, message: WatchMessage) {
        self.shared.handle(message).await;
    }

    /// Roots with a live watcher, sorted.
    pub fn watched_roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = lock(&self.shared.watchers).keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Stop the scan consumer and the change loop, dispose every watcher and
    /// wait a bounded time for background tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let watchers: Vec<RootWatcher> = lock(&self.shared.watchers).drain().map(|(_, w)| w).collect();
        for watcher in &watchers {
            watcher.dispose();
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        match tokio::time::timeout(self.shutdown_timeout, join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        log::warn!("background task ended abnormally: {}", e);
                    }
                }
            }
            Err(_) => log::warn!(
                "background tasks did not stop within {:?}; continuing shutdown",
                self.shutdown_timeout
            ),
        }
        log::info!("Coordinator stopped");
    }
}

impl Shared {
    async fn run_changes(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WatchMessage>,
        cancel: CancellationToken,
        debounce: Duration,
    ) {
        let mut debouncer = Debouncer::new(debounce);
        let mut ingesting = JoinSet::new();
        loop {
            let deadline = debouncer.next_deadline();
            let quiet = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => self.route(message, &mut debouncer, &mut ingesting).await,
                    None => break,
                },
                _ = quiet => {
                    for message in debouncer.take_ready(tokio::time::Instant::now()) {
                        self.ingest_later(message, &mut ingesting);
                    }
                }
                Some(joined) = ingesting.join_next(), if !ingesting.is_empty() => {
                    if let Err(e) = joined {
                        log::warn!("ingestion task ended abnormally: {}", e);
                    }
                }
            }
        }
        ingesting.shutdown().await;
        log::debug!("change loop stopped");
    }

    fn ingest_later(self: &Arc<Self>, message: WatchMessage, ingesting: &mut JoinSet<()>) {
        let shared = self.clone();
        ingesting.spawn(async move { shared.handle(message).await });
    }

    /// Debounce creates and changes; flush or retarget pending entries on deletes and renames.
    async fn route(self: &Arc<Self>, message: WatchMessage, debouncer: &mut Debouncer, ingesting: &mut JoinSet<()>) {
        let now = tokio::time::Instant::now();
        match &message.change {
            FsChange::FileCreated(path) | FsChange::FileChanged(path) => {
                debouncer.schedule(path.clone(), message.clone(), now);
            }
            FsChange::FileDeleted(path) => {
                debouncer.cancel(path);
                self.handle(message).await;
            }
            FsChange::FileRenamed { from, to } => {
                let created = WatchMessage {
                    root: message.root.clone(),
                    change: FsChange::FileCreated(to.clone()),
                };
                if debouncer.cancel(from).is_some() {
                    // Not ingested yet: treat the new name as a fresh file
                    debouncer.schedule(to.clone(), created, now);
                    return;
                }
                match self.file_renamed(&root_key(&message.root), from, to).await {
                    Ok(true) => {}
                    Ok(false) => self.ingest_later(created, ingesting),
                    Err(e) => log::warn!("Failed to apply {:?}: {}", message.change, e),
                }
            }
            FsChange::DirectoryDeleted(path) => {
                debouncer.cancel_under(path);
                self.handle(message).await;
            }
            FsChange::DirectoryRenamed { from, to } => {
                for pending in debouncer.cancel_under(from) {
                    if let Ok(rest) = pending.strip_prefix(from) {
                        let moved = to.join(rest);
                        let created = WatchMessage {
                            root: message.root.clone(),
                            change: FsChange::FileCreated(moved.clone()),
                        };
                        debouncer.schedule(moved, created, now);
                    }
                }
                self.handle(message).await;
            }
            FsChange::DirectoryCreated(_) | FsChange::Overflow => self.handle(message).await,
        }
    }

    /// Apply one change. Failures are logged, never propagated.
    async fn handle(&self, message: WatchMessage) {
        let root = root_key(&message.root);
        let result = match &message.change {
            FsChange::FileCreated(path) | FsChange::FileChanged(path) => self.file_upserted(&root, path).await,
            FsChange::FileDeleted(path) => self.file_deleted(&root, path).await,
            FsChange::FileRenamed { from, to } => match self.file_renamed(&root, from, to).await {
                Ok(true) => Ok(()),
                // Never catalogued under the old name: ingest under the new one
                Ok(false) => self.file_upserted(&root, to).await,
                Err(e) => Err(e),
            },
            FsChange::DirectoryCreated(path) => self.directory_created(&message.root, path).await,
            FsChange::DirectoryDeleted(path) => self.directory_deleted(&root, path).await,
            FsChange::DirectoryRenamed { from, to } => self.directory_renamed(&root, from, to).await,
            FsChange::Overflow => {
                log::info!("Events dropped under {}; rescanning", root);
                self.queue.enqueue(message.root.clone());
                Ok(())
            }
        };
        if let Err(e) = result {
            log::warn!("Failed to apply {:?}: {}", message.change, e);
        }
    }

    fn emit_models_added(&self, models: &[Model]) {
        for model in models.iter().filter(|m| m.kind == ModelKind::Checkpoint) {
            self.events.emit(DomainEvent::model_added(model));
        }
    }

    fn emit_models_removed(&self, models: &[Model]) {
        for model in models {
            self.events.emit(DomainEvent::model_removed(model));
        }
    }

    /// Re-ingest a created or changed file and replace its catalog entry.
    async fn file_upserted(&self, root: &str, path: &Path) -> Result<()> {
        if !path.is_file() {
            log::debug!("{} vanished before ingestion", path.display());
            return Ok(());
        }

        let cache = ModelCache::seeded(catalog::model_ids(&self.db).await?);
        let photo = ingest_file(path, &self.ctx, &cache).await?;
        let key = photo.path.clone();

        let _guard = self.locks.lock(root).await;
        // Ingestion ran unlocked; if the file has since changed or vanished,
        // a later event carries the newer state
        match file_stat(path) {
            Ok(stat) if stat.modified_at == photo.modified_at => {}
            _ => {
                log::debug!("{} changed during ingestion; skipping", path.display());
                return Ok(());
            }
        }
        let existed = catalog::get_photo(&self.db, &key).await?.is_some();
        let inserted = catalog::upsert_photo(&self.db, photo.clone()).await?;
        let removed = catalog::sweep_unused_models(&self.db).await?;

        if existed {
            self.events.emit(DomainEvent::PhotoRemoved(key.clone()));
        }
        self.emit_models_added(&inserted);
        self.events.emit(DomainEvent::PhotoAdded(Box::new(photo)));
        self.emit_models_removed(&removed);
        log::debug!("{} {}", if existed { "Updated" } else { "Added" }, key);
        Ok(())
    }

    async fn file_deleted(&self, root: &str, path: &Path) -> Result<()> {
        let key = path_key(path);
        let _guard = self.locks.lock(root).await;
        if catalog::delete_photo(&self.db, &key).await? {
            let removed = catalog::sweep_unused_models(&self.db).await?;
            self.events.emit(DomainEvent::PhotoRemoved(key));
            self.emit_models_removed(&removed);
        }
        Ok(())
    }

    /// Move a catalogued entry in place. Returns `false` when `from` was never catalogued.
    async fn file_renamed(&self, root: &str, from: &Path, to: &Path) -> Result<bool> {
        let (old, new) = (path_key(from), path_key(to));
        let renamed = {
            let _guard = self.locks.lock(root).await;
            catalog::rename_photo(&self.db, &old, &new).await?
        };

        match renamed {
            Some(photo) => {
                self.events.emit(DomainEvent::PhotoRemoved(old));
                self.events.emit(DomainEvent::PhotoAdded(Box::new(photo)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Announce the directory and its subdirectories; files that moved in
    /// with it produce no events of their own, so the root is rescanned.
    async fn directory_created(&self, root: &Path, path: &Path) -> Result<()> {
        self.events.emit(DomainEvent::FolderAdded(path_key(path)));
        for dir in list_directories(path).await? {
            self.events.emit(DomainEvent::FolderAdded(path_key(&dir)));
        }
        self.queue.enqueue(root.to_path_buf());
        Ok(())
    }

    async fn directory_deleted(&self, root: &str, path: &Path) -> Result<()> {
        let key = root_key(path);
        let _guard = self.locks.lock(root).await;

        let deleted = catalog::delete_photos_under(&self.db, &key).await?;
        let removed = catalog::sweep_unused_models(&self.db).await?;
        let was_root = catalog::remove_folder(&self.db, &key).await?;
        if was_root {
            self.stop_watching(&key);
        }

        let deleted_any = !deleted.is_empty();
        for photo_path in deleted {
            self.events.emit(DomainEvent::PhotoRemoved(photo_path));
        }
        self.emit_models_removed(&removed);
        // Vanished non-image files land here too; they held nothing
        if was_root || deleted_any || path.extension().is_none() {
            self.events.emit(DomainEvent::FolderRemoved(key));
        }
        Ok(())
    }

    async fn directory_renamed(&self, root: &str, from: &Path, to: &Path) -> Result<()> {
        let (old, new) = (root_key(from), root_key(to));
        let outcome = {
            let _guard = self.locks.lock(root).await;
            catalog::rename_prefix(&self.db, &old, &new).await?
        };

        for (old_root, new_root) in &outcome.folders {
            self.stop_watching(old_root);
            self.start_watching(Path::new(new_root));
        }

        self.events.emit(DomainEvent::FolderRemoved(old.clone()));
        self.events.emit(DomainEvent::FolderAdded(new.clone()));
        if !outcome.photos.is_empty() {
            let photos = catalog::photos_under(&self.db, &new).await?;
            for (old_path, _) in &outcome.photos {
                self.events.emit(DomainEvent::PhotoRemoved(old_path.clone()));
            }
            for photo in photos {
                self.events.emit(DomainEvent::PhotoAdded(Box::new(photo)));
            }
        }
        log::info!("Renamed {} -> {} ({} photos)", old, new, outcome.photos.len());
        Ok(())
    }

    fn start_watching(&self, root: &Path) {
        let key = root_key(root);
        match RootWatcher::start(root, self.watch_tx.clone()) {
            Ok(watcher) => {
                if let Some(previous) = lock(&self.watchers).insert(key, watcher) {
                    previous.dispose();
                }
            }
            Err(e) => log::warn!("Cannot watch {}: {}; relying on scans", root.display(), e),
        }
    }

    fn stop_watching(&self, root: &str) {
        let watcher = lock(&self.watchers).remove(root);
        if let Some(watcher) = watcher {
            watcher.dispose();
        }
    }

    /// Announce, watch and scan a root whose Folder row exists.
    async fn activate(&self, root: &Path) -> Result<()> {
        self.events.emit(DomainEvent::FolderAdded(root_key(root)));
        for dir in list_directories(root).await? {
            self.events.emit(DomainEvent::FolderAdded(path_key(&dir)));
        }
        self.start_watching(root);
        self.queue.enqueue(root.to_path_buf());
        Ok(())
    }

    async fn add_folder(&self, path: &Path) -> Result<bool> {
        if !path.is_dir() {
            return Err(GencatError::InvalidInput(format!("{} is not a directory", path.display())));
        }
        let key = root_key(path);
        let existing = catalog::folders(&self.db).await?;

        if let Some(cover) = catalog::covering_root(&existing, &key) {
            log::info!("{} is already covered by {}", key, cover.path);
            return Ok(false);
        }

        // A new ancestor absorbs its descendants; their photos stay catalogued
        for descendant in existing.iter().filter(|f| is_under_ignore_case(&f.path, &key)) {
            catalog::remove_folder(&self.db, &descendant.path).await?;
            self.stop_watching(&descendant.path);
            self.events.emit(DomainEvent::FolderRemoved(descendant.path.clone()));
            log::info!("{} absorbed into {}", descendant.path, key);
        }

        catalog::insert_folder(&self.db, &key).await?;
        self.activate(Path::new(&key)).await?;
        log::info!("Added folder {}", key);
        Ok(true)
    }

    async fn initialize(&self) -> Result<()> {
        let mut surviving: Vec<Folder> = Vec::new();
        for folder in catalog::folders(&self.db).await? {
            if Path::new(&folder.path).is_dir() {
                surviving.push(folder);
                continue;
            }
            log::warn!("Folder {} is gone; removing it", folder.path);
            let deleted = catalog::delete_photos_under(&self.db, &folder.path).await?;
            catalog::remove_folder(&self.db, &folder.path).await?;
            for photo_path in deleted {
                self.events.emit(DomainEvent::PhotoRemoved(photo_path));
            }
            self.events.emit(DomainEvent::FolderRemoved(folder.path));
        }

        let models = catalog::models(&self.db).await?;
        self.emit_models_added(&models);
        let removed = catalog::sweep_unused_models(&self.db).await?;
        self.emit_models_removed(&removed);

        for folder in &surviving {
            self.activate(Path::new(&folder.path)).await?;
        }
        log::info!("Initialized {} folder(s)", surviving.len());
        Ok(())
    }
}

async fn list_directories(root: &Path) -> Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || discover_directories(&root))
        .await
        .map_err(|e| GencatError::InvalidInput(format!("directory walk join: {}", e)))
}
