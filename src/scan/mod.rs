//! Scan queue: diff a root against the catalog and ingest what is new.
//!
//! Roots are scanned strictly one at a time by a single consumer loop. Within
//! a pass, new files are spread round-robin over a fixed worker pool; the
//! results are committed in one transaction once every worker has finished.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::catalog::{self, ScanBatch};
use crate::db::Db;
use crate::error::{GencatError, Result};
use crate::events::{DomainEvent, EventSink};
use crate::ingest::{discover_images, ingest_file, IngestContext};
use crate::paths::path_key;
use crate::registry::ModelCache;
use crate::types::{ModelKind, Photo};

/// Catalog paths to create and delete for one root
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanDiff {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
}

/// Files on disk but not catalogued are created; catalogued but gone are deleted.
pub fn diff_paths(catalog: &HashSet<String>, disk: &HashSet<String>) -> ScanDiff {
    let mut created: Vec<String> = disk.difference(catalog).cloned().collect();
    let mut deleted: Vec<String> = catalog.difference(disk).cloned().collect();
    created.sort();
    deleted.sort();
    ScanDiff { created, deleted }
}

/// Outcome of one pass, for logging
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub created: usize,
    pub ingested: usize,
    pub failed: usize,
    pub deleted: usize,
    pub cancelled: bool,
}

/// Per-root async locks shared by the scan commit and live handlers.
#[derive(Clone, Default)]
pub struct RootLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RootLocks {
    pub async fn lock(&self, root: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(root.to_lowercase()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

/// Producer side of the scan queue
#[derive(Clone)]
pub struct ScanQueue {
    tx: mpsc::UnboundedSender<PathBuf>,
}

impl ScanQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PathBuf>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Request a pass over `root`. Dropped silently once the consumer has stopped.
    pub fn enqueue(&self, root: PathBuf) {
        log::debug!("queueing scan of {}", root.display());
        if self.tx.send(root).is_err() {
            log::debug!("scan queue closed; request dropped");
        }
    }
}

/// Consumer side: runs scan passes.
#[derive(Clone)]
pub struct ScanProcessor {
    db: Db,
    ctx: IngestContext,
    events: EventSink,
    locks: RootLocks,
    workers: usize,
}

impl ScanProcessor {
    pub fn new(db: Db, ctx: IngestContext, events: EventSink, locks: RootLocks, workers: usize) -> Self {
        Self {
            db,
            ctx,
            events,
            locks,
            workers: workers.max(1),
        }
    }

    /// Drain `rx` one root at a time until it closes or `cancel` fires.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<PathBuf>, cancel: CancellationToken) {
        loop {
            let root = tokio::select! {
                _ = cancel.cancelled() => break,
                root = rx.recv() => match root {
                    Some(root) => root,
                    None => break,
                },
            };

            match self.scan_root(&root, &cancel).await {
                Ok(summary) => log::info!(
                    "Scanned {}: {} new ({} failed), {} removed{}",
                    root.display(),
                    summary.ingested,
                    summary.failed,
                    summary.deleted,
                    if summary.cancelled { " (cancelled)" } else { "" }
                ),
                Err(e) => log::warn!("Scan of {} failed: {}", root.display(), e),
            }
        }
        log::debug!("scan queue consumer stopped");
    }

    /// One full pass over `root`.
    pub async fn scan_root(&self, root: &Path, cancel: &CancellationToken) -> Result<ScanSummary> {
        let root_key = path_key(root);

        let walk_root = root.to_path_buf();
        let disk: HashSet<String> = tokio::task::spawn_blocking(move || discover_images(&walk_root))
            .await
            .map_err(|e| GencatError::InvalidInput(format!("walk task join: {}", e)))?
            .iter()
            .map(|p| path_key(p))
            .collect();
        let known = catalog::photo_paths_under(&self.db, &root_key).await?;
        let diff = diff_paths(&known, &disk);
        log::debug!(
            "{}: {} on disk, {} catalogued, {} new, {} gone",
            root_key,
            disk.len(),
            known.len(),
            diff.created.len(),
            diff.deleted.len()
        );

        let cache = Arc::new(ModelCache::seeded(catalog::model_ids(&self.db).await?));
        let total = diff.created.len();
        let mut summary = ScanSummary {
            created: total,
            ..Default::default()
        };

        let photos = self.ingest_all(&root_key, diff.created, cache.clone(), cancel, &mut summary).await;
        log::debug!("{}: {} model(s) first seen this pass", root_key, cache.new_models().len());
        summary.cancelled = cancel.is_cancelled();

        let guard = self.locks.lock(&root_key).await;
        // Live handlers may have deleted or recreated files while the workers ran
        let photos: Vec<Photo> = photos.into_iter().filter(|p| Path::new(&p.path).exists()).collect();
        let deleted: Vec<String> = diff.deleted.into_iter().filter(|p| !Path::new(p).exists()).collect();
        let commit = catalog::commit_scan(
            &self.db,
            ScanBatch {
                photos: photos.clone(),
                deleted,
            },
        )
        .await?;
        drop(guard);

        summary.deleted = commit.deleted_photos.len();
        for path in commit.deleted_photos {
            self.events.emit(DomainEvent::PhotoRemoved(path));
        }
        for model in commit.inserted_models.iter().filter(|m| m.kind == ModelKind::Checkpoint) {
            self.events.emit(DomainEvent::model_added(model));
        }
        for photo in photos {
            self.events.emit(DomainEvent::PhotoAdded(Box::new(photo)));
        }
        for model in &commit.removed_models {
            self.events.emit(DomainEvent::model_removed(model));
        }

        if !summary.cancelled {
            self.events.emit(DomainEvent::ScanProgress {
                path: root_key,
                processed: total,
                total,
            });
        }
        Ok(summary)
    }

    /// Fan `created` out round-robin over the worker pool and collect the photos.
    async fn ingest_all(
        &self,
        root_key: &str,
        created: Vec<String>,
        cache: Arc<ModelCache>,
        cancel: &CancellationToken,
        summary: &mut ScanSummary,
    ) -> Vec<Photo> {
        let total = created.len();
        let worker_count = self.workers.min(total.max(1));
        let mut buckets: Vec<Vec<String>> = vec![Vec::new(); worker_count];
        for (i, path) in created.into_iter().enumerate() {
            buckets[i % worker_count].push(path);
        }

        let processed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(worker_count);
        for bucket in buckets.into_iter().filter(|b| !b.is_empty()) {
            let ctx = self.ctx.clone();
            let cache = cache.clone();
            let events = self.events.clone();
            let cancel = cancel.clone();
            let processed = processed.clone();
            let root_key = root_key.to_string();

            handles.push(tokio::spawn(async move {
                let mut photos = Vec::with_capacity(bucket.len());
                let mut failed = 0;
                for path in bucket {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = ingest_file(Path::new(&path), &ctx, &cache) => result,
                    };
                    match result {
                        Ok(photo) => photos.push(photo),
                        Err(e) => {
                            log::warn!("Skipping {}: {}", path, e);
                            failed += 1;
                        }
                    }
                    let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                    events.emit(DomainEvent::ScanProgress {
                        path: root_key.clone(),
                        processed: done,
                        total,
                    });
                }
                (photos, failed)
            }));
        }

        let mut photos = Vec::with_capacity(total);
        for handle in handles {
            match handle.await {
                Ok((worker_photos, failed)) => {
                    summary.ingested += worker_photos.len();
                    summary.failed += failed;
                    photos.extend(worker_photos);
                }
                Err(e) => log::error!("scan worker for {} panicked: {}", root_key, e),
            }
        }
        photos
    }
}
