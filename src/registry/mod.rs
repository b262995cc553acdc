//! Model registry lookups and the per-pass model cache.
//!
//! A [`ModelResolver`] turns a [`ModelRef`] into a catalog [`Model`]. Every
//! scan pass (and every live single-file ingestion) gets its own
//! [`ModelCache`], so one lookup key costs at most one registry round trip
//! per pass no matter how many workers ask for it.

pub mod civitai;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::metadata::{ModelKey, ModelRef};
use crate::types::{Model, ModelKind};

pub use civitai::CivitaiRegistry;

/// Registry failure modes. Only `Transient` is retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// Request timed out or was cancelled
    #[error("request timed out or was cancelled: {0}")]
    Transient(String),

    /// Non-success HTTP status
    #[error("registry returned status {0}")]
    Status(u16),

    /// Success response without the expected fields
    #[error("unexpected registry response: {0}")]
    Schema(String),

    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),
}

/// What the registry reports for one model version
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryModel {
    pub version_id: i64,
    pub version_name: String,
    pub model_id: i64,
    pub model_name: String,
    /// Registry type string, e.g. `Checkpoint`, `LORA`, `LoCon`
    pub model_type: String,
}

impl RegistryModel {
    /// Accept the remote type when it matches `expected`, or when a LoCon
    /// is looked up as a LORA.
    pub fn as_model(&self, expected: ModelKind) -> Option<Model> {
        let remote: ModelKind = self.model_type.parse().unwrap_or(ModelKind::Unknown);
        let accepted = (remote == expected && expected != ModelKind::Unknown)
            || (expected == ModelKind::Lora && self.model_type.eq_ignore_ascii_case("locon"));
        if !accepted {
            log::debug!(
                "version {} is a {} but a {} was expected",
                self.version_id,
                self.model_type,
                expected
            );
            return None;
        }
        Some(Model {
            version_id: self.version_id,
            name: self.model_name.clone(),
            version_name: self.version_name.clone(),
            model_id: self.model_id,
            kind: expected,
        })
    }
}

/// Remote model registry with two lookups.
pub trait ModelRegistry: Send + Sync {
    fn by_hash<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<RegistryModel, RegistryError>>;

    fn by_version_id(&self, version_id: i64) -> BoxFuture<'_, Result<RegistryModel, RegistryError>>;
}

/// Registry used when lookups are disabled; every lookup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRegistry;

impl ModelRegistry for NullRegistry {
    fn by_hash<'a>(&'a self, _hash: &'a str) -> BoxFuture<'a, Result<RegistryModel, RegistryError>> {
        async { Err(RegistryError::Network("registry lookups are disabled".to_string())) }.boxed()
    }

    fn by_version_id(&self, _version_id: i64) -> BoxFuture<'_, Result<RegistryModel, RegistryError>> {
        async { Err(RegistryError::Network("registry lookups are disabled".to_string())) }.boxed()
    }
}

type LookupCell = Arc<OnceCell<Option<RegistryModel>>>;

/// Model cache scoped to one scan pass.
///
/// Holds one lookup cell per key, shared by concurrent callers, and the set
/// of version ids already registered. Ids seeded from the catalog count as
/// registered, so resolving them again is silent.
#[derive(Default)]
pub struct ModelCache {
    lookups: Mutex<HashMap<ModelKey, LookupCell>>,
    registered: Mutex<HashSet<i64>>,
    new_models: Mutex<Vec<Model>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache for a pass over a catalog that already holds `known_ids`.
    pub fn seeded(known_ids: impl IntoIterator<Item = i64>) -> Self {
        let cache = Self::default();
        lock(&cache.registered).extend(known_ids);
        cache
    }

    fn cell(&self, key: &ModelKey) -> LookupCell {
        lock(&self.lookups).entry(key.clone()).or_default().clone()
    }

    /// Record `model` under its version id.
    ///
    /// Returns `true` only for the first registration in this pass.
    pub fn register(&self, model: &Model) -> bool {
        let first = lock(&self.registered).insert(model.version_id);
        if first {
            lock(&self.new_models).push(model.clone());
        }
        first
    }

    /// Models first registered during this pass, in registration order.
    pub fn new_models(&self) -> Vec<Model> {
        lock(&self.new_models).clone()
    }
}

// A poisoned lock only means another worker panicked mid-insert; the maps stay usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves model references through a registry with retry.
#[derive(Clone)]
pub struct ModelResolver {
    registry: Arc<dyn ModelRegistry>,
    max_attempts: usize,
}

impl ModelResolver {
    pub fn new(registry: Arc<dyn ModelRegistry>, max_attempts: usize) -> Self {
        Self {
            registry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Resolve `key` to a model of `expected` kind.
    ///
    /// Returns `None` on any registry failure or kind mismatch. A model seen
    /// for the first time in this pass is registered in `cache`.
    pub async fn resolve(&self, cache: &ModelCache, key: &ModelKey, expected: ModelKind) -> Option<Model> {
        let cell = cache.cell(key);
        let remote = cell
            .get_or_init(|| async {
                match self.fetch_with_retry(key).await {
                    Ok(model) => Some(model),
                    Err(e) => {
                        log::debug!("lookup of {:?} failed: {}", key, e);
                        None
                    }
                }
            })
            .await
            .as_ref()?;

        let model = remote.as_model(expected)?;
        if cache.register(&model) {
            log::debug!("registered model {} ({})", model.version_id, model.name);
        }
        Some(model)
    }

    /// Resolve every reference, pairing each hit with its weight.
    pub async fn resolve_all(&self, cache: &ModelCache, refs: &[ModelRef]) -> Vec<(Model, Option<f64>)> {
        let mut resolved: Vec<(Model, Option<f64>)> = Vec::new();
        for model_ref in refs {
            if let Some(model) = self.resolve(cache, &model_ref.key, model_ref.kind).await {
                // A hash and a version id can name the same model
                if resolved.iter().all(|(m, _)| m.version_id != model.version_id) {
                    resolved.push((model, model_ref.weight));
                }
            }
        }
        resolved
    }

    async fn fetch_with_retry(&self, key: &ModelKey) -> Result<RegistryModel, RegistryError> {
        let mut attempt = 1;
        loop {
            let result = match key {
                ModelKey::Hash(hash) => self.registry.by_hash(hash).await,
                ModelKey::VersionId(id) => self.registry.by_version_id(*id).await,
            };
            match result {
                Err(RegistryError::Transient(e)) if attempt < self.max_attempts => {
                    log::debug!("Retry {}/{} for {:?} after: {}", attempt, self.max_attempts, key, e);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory registry that counts lookups and can fail transiently first.
    #[derive(Default)]
    pub(crate) struct FakeRegistry {
        pub models: HashMap<ModelKey, RegistryModel>,
        pub calls: AtomicUsize,
        pub transient_failures: AtomicUsize,
    }

    impl FakeRegistry {
        pub fn with(models: Vec<(ModelKey, RegistryModel)>) -> Self {
            Self {
                models: models.into_iter().collect(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn lookup(&self, key: ModelKey) -> BoxFuture<'_, Result<RegistryModel, RegistryError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                let failures = self.transient_failures.load(Ordering::SeqCst);
                if failures > 0 {
                    self.transient_failures.store(failures - 1, Ordering::SeqCst);
                    return Err(RegistryError::Transient("timed out".into()));
                }
                self.models.get(&key).cloned().ok_or(RegistryError::Status(404))
            }
            .boxed()
        }
    }

    impl ModelRegistry for FakeRegistry {
        fn by_hash<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<RegistryModel, RegistryError>> {
            self.lookup(ModelKey::Hash(hash.to_string()))
        }

        fn by_version_id(&self, version_id: i64) -> BoxFuture<'_, Result<RegistryModel, RegistryError>> {
            self.lookup(ModelKey::VersionId(version_id))
        }
    }

    pub(crate) fn remote(version_id: i64, model_type: &str) -> RegistryModel {
        RegistryModel {
            version_id,
            version_name: format!("v{}", version_id),
            model_id: version_id * 10,
            model_name: format!("model-{}", version_id),
            model_type: model_type.to_string(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_lookup() {
        let fake = Arc::new(FakeRegistry::with(vec![(ModelKey::VersionId(7), remote(7, "Checkpoint"))]));
        let resolver = ModelResolver::new(fake.clone(), 10);
        let cache = Arc::new(ModelCache::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve(&cache, &ModelKey::VersionId(7), ModelKind::Checkpoint)
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().version_id, 7);
        }

        assert_eq!(fake.calls(), 1);
        assert_eq!(cache.new_models().len(), 1);
    }

    #[tokio::test]
    async fn test_locon_accepted_as_lora() {
        let key = ModelKey::Hash("abcd".into());
        let fake = Arc::new(FakeRegistry::with(vec![(key.clone(), remote(3, "LoCon"))]));
        let resolver = ModelResolver::new(fake, 10);
        let cache = ModelCache::new();

        let model = resolver.resolve(&cache, &key, ModelKind::Lora).await.unwrap();
        assert_eq!(model.kind, ModelKind::Lora);
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_none() {
        let key = ModelKey::Hash("abcd".into());
        let fake = Arc::new(FakeRegistry::with(vec![(key.clone(), remote(3, "LORA"))]));
        let resolver = ModelResolver::new(fake.clone(), 10);
        let cache = ModelCache::new();

        assert!(resolver.resolve(&cache, &key, ModelKind::Checkpoint).await.is_none());
        assert!(cache.new_models().is_empty());
        // Cached response is reused for the correct kind
        assert!(resolver.resolve(&cache, &key, ModelKind::Lora).await.is_some());
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fake = Arc::new(FakeRegistry::with(vec![(ModelKey::VersionId(1), remote(1, "VAE"))]));
        fake.transient_failures.store(3, Ordering::SeqCst);
        let resolver = ModelResolver::new(fake.clone(), 10);

        let model = resolver
            .resolve(&ModelCache::new(), &ModelKey::VersionId(1), ModelKind::Vae)
            .await;
        assert!(model.is_some());
        assert_eq!(fake.calls(), 4);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let fake = Arc::new(FakeRegistry::with(vec![(ModelKey::VersionId(1), remote(1, "VAE"))]));
        fake.transient_failures.store(100, Ordering::SeqCst);
        let resolver = ModelResolver::new(fake.clone(), 10);

        let model = resolver
            .resolve(&ModelCache::new(), &ModelKey::VersionId(1), ModelKind::Vae)
            .await;
        assert!(model.is_none());
        assert_eq!(fake.calls(), 10);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried_and_cached() {
        let fake = Arc::new(FakeRegistry::default());
        let resolver = ModelResolver::new(fake.clone(), 10);
        let cache = ModelCache::new();

        let key = ModelKey::Hash("ff".into());
        assert!(resolver.resolve(&cache, &key, ModelKind::Checkpoint).await.is_none());
        assert!(resolver.resolve(&cache, &key, ModelKind::Checkpoint).await.is_none());
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn test_seeded_ids_are_not_new() {
        let fake = Arc::new(FakeRegistry::with(vec![(ModelKey::VersionId(5), remote(5, "Checkpoint"))]));
        let resolver = ModelResolver::new(fake, 10);
        let cache = ModelCache::seeded([5]);

        assert!(resolver
            .resolve(&cache, &ModelKey::VersionId(5), ModelKind::Checkpoint)
            .await
            .is_some());
        assert!(cache.new_models().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_all_merges_hash_and_id_for_same_model() {
        let fake = Arc::new(FakeRegistry::with(vec![
            (ModelKey::Hash("aa".into()), remote(9, "LORA")),
            (ModelKey::VersionId(9), remote(9, "LORA")),
        ]));
        let resolver = ModelResolver::new(fake, 10);
        let refs = vec![
            ModelRef {
                key: ModelKey::Hash("aa".into()),
                kind: ModelKind::Lora,
                name: Some("x".into()),
                weight: Some(0.5),
            },
            ModelRef {
                key: ModelKey::VersionId(9),
                kind: ModelKind::Lora,
                name: None,
                weight: None,
            },
        ];

        let resolved = resolver.resolve_all(&ModelCache::new(), &refs).await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1, Some(0.5));
    }
}
