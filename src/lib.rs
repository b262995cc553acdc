pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod events;
pub mod ingest;
pub mod metadata;
pub mod paths;
pub mod registry;
pub mod scan;
pub mod types;
pub mod watch;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use error::{GencatError, MetadataError, Result};
pub use events::{DomainEvent, EventSink};
pub use metadata::{parse_parameters, ParsedMetadata};
pub use types::{Folder, GenerationParameters, LinkedModel, Model, ModelKind, Photo};

use std::sync::Arc;
use std::time::Duration;

use ingest::IngestContext;
use registry::{CivitaiRegistry, ModelRegistry, ModelResolver, NullRegistry};

/// Build the ingestion context (registry client + thumbnail size) from config.
pub fn ingest_context(config: &Config) -> Result<IngestContext> {
    let registry: Arc<dyn ModelRegistry> = if config.registry.enabled {
        Arc::new(CivitaiRegistry::new(&config.registry)?)
    } else {
        log::info!("Model registry disabled; references stay unresolved");
        Arc::new(NullRegistry)
    };
    Ok(IngestContext {
        resolver: ModelResolver::new(registry, config.registry.max_attempts),
        thumbnail_size: config.thumbnail.size,
    })
}

/// Coordinator tuning from config.
pub fn coordinator_settings(config: &Config) -> CoordinatorSettings {
    CoordinatorSettings {
        workers: config.worker_count(),
        debounce: Duration::from_millis(config.scan.debounce_ms),
        shutdown_timeout: Duration::from_millis(config.scan.shutdown_timeout_ms),
    }
}
