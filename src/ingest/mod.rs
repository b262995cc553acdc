//! Single-file ingestion: stat → extract → parse → resolve → thumbnail.

pub mod thumbnail;
pub mod walker;

pub use walker::{discover_directories, discover_images, file_stat, FileStat};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{GencatError, MetadataError, Result};
use crate::metadata::{parse_parameters, read_embedded_text, ModelRef};
use crate::paths::path_key;
use crate::registry::{ModelCache, ModelResolver};
use crate::types::{GenerationParameters, LinkedModel, Photo};

/// Residual-map key for a record whose metadata could not be parsed
pub const METADATA_ERROR_KEY: &str = "Metadata Parsing Error";
/// Residual-map key for a file whose pixels could not be decoded
pub const THUMBNAIL_ERROR_KEY: &str = "Thumbnail Error";

/// Shared, read-only inputs of every ingestion
#[derive(Clone)]
pub struct IngestContext {
    pub resolver: ModelResolver,
    pub thumbnail_size: u32,
}

/// Output of the blocking half of an ingestion
struct LocalFile {
    stat: FileStat,
    raw_metadata: Option<String>,
    parameters: GenerationParameters,
    extra: BTreeMap<String, String>,
    model_refs: Vec<ModelRef>,
    width: u32,
    height: u32,
    thumbnail: Vec<u8>,
}

fn read_local(path: &Path, thumbnail_size: u32) -> Result<LocalFile> {
    let stat = file_stat(path)?;
    let mut extra = BTreeMap::new();
    let mut parameters = GenerationParameters::default();
    let mut model_refs = Vec::new();

    let raw_metadata = match read_embedded_text(path) {
        Ok(text) => Some(text),
        Err(GencatError::Metadata(MetadataError::MissingText)) => {
            log::debug!("no generation metadata in {}", path.display());
            None
        }
        Err(GencatError::Metadata(e)) => {
            log::warn!("unreadable metadata in {}: {}", path.display(), e);
            extra.insert(METADATA_ERROR_KEY.to_string(), e.to_string());
            None
        }
        Err(e) => return Err(e),
    };

    if let Some(text) = &raw_metadata {
        match parse_parameters(text) {
            Ok(parsed) => {
                parameters = parsed.parameters;
                extra.extend(parsed.extra);
                model_refs = parsed.model_refs;
            }
            Err(e) => {
                // Keep the raw text for diagnosis; typed fields stay empty
                log::warn!("failed to parse metadata of {}: {}", path.display(), e);
                extra.insert(METADATA_ERROR_KEY.to_string(), e.to_string());
            }
        }
    }

    let (width, height, thumbnail) = match thumbnail::render(path, thumbnail_size) {
        Ok(thumb) => (thumb.width, thumb.height, thumb.bytes),
        Err(e) => {
            log::warn!("failed to decode {}: {}", path.display(), e);
            extra.insert(THUMBNAIL_ERROR_KEY.to_string(), e.to_string());
            (0, 0, thumbnail::placeholder(thumbnail_size)?)
        }
    };

    Ok(LocalFile {
        stat,
        raw_metadata,
        parameters,
        extra,
        model_refs,
        width,
        height,
        thumbnail,
    })
}

/// Ingest one image file into a [`Photo`], resolving its models through `cache`.
///
/// Metadata and decode problems end up as residual-map diagnostics. Only a
/// file that cannot be read at all is an error.
pub async fn ingest_file(path: &Path, ctx: &IngestContext, cache: &ModelCache) -> Result<Photo> {
    let owned: PathBuf = path.to_path_buf();
    let size = ctx.thumbnail_size;
    let local = tokio::task::spawn_blocking(move || read_local(&owned, size))
        .await
        .map_err(|e| GencatError::InvalidInput(format!("ingest task join: {}", e)))??;

    let models = ctx
        .resolver
        .resolve_all(cache, &local.model_refs)
        .await
        .into_iter()
        .map(|(model, weight)| LinkedModel { model, weight })
        .collect();

    Ok(Photo {
        path: path_key(&local.stat.path),
        name: local.stat.name,
        created_at: local.stat.created_at,
        modified_at: local.stat.modified_at,
        file_size: local.stat.file_size,
        width: local.width,
        height: local.height,
        raw_metadata: local.raw_metadata,
        parameters: local.parameters,
        extra: local.extra,
        thumbnail: local.thumbnail,
        models,
    })
}
