//! Catalog entities shared by the parser, resolver, scanner and coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of a registry model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    Checkpoint,
    Lora,
    TextualInversion,
    Vae,
    Unknown,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Checkpoint => "Checkpoint",
            ModelKind::Lora => "LORA",
            ModelKind::TextualInversion => "TextualInversion",
            ModelKind::Vae => "VAE",
            ModelKind::Unknown => "Unknown",
        }
    }

    /// Map a `type` field of an embedded civitai resource entry.
    pub fn from_resource_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "checkpoint" | "model" => ModelKind::Checkpoint,
            "lora" | "locon" | "lycoris" => ModelKind::Lora,
            "embed" | "embedding" | "textualinversion" => ModelKind::TextualInversion,
            "vae" => ModelKind::Vae,
            _ => ModelKind::Unknown,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = std::convert::Infallible;

    /// Registry spelling; anything unrecognized is `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Checkpoint" => ModelKind::Checkpoint,
            "LORA" => ModelKind::Lora,
            "TextualInversion" => ModelKind::TextualInversion,
            "VAE" => ModelKind::Vae,
            _ => ModelKind::Unknown,
        })
    }
}

/// A resolved model version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub version_id: i64,
    pub name: String,
    pub version_name: String,
    pub model_id: i64,
    pub kind: ModelKind,
}

/// A model linked to a photo, with the LORA strength when known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedModel {
    pub model: Model,
    pub weight: Option<f64>,
}

/// ADetailer post-processing settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdetailerParameters {
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub confidence: Option<f64>,
    pub dilate_erode: Option<i64>,
    pub mask_blur: Option<i64>,
    pub denoising_strength: Option<f64>,
    pub inpaint_only_masked: Option<bool>,
    pub inpaint_padding: Option<i64>,
    pub version: Option<String>,
}

/// Typed generation settings recovered from embedded metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub steps: Option<i64>,
    pub sampler: Option<String>,
    pub schedule_type: Option<String>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<i64>,
    pub generated_width: Option<i64>,
    pub generated_height: Option<i64>,
    pub model_name: Option<String>,
    pub model_hash: Option<String>,
    pub vae: Option<String>,
    pub vae_hash: Option<String>,
    pub clip_skip: Option<i64>,
    pub denoising_strength: Option<f64>,
    pub variation_seed: Option<i64>,
    pub variation_seed_strength: Option<f64>,
    pub hires_upscale: Option<f64>,
    pub hires_steps: Option<i64>,
    pub hires_upscaler: Option<String>,
    pub adetailer: Option<AdetailerParameters>,
    pub remix_of_id: Option<i64>,
}

/// One catalogued image file. `path` is the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub path: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub file_size: u64,
    pub width: u32,
    pub height: u32,
    pub raw_metadata: Option<String>,
    pub parameters: GenerationParameters,
    /// Residual map: metadata keys without a typed field, plus diagnostics
    pub extra: BTreeMap<String, String>,
    #[serde(skip)]
    pub thumbnail: Vec<u8>,
    pub models: Vec<LinkedModel>,
}

/// A watched root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Folder {
    pub path: String,
}
