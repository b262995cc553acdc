//! Generation-parameter metadata: recovery from image files and parsing.
//!
//! The text format is the one image-generation front-ends write into a PNG
//! `parameters` chunk or a JPEG `UserComment`:
//!
//! ```text
//! <prompt, possibly over several lines>
//! Negative prompt: <negative prompt, possibly over several lines>
//! Steps: 20, Sampler: Euler, CFG scale: 7.5, Seed: 12345, Size: 512x768, ...
//! ```

pub mod civitai;
pub mod extract;
pub mod hashes;
pub mod kv;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use crate::error::MetadataError;
use crate::types::{AdetailerParameters, GenerationParameters, ModelKind};
use kv::{unquote, KeyValuePairs};

pub use extract::read_embedded_text;

/// How a model is looked up in the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKey {
    Hash(String),
    VersionId(i64),
}

/// A model mentioned by the metadata, before resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub key: ModelKey,
    pub kind: ModelKind,
    pub name: Option<String>,
    pub weight: Option<f64>,
}

/// Result of parsing one metadata blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedMetadata {
    pub parameters: GenerationParameters,
    pub extra: BTreeMap<String, String>,
    pub model_refs: Vec<ModelRef>,
}

/// Parse a raw metadata blob.
///
/// Invalid values for typed keys fail the whole record. Failures inside the
/// hash and civitai sub-lists are recorded as `"<X> Parsing Error"` entries
/// in the residual map instead.
pub fn parse_parameters(text: &str) -> Result<ParsedMetadata, MetadataError> {
    let text = text.trim_start_matches('\u{feff}');
    let mut lines = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .skip_while(|l| l.trim().is_empty());

    let first = lines.next().ok_or(MetadataError::MissingText)?;
    let first = strip_label(first, "parameters:").unwrap_or(first);

    let mut prompt_lines = Vec::new();
    let mut pending = Some(first);
    while let Some(line) = pending.take().or_else(|| lines.next()) {
        if starts_with_ci(line, "negative prompt") || starts_with_ci(line, "steps") {
            pending = Some(line);
            break;
        }
        prompt_lines.push(line.trim());
    }

    let mut negative_lines = Vec::new();
    if let Some(line) = pending.filter(|l| starts_with_ci(l, "negative prompt")) {
        let (_, rest) = line
            .split_once(':')
            .ok_or_else(|| MetadataError::format("negative prompt label without ':'"))?;
        negative_lines.push(rest.trim());
        pending = None;
        for line in lines.by_ref() {
            if starts_with_ci(line, "steps") {
                pending = Some(line);
                break;
            }
            negative_lines.push(line.trim());
        }
    }

    let mut builder = Builder::new(join_lines(&prompt_lines), join_lines(&negative_lines));

    if let Some(line) = pending {
        for pair in KeyValuePairs::new(line.trim()) {
            let (key, value) = pair?;
            builder.apply(&key, value)?;
        }
        let trailing = lines.filter(|l| !l.trim().is_empty()).count();
        if trailing > 0 {
            log::debug!("ignoring {} line(s) after the parameter line", trailing);
        }
    }

    Ok(builder.finish())
}

fn starts_with_ci(line: &str, prefix: &str) -> bool {
    let line = line.trim_start();
    line.len() >= prefix.len()
        && line.is_char_boundary(prefix.len())
        && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    if starts_with_ci(line, label) {
        let line = line.trim_start();
        Some(&line[label.len()..])
    } else {
        None
    }
}

fn join_lines(lines: &[&str]) -> Option<String> {
    let joined = lines
        .iter()
        .filter(|l| !l.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

/// `<lora:name:weight>` tags in the prompt, keyed by lower-cased name.
fn prompt_lora_weights(prompt: &str) -> HashMap<String, f64> {
    static LORA_TAG: OnceLock<Regex> = OnceLock::new();
    let re = LORA_TAG.get_or_init(|| {
        Regex::new(r"(?i)<lora:([^:>]+):\s*([-+]?[0-9]*\.?[0-9]+)[^>]*>").expect("Invalid regex pattern")
    });

    re.captures_iter(prompt)
        .filter_map(|cap| {
            let weight = cap[2].parse::<f64>().ok()?;
            Some((cap[1].trim().to_lowercase(), weight))
        })
        .collect()
}

fn parse_int(key: &str, value: &str) -> Result<i64, MetadataError> {
    unquote(value).trim().parse().map_err(|_| MetadataError::invalid(key, value))
}

fn parse_decimal(key: &str, value: &str) -> Result<f64, MetadataError> {
    unquote(value).trim().parse().map_err(|_| MetadataError::invalid(key, value))
}

fn parse_size(key: &str, value: &str) -> Result<(i64, i64), MetadataError> {
    let raw = unquote(value);
    let (w, h) = raw.split_once('x').ok_or_else(|| MetadataError::invalid(key, value))?;
    let w = w.trim().parse().map_err(|_| MetadataError::invalid(key, value))?;
    let h = h.trim().parse().map_err(|_| MetadataError::invalid(key, value))?;
    Ok((w, h))
}

fn text(value: &str) -> Option<String> {
    Some(unquote(value))
}

/// Accumulates typed fields, residual entries and model references.
struct Builder {
    parameters: GenerationParameters,
    extra: BTreeMap<String, String>,
    refs: Vec<ModelRef>,
    lora_weights: HashMap<String, f64>,
}

impl Builder {
    fn new(prompt: Option<String>, negative_prompt: Option<String>) -> Self {
        let lora_weights = prompt.as_deref().map(prompt_lora_weights).unwrap_or_default();
        Self {
            parameters: GenerationParameters {
                prompt,
                negative_prompt,
                ..Default::default()
            },
            extra: BTreeMap::new(),
            refs: Vec::new(),
            lora_weights,
        }
    }

    fn adetailer(&mut self) -> &mut AdetailerParameters {
        self.parameters.adetailer.get_or_insert_with(Default::default)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), MetadataError> {
        let p = &mut self.parameters;
        match key {
            "steps" => p.steps = Some(parse_int(key, value)?),
            "sampler" => p.sampler = text(value),
            "schedule type" => p.schedule_type = text(value),
            "cfg scale" => p.cfg_scale = Some(parse_decimal(key, value)?),
            "seed" => p.seed = Some(parse_int(key, value)?),
            "size" => {
                let (w, h) = parse_size(key, value)?;
                p.generated_width = Some(w);
                p.generated_height = Some(h);
            }
            "model" => p.model_name = text(value),
            "model hash" => {
                let hash = hashes::parse_hex_hash(key, &unquote(value))?;
                p.model_hash = Some(hash.clone());
                self.push_hash(hash, ModelKind::Checkpoint, None);
            }
            "vae" => p.vae = text(value),
            "vae hash" => {
                let hash = hashes::parse_hex_hash(key, &unquote(value))?;
                p.vae_hash = Some(hash.clone());
                self.push_hash(hash, ModelKind::Vae, None);
            }
            "clip skip" => p.clip_skip = Some(parse_int(key, value)?),
            "denoising strength" => p.denoising_strength = Some(parse_decimal(key, value)?),
            "variation seed" => p.variation_seed = Some(parse_int(key, value)?),
            "variation seed strength" => p.variation_seed_strength = Some(parse_decimal(key, value)?),
            "hires upscale" => p.hires_upscale = Some(parse_decimal(key, value)?),
            "hires steps" => p.hires_steps = Some(parse_int(key, value)?),
            "hires upscaler" => p.hires_upscaler = text(value),
            "adetailer model" => self.adetailer().model = text(value),
            "adetailer prompt" => self.adetailer().prompt = text(value),
            "adetailer negative prompt" => self.adetailer().negative_prompt = text(value),
            "adetailer confidence" => self.adetailer().confidence = Some(parse_decimal(key, value)?),
            "adetailer dilate erode" => self.adetailer().dilate_erode = Some(parse_int(key, value)?),
            "adetailer mask blur" => self.adetailer().mask_blur = Some(parse_int(key, value)?),
            "adetailer denoising strength" => {
                self.adetailer().denoising_strength = Some(parse_decimal(key, value)?)
            }
            "adetailer inpaint only masked" => {
                self.adetailer().inpaint_only_masked = Some(unquote(value).trim().eq_ignore_ascii_case("true"))
            }
            "adetailer inpaint padding" => self.adetailer().inpaint_padding = Some(parse_int(key, value)?),
            "adetailer version" => self.adetailer().version = text(value),
            "hashes" => {
                let result = self.apply_hash_list(value);
                self.record("Hashes", result);
            }
            "lora hashes" => {
                let result = self.apply_name_hashes(value, ModelKind::Lora);
                self.record("Lora Hashes", result);
            }
            "ti hashes" => {
                let result = self.apply_name_hashes(value, ModelKind::TextualInversion);
                self.record("TI Hashes", result);
            }
            "civitai resources" => {
                let result = self.apply_resources(value);
                self.record("Civitai Resources", result);
            }
            "civitai metadata" => {
                let result = self.apply_civitai_metadata(value);
                self.record("Civitai Metadata", result);
            }
            _ => {
                self.extra.insert(key.to_string(), value.to_lowercase());
            }
        }
        Ok(())
    }

    /// Downgrade a sub-list failure to a residual diagnostic.
    fn record(&mut self, label: &str, result: Result<(), MetadataError>) {
        if let Err(e) = result {
            log::debug!("{} parsing failed: {}", label, e);
            self.extra.insert(format!("{} Parsing Error", label), e.to_string());
        }
    }

    fn apply_hash_list(&mut self, value: &str) -> Result<(), MetadataError> {
        let mut found = Vec::new();
        for (name, hash) in hashes::parse_hash_list(value)? {
            let hash = hashes::parse_hex_hash(&name, &hash)?;
            let (kind, label) = match name.split_once(':') {
                None if name.eq_ignore_ascii_case("model") => (ModelKind::Checkpoint, None),
                None if name.eq_ignore_ascii_case("vae") => (ModelKind::Vae, None),
                Some((prefix, label)) if prefix.eq_ignore_ascii_case("lora") => (ModelKind::Lora, Some(label)),
                Some((prefix, label)) if prefix.eq_ignore_ascii_case("embed") => {
                    (ModelKind::TextualInversion, Some(label))
                }
                _ => {
                    log::debug!("unrecognized hash list entry '{}'", name);
                    continue;
                }
            };
            found.push((hash, kind, label.map(str::to_string)));
        }
        for (hash, kind, label) in found {
            self.push_hash(hash, kind, label);
        }
        Ok(())
    }

    fn apply_name_hashes(&mut self, value: &str, kind: ModelKind) -> Result<(), MetadataError> {
        for (name, hash) in hashes::parse_name_hash_pairs(&unquote(value))? {
            self.push_hash(hash, kind, Some(name));
        }
        Ok(())
    }

    fn apply_resources(&mut self, value: &str) -> Result<(), MetadataError> {
        let (resources, leftovers) = civitai::parse_resources(value)?;
        for resource in resources {
            let weight = resource.weight.or_else(|| self.weight_for(resource.kind, resource.name.as_deref()));
            self.push(ModelRef {
                key: ModelKey::VersionId(resource.version_id),
                kind: resource.kind,
                name: resource.name,
                weight,
            });
        }
        for (index, key, value) in leftovers {
            self.extra.insert(format!("civitai resource:{}:{}", index, key), value);
        }
        Ok(())
    }

    fn apply_civitai_metadata(&mut self, value: &str) -> Result<(), MetadataError> {
        let (remix_of, rest) = civitai::parse_metadata(value)?;
        if remix_of.is_some() {
            self.parameters.remix_of_id = remix_of;
        }
        for (key, value) in rest {
            self.extra.insert(format!("civitai metadata:{}", key), value);
        }
        Ok(())
    }

    fn weight_for(&self, kind: ModelKind, name: Option<&str>) -> Option<f64> {
        if kind != ModelKind::Lora {
            return None;
        }
        name.and_then(|n| self.lora_weights.get(&n.trim().to_lowercase()).copied())
    }

    fn push_hash(&mut self, hash: String, kind: ModelKind, name: Option<String>) {
        let weight = self.weight_for(kind, name.as_deref());
        self.push(ModelRef {
            key: ModelKey::Hash(hash),
            kind,
            name,
            weight,
        });
    }

    /// Keep the first reference per key, filling in a missing name or weight.
    fn push(&mut self, model_ref: ModelRef) {
        match self.refs.iter_mut().find(|r| r.key == model_ref.key) {
            Some(existing) => {
                if existing.weight.is_none() {
                    existing.weight = model_ref.weight;
                }
                if existing.name.is_none() {
                    existing.name = model_ref.name;
                }
            }
            None => self.refs.push(model_ref),
        }
    }

    fn finish(self) -> ParsedMetadata {
        ParsedMetadata {
            parameters: self.parameters,
            extra: self.extra,
            model_refs: self.refs,
        }
    }
}
