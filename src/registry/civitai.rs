use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{ModelRegistry, RegistryError, RegistryModel};
use crate::config::RegistryConfig;
use crate::error::{GencatError, Result};

/// Response shape of the model-version endpoints
#[derive(Deserialize)]
struct VersionResponse {
    id: i64,
    name: String,
    #[serde(rename = "modelId")]
    model_id: i64,
    model: VersionModel,
}

#[derive(Deserialize)]
struct VersionModel {
    name: String,
    #[serde(rename = "type")]
    model_type: String,
}

/// Civitai REST client
///
/// Looks up model versions by content hash (`/model-versions/by-hash/{hash}`)
/// or by id (`/model-versions/{id}`).
pub struct CivitaiRegistry {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CivitaiRegistry {
    /// Build a client from the `[registry]` section.
    ///
    /// The bearer token, when configured, is read from the environment
    /// variable named by `api_key_env`.
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GencatError::Registry(format!("Failed to build HTTP client: {}", e)))?;

        let api_key = config
            .api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn fetch(&self, url: String) -> std::result::Result<RegistryModel, RegistryError> {
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(classify)?;
        let version: VersionResponse =
            serde_json::from_str(&body).map_err(|e| RegistryError::Schema(e.to_string()))?;

        Ok(RegistryModel {
            version_id: version.id,
            version_name: version.name,
            model_id: version.model_id,
            model_name: version.model.name,
            model_type: version.model.model_type,
        })
    }
}

/// Timeouts are retryable; everything else on the wire is not.
fn classify(e: reqwest::Error) -> RegistryError {
    if e.is_timeout() {
        RegistryError::Transient(e.to_string())
    } else {
        RegistryError::Network(e.to_string())
    }
}

impl ModelRegistry for CivitaiRegistry {
    fn by_hash<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, std::result::Result<RegistryModel, RegistryError>> {
        let url = format!("{}/model-versions/by-hash/{}", self.base_url, hash);
        self.fetch(url).boxed()
    }

    fn by_version_id(&self, version_id: i64) -> BoxFuture<'_, std::result::Result<RegistryModel, RegistryError>> {
        let url = format!("{}/model-versions/{}", self.base_url, version_id);
        self.fetch(url).boxed()
    }
}
