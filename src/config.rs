use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
}

/// Catalog database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            migrations_dir: default_migrations_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Remote model registry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_enabled")]
    pub enabled: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per lookup; only timeouts and cancelled requests are retried.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Name of an environment variable holding a bearer token, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: default_registry_enabled(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            api_key_env: None,
        }
    }
}

/// Scan queue and watcher tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Worker pool size per scan pass; 0 means available parallelism.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Roots added on startup in addition to the persisted folders.
    #[serde(default)]
    pub roots: Vec<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            debounce_ms: default_debounce_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            roots: Vec::new(),
        }
    }
}

/// Thumbnail generation
#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumbnail_size")]
    pub size: u32,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            size: default_thumbnail_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("gencat.db")
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_registry_enabled() -> bool {
    true
}

fn default_base_url() -> String {
    "https://civitai.com/api/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> usize {
    10
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_thumbnail_size() -> u32 {
    256
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in GENCAT_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("GENCAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        Self::from_file(&config_path)
    }

    /// Load and validate a specific config file
    pub fn from_file(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.registry.max_attempts == 0 {
            anyhow::bail!("registry.max_attempts must be greater than 0");
        }

        url::Url::parse(&self.registry.base_url)
            .with_context(|| format!("registry.base_url is not a valid URL: {}", self.registry.base_url))?;

        if let Some(var) = &self.registry.api_key_env {
            if std::env::var(var).is_err() {
                log::warn!("registry.api_key_env is set but {} is not defined; lookups are anonymous", var);
            }
        }

        if self.thumbnail.size == 0 {
            anyhow::bail!("thumbnail.size must be greater than 0");
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.catalog.db_path
    }

    /// Get migrations directory
    pub fn migrations_dir(&self) -> &Path {
        &self.catalog.migrations_dir
    }

    /// Worker count for a scan pass, resolving 0 to the machine's parallelism.
    pub fn worker_count(&self) -> usize {
        if self.scan.workers > 0 {
            return self.scan.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_config_from_file_success() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[catalog]
db_path = "./test.db"
log_level = "debug"

[registry]
base_url = "http://localhost:9999/api/v1"
max_attempts = 3

[scan]
workers = 2
debounce_ms = 0
roots = ["/data/outputs"]
"#,
        )
        .unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.catalog.log_level, "debug");
        assert_eq!(config.registry.max_attempts, 3);
        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.scan.roots, vec![PathBuf::from("/data/outputs")]);
        assert_eq!(config.thumbnail.size, 256);
    }

    #[test]
    fn test_config_empty_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "").unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert!(config.registry.enabled);
        assert_eq!(config.registry.max_attempts, 10);
        assert_eq!(config.scan.debounce_ms, 500);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_config_rejects_zero_attempts() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "[registry]\nmax_attempts = 0\n").unwrap();

        let err = Config::from_file(&config_path).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_config_rejects_bad_url() {
        let mut config = Config::default();
        config.registry.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_invalid_path() {
        let result = Config::from_file(Path::new("nonexistent.toml"));
        assert!(result.is_err());
    }
}
