use anyhow::{Context, Result, anyhow, ensure};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

use crate::{
    provider::openweather::Units,
    search::{DEFAULT_DEBOUNCE, DEFAULT_MIN_QUERY_LEN, SearchConfig},
    storage::FileStore,
};

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LOG_FILTER: &str = "weather_dashboard=info,dashboard_core=info";

/// Runtime knobs stored on disk. User-facing preferences live in
/// [`crate::settings::Settings`] instead.
///
/// Example TOML:
/// ```toml
/// data_dir = "/tmp/weather"
/// fetch_timeout_secs = 5
/// search_debounce_ms = 250
/// openweather_units = "imperial"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where settings, saved cities and the weather cache are kept.
    /// Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
    pub fetch_timeout_secs: u64,
    pub search_debounce_ms: u64,
    pub min_query_len: usize,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Units requested from OpenWeatherMap; results are always metric.
    pub openweather_units: Units,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            search_debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            min_query_len: DEFAULT_MIN_QUERY_LEN,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            openweather_units: Units::default(),
        }
    }
}

impl AppConfig {
    /// Load config from disk, or return defaults if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        cfg.validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "weather-dashboard", "weather-dashboard")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.fetch_timeout_secs > 0, "fetch_timeout_secs must be greater than zero");
        ensure!(self.min_query_len > 0, "min_query_len must be greater than zero");
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            debounce: Duration::from_millis(self.search_debounce_ms),
            min_query_len: self.min_query_len,
        }
    }

    /// The file store for `data_dir`, or the platform default.
    pub fn file_store(&self) -> Result<FileStore> {
        match &self.data_dir {
            Some(dir) => Ok(FileStore::new(dir)),
            None => FileStore::default_dir()
                .map(FileStore::new)
                .map_err(|err| anyhow!(err)),
        }
    }
}
