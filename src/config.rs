use chrono::Duration as TtlDuration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use teamsync::cache::CachePolicy;
use teamsync::engine::EngineSettings;
use teamsync::storage::SqliteStorage;
use teamsync::sync::Schedule;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the document store API
  pub url: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_sync_interval_secs")]
  pub interval_secs: u64,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_sync_interval_secs(),
      max_retries: default_max_retries(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,
  /// Overrides of the built-in category table (names are case-insensitive)
  #[serde(default, deserialize_with = "deserialize_lowercase_keys")]
  pub categories: BTreeMap<String, CategoryConfig>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      sweep_interval_secs: default_sweep_interval_secs(),
      default_ttl_secs: default_ttl_secs(),
      categories: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CategoryConfig {
  pub ttl_secs: u64,
  #[serde(default)]
  pub persist: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// Persist the cache mirror and mutation queue across runs
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Database path (defaults to $XDG_DATA_HOME/teamsync/state.db)
  pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_sync_interval_secs() -> u64 {
  30
}

fn default_max_retries() -> u32 {
  3
}

fn default_sweep_interval_secs() -> u64 {
  300
}

fn default_ttl_secs() -> u64 {
  300
}

fn default_true() -> bool {
  true
}

fn deserialize_lowercase_keys<'de, D>(
  deserializer: D,
) -> Result<BTreeMap<String, CategoryConfig>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let m: BTreeMap<String, CategoryConfig> = BTreeMap::deserialize(deserializer)?;
  Ok(m.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect())
}

impl Config {
  /// Load configuration.
  ///
  /// An explicit path must exist. Otherwise the first of [`Config::search_paths`]
  /// that exists is used, and without any file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit_path {
      return Self::load_from_path(path);
    }

    match Self::search_paths().into_iter().find(|p| p.is_file()) {
      Some(path) => Self::load_from_path(&path),
      None => Ok(Self::default()),
    }
  }

  /// Implicit config locations, most specific first: `./teamsync.yaml`,
  /// then `$XDG_CONFIG_HOME/teamsync/config.yaml`.
  pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("teamsync.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("teamsync").join("config.yaml")));
    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the document store token from environment variables.
  ///
  /// Checks TEAMSYNC_TOKEN first, then TEAMSYNC_API_TOKEN as fallback.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TEAMSYNC_TOKEN")
      .or_else(|_| std::env::var("TEAMSYNC_API_TOKEN"))
      .ok()
  }

  /// Configured document store URL, `None` when `remote.url` is unset.
  pub fn remote_url(&self) -> Result<Option<Url>> {
    self
      .remote
      .url
      .as_deref()
      .map(|raw| Url::parse(raw).map_err(|e| eyre!("Invalid remote.url '{}': {}", raw, e)))
      .transpose()
  }

  pub fn remote_timeout(&self) -> Duration {
    Duration::from_secs(self.remote.timeout_secs)
  }

  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => SqliteStorage::default_path().ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }

  /// Directory for log files, next to the state database.
  pub fn log_dir(&self) -> Result<PathBuf> {
    let path = self.storage_path()?;
    Ok(
      path
        .parent()
        .map(|p| p.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs")),
    )
  }

  /// Built-in category table with the configured overrides applied.
  pub fn cache_policy(&self) -> CachePolicy {
    let base = CachePolicy::default().with_default_ttl(secs(self.cache.default_ttl_secs));
    self
      .cache
      .categories
      .iter()
      .fold(base, |policy, (name, c)| {
        policy.with_category(name, secs(c.ttl_secs), c.persist)
      })
  }

  pub fn engine_settings(&self) -> EngineSettings {
    EngineSettings {
      policy: self.cache_policy(),
      max_retries: self.sync.max_retries,
      schedule: Schedule {
        sync_interval: Duration::from_secs(self.sync.interval_secs),
        sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
      },
      start_online: true,
    }
  }
}

fn secs(s: u64) -> TtlDuration {
  TtlDuration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1000))
}
