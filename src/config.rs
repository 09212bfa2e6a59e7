use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheTier;
use crate::manifest::AppManifest;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the runtime intercepts for, e.g. `https://example.com`
  pub origin: Url,
  /// Path prefix the runtime is registered at
  #[serde(default = "default_scope")]
  pub scope: String,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Assets stored during install
  #[serde(default)]
  pub precache: Vec<PrecacheAsset>,
  /// Document served when a navigation cannot be resolved
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
  #[serde(default)]
  pub routes: RoutesConfig,
  #[serde(default)]
  pub timeouts: TimeoutsConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub push: PushConfig,
  #[serde(default)]
  pub app_manifest: AppManifest,
  #[serde(default)]
  pub database: DatabaseConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

fn default_scope() -> String {
  "/".to_string()
}

fn default_offline_fallback() -> String {
  "/offline.html".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Namespace prefix shared by every cache this runtime owns
  #[serde(default = "default_cache_prefix")]
  pub prefix: String,
  /// Build version; bumping it is the only way to invalidate precached content
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Upper bound on api-tier entries (oldest evicted first)
  #[serde(default = "default_max_api_entries")]
  pub max_api_entries: usize,
}

fn default_cache_prefix() -> String {
  "offline-runtime".to_string()
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_max_api_entries() -> usize {
  100
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: default_cache_prefix(),
      version: default_cache_version(),
      max_api_entries: default_max_api_entries(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrecacheAsset {
  pub url: String,
  #[serde(default = "default_precache_tier")]
  pub tier: CacheTier,
  /// Install fails if a mandatory asset cannot be fetched
  #[serde(default)]
  pub mandatory: bool,
}

fn default_precache_tier() -> CacheTier {
  CacheTier::Static
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutesConfig {
  #[serde(default = "default_api_prefixes")]
  pub api_prefixes: Vec<String>,
  #[serde(default = "default_static_prefixes")]
  pub static_prefixes: Vec<String>,
  #[serde(default = "default_static_extensions")]
  pub static_extensions: Vec<String>,
}

fn default_api_prefixes() -> Vec<String> {
  vec!["/api/".to_string()]
}

fn default_static_prefixes() -> Vec<String> {
  ["/_next/static/", "/static/", "/fonts/", "/icons/"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_static_extensions() -> Vec<String> {
  [
    "js", "css", "woff", "woff2", "ttf", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      api_prefixes: default_api_prefixes(),
      static_prefixes: default_static_prefixes(),
      static_extensions: default_static_extensions(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
  /// Bounded wait before network-first falls back to cache
  #[serde(default = "default_network_ms")]
  pub network_ms: u64,
  /// Bounded wait per precached asset
  #[serde(default = "default_precache_ms")]
  pub precache_ms: u64,
}

fn default_network_ms() -> u64 {
  3_000
}

fn default_precache_ms() -> u64 {
  10_000
}

impl Default for TimeoutsConfig {
  fn default() -> Self {
    Self {
      network_ms: default_network_ms(),
      precache_ms: default_precache_ms(),
    }
  }
}

impl TimeoutsConfig {
  pub fn network(&self) -> Duration {
    Duration::from_millis(self.network_ms)
  }

  pub fn precache(&self) -> Duration {
    Duration::from_millis(self.precache_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Attempts before a task is marked failed
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// First retry delay; doubles per attempt
  #[serde(default = "default_base_backoff_ms")]
  pub base_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
  /// Background replay interval, if the platform supports periodic sync
  #[serde(default)]
  pub periodic_interval_secs: Option<u64>,
}

fn default_max_attempts() -> u32 {
  5
}

fn default_base_backoff_ms() -> u64 {
  1_000
}

fn default_max_backoff_ms() -> u64 {
  60_000
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      base_backoff_ms: default_base_backoff_ms(),
      max_backoff_ms: default_max_backoff_ms(),
      periodic_interval_secs: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushConfig {
  /// VAPID public key, base64url encoded
  pub application_server_key: Option<String>,
}

impl PushConfig {
  /// Decode the application key into the raw uncompressed P-256 point.
  pub fn decoded_key(&self) -> Result<Option<Vec<u8>>> {
    let Some(key) = &self.application_server_key else {
      return Ok(None);
    };
    let bytes = URL_SAFE_NO_PAD
      .decode(key.trim().trim_end_matches('='))
      .map_err(|e| eyre!("Push application key is not base64url: {}", e))?;
    if bytes.len() != 65 || bytes[0] != 0x04 {
      return Err(eyre!(
        "Push application key must be a 65-byte uncompressed P-256 point (got {} bytes)",
        bytes.len()
      ));
    }
    Ok(Some(bytes))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
  /// Database file (default: $XDG_DATA_HOME/offline-runtime/runtime.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Log to a daily-rolling file instead of stderr
  #[serde(default)]
  pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: None,
    }
  }
}

impl Config {
  /// Configuration with every section defaulted.
  pub fn new(origin: Url) -> Self {
    Self {
      origin,
      scope: default_scope(),
      cache: CacheConfig::default(),
      precache: Vec::new(),
      offline_fallback: default_offline_fallback(),
      routes: RoutesConfig::default(),
      timeouts: TimeoutsConfig::default(),
      sync: SyncConfig::default(),
      push: PushConfig::default(),
      app_manifest: AppManifest::default(),
      database: DatabaseConfig::default(),
      logging: LoggingConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-runtime.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-runtime/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offline-runtime/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-runtime.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-runtime").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Cross-section checks serde cannot express.
  pub fn validate(&self) -> Result<()> {
    if !self.scope.starts_with('/') {
      return Err(eyre!("Scope must be an absolute path, got {:?}", self.scope));
    }

    let fallback = self.resolve(&self.offline_fallback)?;
    if fallback.origin() != self.origin.origin() || !fallback.path().starts_with(&self.scope) {
      return Err(eyre!(
        "Offline fallback {} lies outside scope {}",
        fallback,
        self.scope
      ));
    }

    let mandatory: Vec<Url> = self
      .precache
      .iter()
      .filter(|asset| asset.mandatory)
      .map(|asset| self.resolve(&asset.url))
      .collect::<Result<_>>()?;
    for icon in self.app_manifest.icon_urls() {
      let icon_url = self.resolve(icon)?;
      if !mandatory.contains(&icon_url) {
        return Err(eyre!(
          "Manifest icon {} must be listed as a mandatory precache asset",
          icon
        ));
      }
    }

    self.push.decoded_key()?;
    Ok(())
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid URL {:?}: {}", path, e))
  }

  pub fn offline_fallback_url(&self) -> Result<Url> {
    self.resolve(&self.offline_fallback)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database.path {
      Some(path) => Ok(path.clone()),
      None => crate::db::Database::default_path(),
    }
  }
}
