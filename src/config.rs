use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DEFAULT_MAX_ENTRY_SIZE, DEFAULT_MAX_SIZE};
use crate::db::SqliteStore;
use crate::sync::DEFAULT_DISPATCH_TIMEOUT;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub remote: RemoteConfig,
  /// Directory for rolling log files (defaults to the data directory)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// SQLite file backing the substrate
  pub path: Option<PathBuf>,
  /// Eviction kicks in above this many bytes (e.g. 10485760 or "10MiB")
  #[serde(default = "default_max_size", deserialize_with = "deserialize_byte_size")]
  pub max_size_bytes: usize,
  /// Largest single cache entry accepted
  #[serde(default = "default_max_entry", deserialize_with = "deserialize_byte_size")]
  pub max_entry_bytes: usize,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      max_size_bytes: DEFAULT_MAX_SIZE,
      max_entry_bytes: DEFAULT_MAX_ENTRY_SIZE,
    }
  }
}

fn default_max_size() -> usize {
  DEFAULT_MAX_SIZE
}

fn default_max_entry() -> usize {
  DEFAULT_MAX_ENTRY_SIZE
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the data service, e.g. https://xyz.supabase.co
  pub url: Option<String>,
  #[serde(default = "default_dispatch_timeout")]
  pub dispatch_timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: None,
      dispatch_timeout_secs: default_dispatch_timeout(),
    }
  }
}

fn default_dispatch_timeout() -> u64 {
  DEFAULT_DISPATCH_TIMEOUT.as_secs()
}

impl RemoteConfig {
  pub fn dispatch_timeout(&self) -> Duration {
    Duration::from_secs(self.dispatch_timeout_secs)
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteSize {
  Bytes(usize),
  Text(String),
}

fn deserialize_byte_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
  D: serde::Deserializer<'de>,
{
  match ByteSize::deserialize(deserializer)? {
    ByteSize::Bytes(n) => Ok(n),
    ByteSize::Text(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
  }
}

/// Parse sizes like `512`, `64KB`, `10MiB`. Units are binary.
fn parse_byte_size(s: &str) -> Result<usize, String> {
  let s = s.trim();
  let split = s
    .find(|c: char| !c.is_ascii_digit())
    .unwrap_or(s.len());
  let (digits, unit) = s.split_at(split);
  let n: usize = digits
    .parse()
    .map_err(|_| format!("invalid size '{}'", s))?;
  let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
    "" | "b" => 1,
    "kb" | "kib" => 1024,
    "mb" | "mib" => 1024 * 1024,
    "gb" | "gib" => 1024 * 1024 * 1024,
    other => return Err(format!("unknown size unit '{}'", other)),
  };
  n.checked_mul(multiplier)
    .ok_or_else(|| format!("size '{}' is too large", s))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stratcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stratcache/config.yaml
  ///
  /// With no file found, defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stratcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stratcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Substrate file: `storage.path` or the platform data directory.
  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => SqliteStore::default_path(),
    }
  }

  /// Open the persistent substrate this config points at.
  pub fn open_store(&self) -> Result<SqliteStore> {
    SqliteStore::open_at(&self.store_path()?)
  }

  /// Log directory: `log_dir`, else `logs/` next to the substrate file.
  pub fn log_dir(&self) -> Option<PathBuf> {
    if let Some(dir) = &self.log_dir {
      return Some(dir.clone());
    }
    let store = self.store_path().ok()?;
    store.parent().map(|p| p.join("logs"))
  }

  /// Get the data service API key from environment variables.
  ///
  /// Checks STRATCACHE_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("STRATCACHE_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!(
          "API key not found. Set STRATCACHE_API_KEY or SUPABASE_ANON_KEY environment variable."
        )
      })
  }
}
