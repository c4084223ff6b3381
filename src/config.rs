use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// REST base URL, e.g. https://api.example.org
  pub url: String,
  /// Tenant subdomain sent with every request
  pub subdomain: String,
  /// WebSocket endpoint on the same host
  #[serde(default = "default_socket_path")]
  pub socket_path: String,
}

fn default_socket_path() -> String {
  "/cable".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_poll_interval")]
  pub poll_interval_secs: u64,
  #[serde(default = "default_ping_interval")]
  pub ping_interval_secs: u64,
  #[serde(default = "default_stale")]
  pub stale_secs: u64,
  /// Scene to follow; scopes the second socket channel and the patient queries
  pub scene: Option<String>,
}

fn default_poll_interval() -> u64 {
  30
}

fn default_ping_interval() -> u64 {
  5
}

fn default_stale() -> u64 {
  300
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs: default_poll_interval(),
      ping_interval_secs: default_ping_interval(),
      stale_secs: default_stale(),
      scene: None,
    }
  }
}

impl SyncConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }

  pub fn ping_interval(&self) -> Duration {
    Duration::from_secs(self.ping_interval_secs.max(1))
  }

  pub fn stale_time(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.stale_secs as i64)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Store file (default: $XDG_DATA_HOME/triage-sync/cache.db)
  pub path: Option<PathBuf>,
}

impl CacheConfig {
  /// Resolve the store path, falling back to the platform data directory.
  pub fn resolve_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("triage-sync").join("cache.db"))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// When set, logs are also written to a daily-rolling file at this path
  pub file: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./triage-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/triage-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/triage-sync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("triage-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("triage-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks TRIAGE_SYNC_TOKEN first, then TRIAGE_API_TOKEN. A missing token
  /// is not an error: requests go out anonymously and the server decides.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TRIAGE_SYNC_TOKEN")
      .or_else(|_| std::env::var("TRIAGE_API_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
