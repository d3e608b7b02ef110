use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{
  EvictionPolicy, KeepForever, LocatorNormalizer, LocatorRule, RetentionWindow, SqliteStorage,
  SweepMode, SweepSchedule, DEFAULT_RETENTION_DAYS,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub locators: LocatorConfig,
  pub fetch: FetchConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Database file (defaults to $XDG_DATA_HOME/paperstash/cache.db)
  pub path: Option<PathBuf>,
  /// When false nothing is stored and every lookup misses
  pub enabled: bool,
  /// Days an unread entry is kept. 0 keeps entries forever.
  pub retention_days: u32,
  /// When eviction sweeps run: after_write, detached, background or manual
  pub sweep: SweepMode,
  /// Sweep period for the background mode
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      enabled: true,
      retention_days: DEFAULT_RETENTION_DAYS as u32,
      sweep: SweepMode::default(),
      sweep_interval_secs: 3600,
    }
  }
}

impl CacheConfig {
  pub fn db_path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(p) => Ok(p.clone()),
      None => SqliteStorage::default_path().map_err(|e| eyre!("{}", e)),
    }
  }

  pub fn eviction_policy(&self) -> Box<dyn EvictionPolicy> {
    if self.retention_days == 0 {
      Box::new(KeepForever)
    } else {
      Box::new(RetentionWindow::days(i64::from(self.retention_days)))
    }
  }

  pub fn schedule(&self) -> SweepSchedule {
    self
      .sweep
      .into_schedule(Duration::from_secs(self.sweep_interval_secs.max(1)))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
  /// Keep the built-in rules (arXiv abstract -> PDF) after the custom ones
  pub use_defaults: bool,
  /// Extra rewrite rules, tried in order before the defaults
  pub rules: Vec<LocatorRule>,
}

impl Default for LocatorConfig {
  fn default() -> Self {
    Self {
      use_defaults: true,
      rules: Vec::new(),
    }
  }
}

impl LocatorConfig {
  pub fn normalizer(&self) -> LocatorNormalizer {
    let mut rules = self.rules.clone();
    if self.use_defaults {
      rules.extend(LocatorNormalizer::default().rules().iter().cloned());
    }
    LocatorNormalizer::new(rules)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 60,
      user_agent: concat!("paperstash/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
  /// tracing filter directive, e.g. "paperstash=debug". RUST_LOG wins.
  pub filter: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./paperstash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/paperstash/config.yaml
  ///
  /// Without a file every setting takes its default. `PAPERSTASH_DB`
  /// overrides the database path either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(db) = std::env::var("PAPERSTASH_DB") {
      config.cache.path = Some(PathBuf::from(db));
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("paperstash.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("paperstash").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to unit, not to an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }
}
