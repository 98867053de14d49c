use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordinator::DebouncePolicy;
use crate::registry::RegistryPolicy;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
  pub registry: RegistryConfig,
  pub coordinator: CoordinatorConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
  /// Repeated triggers for the same key inside this window are dropped
  pub debounce_ms: u64,
}

impl Default for RegistryConfig {
  fn default() -> Self {
    Self { debounce_ms: 50 }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
  pub repeat_ms: u64,
  pub invalidation_suppresses_version_ms: u64,
  pub version_suppresses_invalidation_ms: u64,
}

impl Default for CoordinatorConfig {
  fn default() -> Self {
    Self {
      repeat_ms: 50,
      invalidation_suppresses_version_ms: 2000,
      version_suppresses_invalidation_ms: 6000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive used when RUST_LOG is not set
  pub level: String,
  /// Write logs to a daily file in this directory instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pagesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pagesync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
    let local = PathBuf::from("pagesync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pagesync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    // an empty document deserializes to unit, not a map
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  pub fn registry_policy(&self) -> RegistryPolicy {
    RegistryPolicy::default().with_debounce(Duration::from_millis(self.registry.debounce_ms))
  }

  pub fn debounce_policy(&self) -> DebouncePolicy {
    let c = &self.coordinator;
    DebouncePolicy::default()
      .with_repeat(Duration::from_millis(c.repeat_ms))
      .with_invalidation_suppresses_version(Duration::from_millis(
        c.invalidation_suppresses_version_ms,
      ))
      .with_version_suppresses_invalidation(Duration::from_millis(
        c.version_suppresses_invalidation_ms,
      ))
  }
}
