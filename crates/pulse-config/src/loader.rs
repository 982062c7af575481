use pulse_core::{PulseError, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::PulseConfig;

/// Loads the Pulse configuration once at startup.
///
/// There is no hot reload: a restart picks up edited values.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: PulseConfig,
    /// Effective config as a TOML table, for dot-path lookups.
    table: toml::Table,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > PULSE_CONFIG env > ~/.pulse/pulse.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("PULSE_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pulse")
            .join("pulse.toml")
    }

    /// Load, apply environment overrides and validate. A missing file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        if !config_path.exists() {
            return Err(PulseError::Config(format!(
                "config file not found: {}",
                config_path.display()
            )));
        }
        info!(?config_path, "loading configuration");
        let raw = std::fs::read_to_string(&config_path)?;
        Self::from_toml_with_env(&raw, config_path, |key| std::env::var(key).ok())
    }

    /// Build from TOML text, with no environment overrides.
    pub fn from_toml(raw: &str, origin: impl Into<PathBuf>) -> Result<Self> {
        Self::from_toml_with_env(raw, origin.into(), |_| None)
    }

    /// Build from TOML text, reading overrides through `env`.
    pub fn from_toml_with_env(
        raw: &str,
        config_path: PathBuf,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let config = toml::from_str::<PulseConfig>(raw).map_err(|e| {
            PulseError::Config(format!("failed to parse {}: {}", config_path.display(), e))
        })?;

        let config = Self::apply_env_overrides(config, env);

        // Validate config: log warnings, fail on errors
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(PulseError::Config(e));
            }
        }

        let table = match toml::Value::try_from(&config) {
            Ok(toml::Value::Table(t)) => t,
            Ok(_) => toml::Table::new(),
            Err(e) => return Err(PulseError::Config(format!("failed to index config: {e}"))),
        };

        Ok(Self {
            config,
            table,
            config_path,
        })
    }

    pub fn get(&self) -> &PulseConfig {
        &self.config
    }

    pub fn into_config(self) -> PulseConfig {
        self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Typed lookup of a dot-separated key, e.g. `lookup::<u32>("budget.limit")`.
    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .find(key)
            .ok_or_else(|| PulseError::Config(format!("missing config key '{key}'")))?;
        value
            .clone()
            .try_into::<T>()
            .map_err(|e| PulseError::ConfigValidation {
                field: key.to_string(),
                reason: e.to_string(),
            })
    }

    /// Like [`lookup`](Self::lookup) but falls back to `default` when the key is absent.
    /// A present key of the wrong type is still an error.
    pub fn lookup_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.find(key) {
            Some(_) => self.lookup(key),
            None => Ok(default),
        }
    }

    fn find(&self, key: &str) -> Option<&toml::Value> {
        let mut parts = key.split('.');
        let first = parts.next()?;
        let mut current = self.table.get(first)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        Some(current)
    }

    /// Apply env var overrides (PULSE_LOG_LEVEL, PULSE_ENGINE_ENDPOINT, etc.)
    fn apply_env_overrides(
        mut config: PulseConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> PulseConfig {
        if let Some(v) = env("PULSE_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = env("PULSE_ENGINE_ENDPOINT") {
            config.engine.endpoint = v;
        }
        if let Some(v) = env("PULSE_DB_PATH") {
            config.storage.db_path = Some(PathBuf::from(v));
        }
        // API key: config file takes priority, env is the fallback.
        if config.engine.api_key.is_none()
            && let Some(v) = env("PULSE_ENGINE_API_KEY")
        {
            config.engine.api_key = Some(v);
        }
        config
    }
}
