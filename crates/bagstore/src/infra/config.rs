//! Configuration management utilities.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs_next::{config_dir, home_dir};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::app::bag::BagOptions;
use crate::app::env_export::EnvExportOptions;
use crate::domain::model::Format;

static DEFAULT_CONFIG: Lazy<&'static str> =
    Lazy::new(|| include_str!("../../assets/default-config.toml"));

/// Environment variable naming the default bag directory.
pub const HOME_ENV: &str = "BAGSTORE_HOME";
/// Environment variable overriding the bag file extension.
pub const EXTENSION_ENV: &str = "BAGSTORE_EXTENSION";
const DEFAULT_DIR_NAME: &str = ".bagstore";

/// Process-wide default directory for bag files.
///
/// `$BAGSTORE_HOME` when set, otherwise `~/.bagstore`.
pub fn default_directory() -> PathBuf {
    if let Some(dir) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(dir);
    }
    home_dir()
        .map(|home| home.join(DEFAULT_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DIR_NAME))
}

/// Layered configuration loaded from defaults, the user config file, and env.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub env: EnvDefaults,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "Store::default_extension")]
    pub extension: String,
}

impl Store {
    fn default_extension() -> String {
        Format::default().extension().to_owned()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self {
            directory: None,
            extension: Self::default_extension(),
        }
    }
}

/// Defaults for exporting bag entries into the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnvDefaults {
    #[serde(default)]
    overwrite: Option<bool>,
    #[serde(default)]
    sysvar_only: Option<bool>,
    #[serde(default)]
    uppercase: Option<bool>,
}

impl EnvDefaults {
    pub fn overwrite(&self) -> bool {
        self.overwrite.unwrap_or(false)
    }

    pub fn sysvar_only(&self) -> bool {
        self.sysvar_only.unwrap_or(true)
    }

    pub fn uppercase(&self) -> bool {
        self.uppercase.unwrap_or(false)
    }
}

/// Environment overrides for critical settings.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    home: Option<PathBuf>,
    extension: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: env::var_os(HOME_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            extension: env::var(EXTENSION_ENV).ok().filter(|value| !value.is_empty()),
        }
    }

    #[cfg(test)]
    fn for_tests(home: &str, extension: &str) -> Self {
        Self {
            home: Some(PathBuf::from(home)),
            extension: Some(extension.to_owned()),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the global config file, and env overrides.
    pub fn load() -> Result<Self> {
        Self::load_with_layers(global_config_path(), EnvOverrides::from_env())
    }

    fn load_with_layers(global: Option<PathBuf>, env_overrides: EnvOverrides) -> Result<Self> {
        let mut layers: Vec<Config> = Vec::new();

        layers.push(Self::from_str(&DEFAULT_CONFIG)?);

        if let Some(global_path) = global.filter(|path| path.exists()) {
            tracing::debug!(path = %global_path.display(), "loading config file");
            layers.push(Self::from_file(&global_path)?);
        }

        let merged = layers.into_iter().reduce(Config::merge).unwrap_or_default();
        Ok(apply_env_overrides(merged, env_overrides))
    }

    fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_str(&data)
    }

    fn from_str(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).with_context(|| "failed to parse TOML config".to_string())?;
        Ok(config)
    }

    fn merge(self, other: Self) -> Self {
        Self {
            store: merge_store(self.store, other.store),
            env: merge_env(self.env, other.env),
        }
    }

    /// Directory holding bag files after all layers are applied.
    pub fn directory(&self) -> PathBuf {
        self.store.directory.clone().unwrap_or_else(default_directory)
    }

    /// Options for opening bags with the configured directory and extension.
    pub fn bag_options(&self) -> BagOptions {
        BagOptions::new()
            .with_directory(self.directory())
            .with_extension(self.store.extension.clone())
    }

    /// Environment export defaults; selection is left to the caller.
    pub fn env_export_options(&self) -> EnvExportOptions {
        EnvExportOptions {
            overwrite: self.env.overwrite(),
            sysvar_only: self.env.sysvar_only(),
            uppercase: self.env.uppercase(),
            ..EnvExportOptions::default()
        }
    }
}

fn merge_store(base: Store, overlay: Store) -> Store {
    Store {
        directory: overlay.directory.or(base.directory),
        extension: if overlay.extension != Store::default_extension() {
            overlay.extension
        } else {
            base.extension
        },
    }
}

fn merge_env(mut base: EnvDefaults, overlay: EnvDefaults) -> EnvDefaults {
    if let Some(value) = overlay.overwrite {
        base.overwrite = Some(value);
    }
    if let Some(value) = overlay.sysvar_only {
        base.sysvar_only = Some(value);
    }
    if let Some(value) = overlay.uppercase {
        base.uppercase = Some(value);
    }
    base
}

fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|base| base.join("bagstore/config.toml"))
}

fn apply_env_overrides(mut config: Config, env: EnvOverrides) -> Config {
    if let Some(home) = env.home {
        config.store.directory = Some(home);
    }
    if let Some(extension) = env.extension {
        config.store.extension = extension;
    }
    config
}
