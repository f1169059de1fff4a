use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use library::{ConfiguredRoots, EmptyRootsPolicy};
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;
const DEFAULT_INDEX_PATH: &str = "catalog.redb";

/// Answer given when a new primary file matches existing songs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateMode {
    #[default]
    Separate,
    Link,
    Ignore,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub version: u32,
    pub library_root: String,
    pub export_root: String,
    pub index_path: String,
    pub scan_export_roots: bool,
    pub duplicate_policy: DuplicateMode,
    pub keep_catalog_without_roots: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            library_root: "".to_string(),
            export_root: "".to_string(),
            index_path: DEFAULT_INDEX_PATH.to_string(),
            scan_export_roots: false,
            duplicate_policy: DuplicateMode::default(),
            keep_catalog_without_roots: false,
        }
    }
}

impl CatalogConfig {
    pub fn configured_roots(&self, config_path: &Path) -> ConfiguredRoots {
        ConfiguredRoots {
            library_root: resolve_root(config_path, &self.library_root),
            export_root: resolve_root(config_path, &self.export_root),
        }
    }

    /// Rejects settings that would point the catalog somewhere unusable.
    pub fn validate(&self, config_path: &Path) -> Result<(), ConfigError> {
        if self.version > CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "version {} is newer than supported version {}",
                self.version, CONFIG_VERSION
            )));
        }
        let index_path = resolve_path(config_path, self.index_path.trim());
        if index_path.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "index_path {:?} is a directory",
                index_path
            )));
        }
        let roots = self.configured_roots(config_path);
        if let (Some(library), Some(export)) = (&roots.library_root, &roots.export_root) {
            if library == export {
                return Err(ConfigError::Invalid(format!(
                    "export_root {:?} is the same folder as library_root",
                    export
                )));
            }
        }
        Ok(())
    }

    pub fn empty_roots_policy(&self) -> EmptyRootsPolicy {
        if self.keep_catalog_without_roots {
            EmptyRootsPolicy::KeepCatalog
        } else {
            EmptyRootsPolicy::ClearCatalog
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot access config: {}", err),
            ConfigError::Yaml(err) => write!(f, "malformed config: {}", err),
            ConfigError::Invalid(reason) => write!(f, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("ABC_CATALOG_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

/// Returns the config and whether it was just created with defaults.
pub fn load_or_create_config(path: &Path) -> Result<(CatalogConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: CatalogConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.index_path.trim().is_empty() {
            config.index_path = DEFAULT_INDEX_PATH.to_string();
        }
        config.validate(path)?;
        return Ok((config, false));
    }

    let config = CatalogConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &CatalogConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}
