use crate::models::ConfigRecord;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::de::value::MapDeserializer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use thiserror::Error;

/// Default settings file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "autoglm_config.json";

/// Key spellings written by the previous panel, paired with the current key.
const LEGACY_KEYS: &[(&str, &str)] = &[
    ("base_url", "baseUrl"),
    ("api_key", "apiKey"),
    ("max_steps", "maxSteps"),
];

/// Errors raised by the configuration store
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Load {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to save config {path}: {source}")]
    Save {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result of [`ConfigManager::load`]: always a usable record, plus the error that forced
/// a fallback to defaults, if any.
#[derive(Debug)]
pub struct LoadedConfig {
    pub record: ConfigRecord,
    pub warning: Option<ConfigError>,
}

/// Configuration store for the panel's JSON settings file.
///
/// Loading never fails the caller: a missing file yields defaults, a corrupt one yields
/// defaults plus a warning. Saving writes a sibling temp file and renames it over the
/// target so a crash mid-write leaves the previous file intact.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a manager for the settings file at `config_path`.
    ///
    /// The file does not need to exist yet.
    pub fn new<P: AsRef<Utf8Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }

    /// Load settings, substituting defaults on any failure.
    pub fn load(&self) -> LoadedConfig {
        match self.try_load() {
            Ok(Some(record)) => LoadedConfig {
                record,
                warning: None,
            },
            Ok(None) => {
                tracing::warn!(
                    "Config file not found at {}, using defaults",
                    self.config_path
                );
                LoadedConfig {
                    record: ConfigRecord::default(),
                    warning: None,
                }
            }
            Err(e) => {
                tracing::warn!("{}; falling back to defaults", e);
                LoadedConfig {
                    record: ConfigRecord::default(),
                    warning: Some(e),
                }
            }
        }
    }

    /// Load settings strictly.
    ///
    /// # Returns
    /// - `Ok(None)` if the file does not exist
    /// - `Ok(Some(record))` with absent keys filled from defaults
    /// - `Err` on I/O or parse failure
    pub fn try_load(&self) -> Result<Option<ConfigRecord>, ConfigError> {
        if !self.config_path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.config_path).map_err(|source| ConfigError::Load {
            path: self.config_path.clone(),
            source,
        })?;

        let parse_err = |source| ConfigError::Parse {
            path: self.config_path.clone(),
            source,
        };

        let mut entries: IndexMap<String, serde_json::Value> =
            serde_json::from_str(&contents).map_err(parse_err)?;
        migrate_legacy_keys(&mut entries);

        let fields = MapDeserializer::<_, serde_json::Error>::new(entries.into_iter());
        let record = ConfigRecord::deserialize(fields).map_err(parse_err)?;

        tracing::info!("Loaded config from {}", self.config_path);
        tracing::debug!("Config: {:?}", record);
        Ok(Some(record))
    }

    /// Persist the full record, recognized and unknown keys alike.
    pub fn save(&self, record: &ConfigRecord) -> Result<(), ConfigError> {
        let save_err = |source| ConfigError::Save {
            path: self.config_path.clone(),
            source,
        };

        let bytes = to_pretty_json(record).map_err(|e| save_err(std::io::Error::other(e)))?;

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(save_err)?;
            }
        }

        let tmp_path = Utf8PathBuf::from(format!("{}.tmp", self.config_path));
        let write_result = (|| {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.config_path)
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(save_err(e));
        }

        tracing::info!("Saved config to {}", self.config_path);
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_FILE)
    }
}

/// Rename legacy keys in place. A legacy key is left as an unknown key when the current
/// spelling is also present, so files shared with the previous panel keep both.
fn migrate_legacy_keys(entries: &mut IndexMap<String, serde_json::Value>) {
    for (legacy, current) in LEGACY_KEYS {
        if entries.contains_key(*current) {
            continue;
        }
        if let Some(value) = entries.shift_remove(*legacy) {
            tracing::debug!("Migrating config key {} to {}", legacy, current);
            entries.insert((*current).to_string(), value);
        }
    }
}

/// Serialize with 4-space indentation; non-ASCII text is written as-is.
fn to_pretty_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(buf)
}
