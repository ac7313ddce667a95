use crate::codec::RecordEncoding;
use crate::pipeline::UnknownPolicy;
use crate::schema::ValidationMode;
use crate::world::DEFAULT_SHARD_COUNT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

const CONFIG_SCHEMA_VERSION: u32 = 1;
const MAX_SHARD_COUNT: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub schema_version: u32,
    pub unknown_policy: UnknownPolicy,
    pub validation_mode: ValidationMode,
    pub encoding: RecordEncoding,
    pub shard_count: usize,
    pub validate_on_save: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            unknown_policy: UnknownPolicy::default(),
            validation_mode: ValidationMode::default(),
            encoding: RecordEncoding::default(),
            shard_count: DEFAULT_SHARD_COUNT,
            validate_on_save: true,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, error: io::Error },
    Parse { path: PathBuf, error: serde_json::Error },
    UnsupportedSchema { path: PathBuf, version: u32 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, error } => {
                write!(f, "failed to read config {}: {error}", path.display())
            }
            Self::Parse { path, error } => {
                write!(f, "failed to parse config {}: {error}", path.display())
            }
            Self::UnsupportedSchema { path, version } => write!(
                f,
                "config {} has schema_version {version}, expected {CONFIG_SCHEMA_VERSION}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl StoreConfig {
    /// Load from `path`.  A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                log::debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    error,
                })
            }
        };
        let config: Self = serde_json::from_str(&raw).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })?;
        if config.schema_version != CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedSchema {
                path: path.to_path_buf(),
                version: config.schema_version,
            });
        }
        Ok(config.sanitized())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        std::fs::write(path, bytes)
    }

    pub fn sanitized(mut self) -> Self {
        self.shard_count = self.shard_count.clamp(1, MAX_SHARD_COUNT);
        self
    }
}
