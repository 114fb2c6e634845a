use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::layout::default_data_dir;
use crate::{ErrorKind, UpdateError};

/// Agent configuration, read from a TOML file. Every field has a default so
/// a missing config file is a valid (if minimal) setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Hex-encoded Ed25519 public key; when set, unsigned artifacts are
    /// rejected.
    #[serde(default)]
    pub trusted_key_hex: Option<String>,
}

fn default_device_type() -> String {
    "unknown".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            device_type: default_device_type(),
            trusted_key_hex: None,
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, UpdateError> {
        toml::from_str(input).map_err(|err| {
            UpdateError::new(ErrorKind::Json, format!("failed to parse config: {err}"))
        })
    }

    /// Loads the config at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, UpdateError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(UpdateError::new(
                    ErrorKind::Io,
                    format!("failed to read config {}: {err}", path.display()),
                ));
            }
        };
        Self::from_toml_str(&raw)
    }

    pub fn resolved_data_dir(&self) -> Result<PathBuf, UpdateError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }
}
