use std::fs;
use std::path::{Path, PathBuf};

use crate::{ErrorKind, UpdateError};

/// All paths under the agent's data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    data_dir: PathBuf,
}

impl DataLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.data_dir.join("modules").join("v3")
    }

    /// The work tree handed to the update module. A single payload per
    /// operation keeps this at a fixed index.
    pub fn module_work_tree(&self) -> PathBuf {
        self.data_dir.join("payloads").join("0000").join("tree")
    }

    pub fn artifact_scripts_dir(&self) -> PathBuf {
        self.data_dir.join("scripts")
    }

    pub fn ensure_base_dirs(&self) -> Result<(), UpdateError> {
        for dir in [
            self.data_dir.clone(),
            self.modules_dir(),
            self.artifact_scripts_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|err| {
                UpdateError::new(
                    ErrorKind::Io,
                    format!("failed to create {}: {err}", dir.display()),
                )
            })?;
        }
        Ok(())
    }
}

/// Resolves the default data directory: `ROLLOUT_DATA_DIR` wins, then a
/// per-user directory.
pub fn default_data_dir() -> Result<PathBuf, UpdateError> {
    if let Ok(dir) = std::env::var("ROLLOUT_DATA_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA").map_err(|_| {
            UpdateError::new(
                ErrorKind::Io,
                "LOCALAPPDATA is not set; cannot resolve data directory",
            )
        })?;
        return Ok(PathBuf::from(app_data).join("Rollout"));
    }

    let home = std::env::var("HOME").map_err(|_| {
        UpdateError::new(ErrorKind::Io, "HOME is not set; cannot resolve data directory")
    })?;
    Ok(PathBuf::from(home).join(".rollout"))
}
