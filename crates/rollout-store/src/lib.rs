//! File-backed key-value store used for all persistent device state.
//!
//! The whole store lives in a single JSON file. Mutations are staged in
//! memory and land through an atomic replace (write to a temp file in the
//! same directory, then rename), so a crash mid-write never leaves a
//! half-updated store behind.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const STORE_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {key}")]
    KeyNotFound { key: String },
    #[error("store io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store file {} is corrupt: {detail}", .path.display())]
    Corrupt { path: PathBuf, detail: String },
}

impl StoreError {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, Vec<u8>>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_FILE_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// A staged view of the store contents. Reads see the staged state;
/// mutations only persist if the enclosing write transaction succeeds.
pub struct Transaction {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Transaction {
    pub fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound {
                key: key.to_string(),
            })
    }

    pub fn write(&mut self, key: &str, value: &[u8]) {
        self.entries.insert(key.to_string(), value.to_vec());
    }

    /// Removing an absent key is not an error.
    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

#[derive(Debug, Clone)]
pub struct KeyValueStore {
    path: PathBuf,
}

impl KeyValueStore {
    /// Opens the store at `path`. A missing file is an empty store; it is
    /// created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.read_transaction(|txn| txn.read(key))
    }

    pub fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.write_transaction(|txn| -> Result<(), StoreError> {
            txn.write(key, value);
            Ok(())
        })
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.write_transaction(|txn| -> Result<(), StoreError> {
            txn.remove(key);
            Ok(())
        })
    }

    pub fn read_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let file = self.load_file()?;
        let txn = Transaction {
            entries: file.entries,
        };
        f(&txn)
    }

    /// Runs `f` against a staged copy of the store and persists the result
    /// atomically. An `Err` from `f` discards all staged mutations.
    pub fn write_transaction<E, F>(&self, f: F) -> Result<(), E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Transaction) -> Result<(), E>,
    {
        let file = self.load_file()?;
        let mut txn = Transaction {
            entries: file.entries,
        };
        f(&mut txn)?;
        self.persist_file(&StoreFile {
            version: STORE_FILE_VERSION,
            entries: txn.entries,
        })?;
        Ok(())
    }

    fn load_file(&self) -> Result<StoreFile, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StoreFile::default());
            }
            Err(err) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source: err,
                });
            }
        };

        let file: StoreFile =
            serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt {
                path: self.path.clone(),
                detail: err.to_string(),
            })?;
        if file.version != STORE_FILE_VERSION {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                detail: format!("unsupported store file version: {}", file.version),
            });
        }
        Ok(file)
    }

    fn persist_file(&self, file: &StoreFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| StoreError::Io {
                path: parent.to_path_buf(),
                source: err,
            })?;
        }

        let content = serde_json::to_vec(file).map_err(|err| StoreError::Corrupt {
            path: self.path.clone(),
            detail: format!("failed serializing store file: {err}"),
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &content).map_err(|err| StoreError::Io {
            path: tmp_path.clone(),
            source: err,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|err| StoreError::Io {
            path: self.path.clone(),
            source: err,
        })?;
        Ok(())
    }
}
