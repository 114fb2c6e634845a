use std::collections::BTreeMap;

use rollout_modules::{ModuleEnv, ProcessModules};
use rollout_store::{KeyValueStore, StoreError, Transaction};
use serde_json::Value;
use tracing::debug;

use crate::config::AgentConfig;
use crate::layout::DataLayout;
use crate::{ErrorKind, UpdateError};

/// Everything an operation needs from its surroundings: the data layout,
/// the opened store, the device identity, and the persistence constants.
pub struct UpdateContext {
    layout: DataLayout,
    store: KeyValueStore,
    device_type: String,
    trusted_key_hex: Option<String>,
}

impl UpdateContext {
    /// Key of the single in-progress update record.
    pub const STANDALONE_STATE_KEY: &'static str = "standalone-state";
    /// Schema version of the standalone record. A mismatch is fatal.
    pub const STANDALONE_DATA_VERSION: i64 = 1;
    /// Appended to the artifact name when a failed update cannot be rolled
    /// back, so the device visibly advertises the inconsistency.
    pub const BROKEN_ARTIFACT_NAME_SUFFIX: &'static str = "_INCONSISTENT";

    pub const ARTIFACT_NAME_KEY: &'static str = "artifact-name";
    pub const ARTIFACT_GROUP_KEY: &'static str = "artifact-group";
    pub const ARTIFACT_PROVIDES_KEY: &'static str = "artifact-provides";

    pub fn open(config: &AgentConfig) -> Result<Self, UpdateError> {
        let layout = DataLayout::new(config.resolved_data_dir()?);
        layout.ensure_base_dirs()?;
        let store = KeyValueStore::open(layout.store_path());
        Ok(Self {
            layout,
            store,
            device_type: config.device_type.clone(),
            trusted_key_hex: config.trusted_key_hex.clone(),
        })
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn trusted_key_hex(&self) -> Option<&str> {
        self.trusted_key_hex.as_deref()
    }

    /// The committed provides of the device: the dedicated name/group keys
    /// merged with the provides map. Missing keys are tolerated.
    pub fn load_provides(&self) -> Result<BTreeMap<String, String>, UpdateError> {
        let (name, group, provides_raw) = self.store.read_transaction(|txn| {
            Ok((
                read_optional(txn, Self::ARTIFACT_NAME_KEY)?,
                read_optional(txn, Self::ARTIFACT_GROUP_KEY)?,
                read_optional(txn, Self::ARTIFACT_PROVIDES_KEY)?,
            ))
        })?;

        let mut out = BTreeMap::new();
        if let Some(name) = name {
            if !name.is_empty() {
                out.insert("artifact_name".to_string(), name);
            }
        }
        if let Some(group) = group {
            if !group.is_empty() {
                out.insert("artifact_group".to_string(), group);
            }
        }

        let Some(provides_raw) = provides_raw else {
            return Ok(out);
        };
        if provides_raw.is_empty() {
            return Ok(out);
        }

        let root: Value = serde_json::from_str(&provides_raw).map_err(|err| {
            UpdateError::new(ErrorKind::Json, format!("invalid provides data: {err}"))
        })?;
        let object = root.as_object().ok_or_else(|| {
            UpdateError::new(ErrorKind::Json, "provides data is not an object")
        })?;
        for (key, value) in object {
            let Some(value) = value.as_str() else {
                return Err(UpdateError::new(
                    ErrorKind::FieldType,
                    "Unexpected non-string data in provides",
                ));
            };
            out.insert(key.clone(), value.to_string());
        }
        Ok(out)
    }

    /// Commits new provides data as the device's current state. One write
    /// transaction: the existing provides map is filtered through the
    /// `clears` patterns, overlaid with the new provides, the three provides
    /// keys are written, and finally `txn_fn` runs against the same
    /// transaction (the core uses it to remove the standalone record).
    pub fn commit_artifact_data(
        &self,
        artifact_name: &str,
        artifact_group: &str,
        provides: &Option<BTreeMap<String, String>>,
        clears_provides: &Option<Vec<String>>,
        txn_fn: impl FnOnce(&mut Transaction) -> Result<(), UpdateError>,
    ) -> Result<(), UpdateError> {
        debug!(artifact_name, "committing artifact data");
        self.store.write_transaction(|txn| -> Result<(), UpdateError> {
            let mut merged: BTreeMap<String, String> = match txn.read(Self::ARTIFACT_PROVIDES_KEY)
            {
                Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                    UpdateError::new(
                        ErrorKind::Json,
                        format!("invalid provides data: {err}"),
                    )
                })?,
                Err(err) if err.is_key_not_found() => BTreeMap::new(),
                Err(err) => return Err(err.into()),
            };

            if let Some(clears) = clears_provides {
                merged.retain(|key, _| {
                    !clears.iter().any(|pattern| clears_pattern_matches(pattern, key))
                });
            }
            if let Some(provides) = provides {
                for (key, value) in provides {
                    merged.insert(key.clone(), value.clone());
                }
            }

            let merged_raw = serde_json::to_vec(&merged).map_err(|err| {
                UpdateError::new(
                    ErrorKind::Json,
                    format!("failed serializing provides data: {err}"),
                )
            })?;

            txn.write(Self::ARTIFACT_NAME_KEY, artifact_name.as_bytes());
            txn.write(Self::ARTIFACT_GROUP_KEY, artifact_group.as_bytes());
            txn.write(Self::ARTIFACT_PROVIDES_KEY, &merged_raw);

            txn_fn(txn)
        })
    }

    /// The process-backed module factory for this context. Loading the
    /// current provides can fail, hence the fallible construction.
    pub fn process_modules(&self) -> Result<ProcessModules, UpdateError> {
        Ok(ProcessModules {
            modules_dir: self.layout.modules_dir(),
            work_tree: self.layout.module_work_tree(),
            env: ModuleEnv {
                device_type: self.device_type.clone(),
                current_provides: self.load_provides()?,
            },
        })
    }
}

fn read_optional(txn: &Transaction, key: &str) -> Result<Option<String>, StoreError> {
    match txn.read(key) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.is_key_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Glob match with `*` as the only wildcard, the way clears-provides
/// patterns are written (`rootfs-image.*`).
pub(crate) fn clears_pattern_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[u8], key: &[u8]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&pattern[1..], key)
                    || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), key.as_bytes())
}
