//! The persisted record of an in-progress update, and its codec.
//!
//! Exactly one record may exist, under a fixed key. Its presence is what
//! makes an update "in progress": created after the artifact header is
//! accepted, removed on commit, rollback, or broken-artifact finalization.
//! The JSON key names are an on-disk contract; devices in the field carry
//! records written by earlier agent versions.

use std::collections::BTreeMap;

use rollout_artifact::PayloadHeaderView;
use rollout_store::KeyValueStore;
use serde_json::{Map, Value};

use crate::context::UpdateContext;
use crate::{ErrorKind, UpdateError};

const VERSION_KEY: &str = "Version";
const ARTIFACT_NAME_KEY: &str = "ArtifactName";
const ARTIFACT_GROUP_KEY: &str = "ArtifactGroup";
const ARTIFACT_PROVIDES_KEY: &str = "ArtifactTypeInfoProvides";
const ARTIFACT_CLEARS_PROVIDES_KEY: &str = "ArtifactClearsProvides";
const PAYLOAD_TYPES_KEY: &str = "PayloadTypes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandaloneData {
    pub version: i64,
    pub artifact_name: String,
    pub artifact_group: String,
    pub artifact_provides: Option<BTreeMap<String, String>>,
    pub artifact_clears_provides: Option<Vec<String>>,
    pub payload_types: Vec<String>,
}

pub fn standalone_data_from_header(header: &PayloadHeaderView) -> StandaloneData {
    StandaloneData {
        version: UpdateContext::STANDALONE_DATA_VERSION,
        artifact_name: header.artifact_name.clone(),
        artifact_group: header.artifact_group.clone(),
        artifact_provides: header.type_info.artifact_provides.clone(),
        artifact_clears_provides: header.type_info.clears_artifact_provides.clone(),
        payload_types: vec![header.payload_type.clone()],
    }
}

fn missing_key_error(key: &str) -> UpdateError {
    UpdateError::new(
        ErrorKind::FieldMissing,
        format!("Could not get `{key}` from state data"),
    )
}

fn wrong_type_error(key: &str) -> UpdateError {
    UpdateError::new(
        ErrorKind::FieldType,
        format!("Unexpected type for `{key}` in state data"),
    )
}

fn required_integer(root: &Map<String, Value>, key: &str) -> Result<i64, UpdateError> {
    match root.get(key) {
        None => Err(missing_key_error(key)),
        Some(value) => value.as_i64().ok_or_else(|| wrong_type_error(key)),
    }
}

fn required_string(root: &Map<String, Value>, key: &str) -> Result<String, UpdateError> {
    match root.get(key) {
        None => Err(missing_key_error(key)),
        Some(value) => value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| wrong_type_error(key)),
    }
}

/// Missing key defaults; a present key with the wrong type is an error.
fn optional_string(root: &Map<String, Value>, key: &str) -> Result<String, UpdateError> {
    match root.get(key) {
        None => Ok(String::new()),
        Some(value) => value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| wrong_type_error(key)),
    }
}

fn string_array(value: &Value) -> Option<Vec<String>> {
    let array = value.as_array()?;
    array
        .iter()
        .map(|entry| entry.as_str().map(str::to_string))
        .collect()
}

fn string_map(value: &Value) -> Option<BTreeMap<String, String>> {
    let object = value.as_object()?;
    object
        .iter()
        .map(|(key, entry)| entry.as_str().map(|s| (key.clone(), s.to_string())))
        .collect()
}

/// Reads the standalone record. Absence of the key is `Ok(None)`; any other
/// store failure, malformed JSON, or a record that fails validation is an
/// error.
pub fn load_standalone_data(
    store: &KeyValueStore,
) -> Result<Option<StandaloneData>, UpdateError> {
    let bytes = match store.read(UpdateContext::STANDALONE_STATE_KEY) {
        Ok(bytes) => bytes,
        Err(err) if err.is_key_not_found() => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let root: Value = serde_json::from_slice(&bytes).map_err(|err| {
        UpdateError::new(ErrorKind::Json, format!("invalid state data: {err}"))
    })?;
    let root = root
        .as_object()
        .ok_or_else(|| UpdateError::new(ErrorKind::Json, "state data is not an object"))?;

    let version = required_integer(root, VERSION_KEY)?;
    let artifact_name = required_string(root, ARTIFACT_NAME_KEY)?;
    let artifact_group = optional_string(root, ARTIFACT_GROUP_KEY)?;

    // A malformed provides map or clears list is tolerated as absent.
    let artifact_provides = root.get(ARTIFACT_PROVIDES_KEY).and_then(string_map);
    let artifact_clears_provides = root
        .get(ARTIFACT_CLEARS_PROVIDES_KEY)
        .and_then(string_array);

    let payload_types = match root.get(PAYLOAD_TYPES_KEY) {
        None => return Err(missing_key_error(PAYLOAD_TYPES_KEY)),
        Some(value) => string_array(value).ok_or_else(|| wrong_type_error(PAYLOAD_TYPES_KEY))?,
    };

    let data = StandaloneData {
        version,
        artifact_name,
        artifact_group,
        artifact_provides,
        artifact_clears_provides,
        payload_types,
    };

    if data.version != UpdateContext::STANDALONE_DATA_VERSION {
        return Err(UpdateError::new(
            ErrorKind::NotSupported,
            "State data has a version which is not supported by this client",
        ));
    }
    if data.artifact_name.is_empty() {
        return Err(UpdateError::new(
            ErrorKind::DatabaseValue,
            format!("`{ARTIFACT_NAME_KEY}` is empty"),
        ));
    }
    if data.payload_types.is_empty() {
        return Err(UpdateError::new(
            ErrorKind::DatabaseValue,
            format!("`{PAYLOAD_TYPES_KEY}` is empty"),
        ));
    }
    if data.payload_types.len() >= 2 {
        return Err(UpdateError::new(
            ErrorKind::NotSupported,
            format!("`{PAYLOAD_TYPES_KEY}` contains multiple payloads"),
        ));
    }

    Ok(Some(data))
}

/// Writes the standalone record. `Version`, `ArtifactName`, `ArtifactGroup`
/// and `PayloadTypes` are always emitted (the group even when empty); the
/// optional containers only when present.
pub fn save_standalone_data(
    store: &KeyValueStore,
    data: &StandaloneData,
) -> Result<(), UpdateError> {
    let mut root = Map::new();
    root.insert(VERSION_KEY.to_string(), Value::from(data.version));
    root.insert(
        ARTIFACT_NAME_KEY.to_string(),
        Value::from(data.artifact_name.clone()),
    );
    root.insert(
        ARTIFACT_GROUP_KEY.to_string(),
        Value::from(data.artifact_group.clone()),
    );
    root.insert(
        PAYLOAD_TYPES_KEY.to_string(),
        Value::from(data.payload_types.clone()),
    );
    if let Some(provides) = &data.artifact_provides {
        root.insert(
            ARTIFACT_PROVIDES_KEY.to_string(),
            Value::from(
                provides
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                    .collect::<Map<String, Value>>(),
            ),
        );
    }
    if let Some(clears) = &data.artifact_clears_provides {
        root.insert(
            ARTIFACT_CLEARS_PROVIDES_KEY.to_string(),
            Value::from(clears.clone()),
        );
    }

    let bytes = serde_json::to_vec(&Value::Object(root)).map_err(|err| {
        UpdateError::new(ErrorKind::Json, format!("failed serializing state data: {err}"))
    })?;
    store
        .write(UpdateContext::STANDALONE_STATE_KEY, &bytes)
        .map_err(UpdateError::from)
}

pub fn remove_standalone_data(store: &KeyValueStore) -> Result<(), UpdateError> {
    store
        .remove(UpdateContext::STANDALONE_STATE_KEY)
        .map_err(UpdateError::from)
}
