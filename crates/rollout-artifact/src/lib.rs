//! Reader for the rollout artifact container.
//!
//! An artifact is a UTF-8 JSON header document on the first line of the
//! stream, followed by the raw payload bytes. The header names the artifact,
//! the payload type that selects the update module, the provides metadata,
//! and the payload's size and sha256. When a trusted key is configured the
//! header must carry an Ed25519 signature over
//! `"<artifact_name>\n<payload_sha256>\n"`.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ARTIFACT_FORMAT: &str = "rollout-artifact";
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid artifact header: {0}")]
    Parse(String),
    #[error("artifact signature rejected: {0}")]
    Signature(String),
    #[error("no payload at index {0}")]
    PayloadIndex(usize),
    #[error("artifact payload already consumed")]
    PayloadConsumed,
}

/// Parser configuration. The scripts directory is handed to payload types
/// that ship state scripts; the core only threads it through.
#[derive(Debug, Clone, Default)]
pub struct ParserConfig {
    pub artifact_scripts_dir: PathBuf,
    pub trusted_key_hex: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    format: String,
    version: u32,
    artifact_name: String,
    #[serde(default)]
    artifact_group: String,
    payload_type: String,
    artifact_provides: Option<BTreeMap<String, String>>,
    clears_artifact_provides: Option<Vec<String>>,
    payload: RawPayload,
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    name: String,
    size: u64,
    sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub artifact_provides: Option<BTreeMap<String, String>>,
    pub clears_artifact_provides: Option<Vec<String>>,
}

/// The header fields the update core consumes for a single payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeaderView {
    pub artifact_name: String,
    pub artifact_group: String,
    pub payload_type: String,
    pub type_info: TypeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

pub struct Artifact {
    view: PayloadHeaderView,
    payload_info: PayloadInfo,
    reader: BufReader<Box<dyn Read>>,
    payload_consumed: bool,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("view", &self.view)
            .field("payload_info", &self.payload_info)
            .field("payload_consumed", &self.payload_consumed)
            .finish()
    }
}

pub fn parse(reader: impl Read + 'static, config: &ParserConfig) -> Result<Artifact, ArtifactError> {
    let mut reader: BufReader<Box<dyn Read>> = BufReader::new(Box::new(reader));

    let mut header_line = Vec::new();
    reader.read_until(b'\n', &mut header_line)?;
    if header_line.is_empty() {
        return Err(ArtifactError::Parse("missing artifact header".to_string()));
    }

    let raw: RawHeader = serde_json::from_slice(&header_line)
        .map_err(|err| ArtifactError::Parse(err.to_string()))?;

    if raw.format != ARTIFACT_FORMAT {
        return Err(ArtifactError::Parse(format!(
            "unsupported artifact format '{}'",
            raw.format
        )));
    }
    if raw.version != ARTIFACT_FORMAT_VERSION {
        return Err(ArtifactError::Parse(format!(
            "unsupported artifact version {}",
            raw.version
        )));
    }
    if raw.artifact_name.is_empty() {
        return Err(ArtifactError::Parse("artifact_name is empty".to_string()));
    }
    if raw.payload_type.is_empty() {
        return Err(ArtifactError::Parse("payload_type is empty".to_string()));
    }
    validate_payload_name(&raw.payload.name)?;
    if raw.payload.sha256.len() != 64
        || !raw.payload.sha256.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(ArtifactError::Parse(format!(
            "payload sha256 is not a hex digest: '{}'",
            raw.payload.sha256
        )));
    }

    if let Some(trusted_key_hex) = &config.trusted_key_hex {
        verify_header_signature(&raw, trusted_key_hex)?;
    }

    Ok(Artifact {
        view: PayloadHeaderView {
            artifact_name: raw.artifact_name,
            artifact_group: raw.artifact_group,
            payload_type: raw.payload_type,
            type_info: TypeInfo {
                artifact_provides: raw.artifact_provides,
                clears_artifact_provides: raw.clears_artifact_provides,
            },
        },
        payload_info: PayloadInfo {
            name: raw.payload.name,
            size: raw.payload.size,
            sha256: raw.payload.sha256,
        },
        reader,
        payload_consumed: false,
    })
}

fn validate_payload_name(name: &str) -> Result<(), ArtifactError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(ArtifactError::Parse(format!(
            "invalid payload name: '{name}'"
        )));
    }
    Ok(())
}

fn verify_header_signature(raw: &RawHeader, trusted_key_hex: &str) -> Result<(), ArtifactError> {
    let Some(signature_hex) = &raw.signature else {
        return Err(ArtifactError::Signature(
            "artifact is unsigned but a trusted key is configured".to_string(),
        ));
    };

    let message = signed_message(&raw.artifact_name, &raw.payload.sha256);
    let verified = rollout_security::verify_detached_ed25519_hex(
        message.as_bytes(),
        trusted_key_hex,
        signature_hex,
    )
    .map_err(|err| ArtifactError::Signature(err.to_string()))?;

    if !verified {
        return Err(ArtifactError::Signature(
            "signature verification failed".to_string(),
        ));
    }
    Ok(())
}

/// The byte string an artifact signature covers.
pub fn signed_message(artifact_name: &str, payload_sha256: &str) -> String {
    format!("{artifact_name}\n{payload_sha256}\n")
}

impl Artifact {
    /// Header view for the payload at `index`. Artifacts carry exactly one
    /// payload; any other index is an error.
    pub fn payload_header_view(&self, index: usize) -> Result<PayloadHeaderView, ArtifactError> {
        if index != 0 {
            return Err(ArtifactError::PayloadIndex(index));
        }
        Ok(self.view.clone())
    }

    pub fn payload_info(&self) -> &PayloadInfo {
        &self.payload_info
    }

    /// Hands out the payload stream. May be called at most once.
    pub fn next_payload(&mut self) -> Result<Payload<'_>, ArtifactError> {
        if self.payload_consumed {
            return Err(ArtifactError::PayloadConsumed);
        }
        self.payload_consumed = true;
        Ok(Payload {
            name: self.payload_info.name.clone(),
            size: self.payload_info.size,
            expected_sha256: self.payload_info.sha256.clone(),
            remaining: self.payload_info.size,
            hasher: Sha256::new(),
            verified: false,
            reader: &mut self.reader,
        })
    }
}

/// A size-limited payload stream. The sha256 of the bytes is checked when
/// the declared size has been read; a mismatch or a truncated stream
/// surfaces as an `InvalidData`/`UnexpectedEof` read error.
pub struct Payload<'a> {
    name: String,
    size: u64,
    expected_sha256: String,
    remaining: u64,
    hasher: Sha256,
    verified: bool,
    reader: &'a mut BufReader<Box<dyn Read>>,
}

impl std::fmt::Debug for Payload<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("expected_sha256", &self.expected_sha256)
            .field("remaining", &self.remaining)
            .field("verified", &self.verified)
            .finish()
    }
}

impl Payload<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_digest(&mut self) -> io::Result<()> {
        if self.verified {
            return Ok(());
        }
        let actual = hex::encode(self.hasher.clone().finalize());
        if !rollout_security::digests_match(&actual, &self.expected_sha256) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "payload checksum mismatch: expected {}, got {}",
                    self.expected_sha256, actual
                ),
            ));
        }
        self.verified = true;
        Ok(())
    }
}

impl Read for Payload<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            self.check_digest()?;
            return Ok(0);
        }

        let limit = buf.len().min(self.remaining as usize);
        let read = self.reader.read(&mut buf[..limit])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "payload truncated: {} bytes missing of declared {}",
                    self.remaining, self.size
                ),
            ));
        }

        self.hasher.update(&buf[..read]);
        self.remaining -= read as u64;
        if self.remaining == 0 {
            self.check_digest()?;
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests;
