use std::io::Read;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_hex_stream<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = reader
            .read(&mut buf)
            .context("failed reading stream for digest")?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn digests_match(actual_hex: &str, expected_hex: &str) -> bool {
    actual_hex.eq_ignore_ascii_case(expected_hex)
}

/// Why a signature could not be checked at all. A checkable but wrong
/// signature is not an error; it verifies to `false`.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Ed25519 {field} is not valid hex: {source}")]
    BadHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },
    #[error("Ed25519 {field} must be {expected} bytes, got {actual}")]
    BadLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("malformed Ed25519 public key: {0}")]
    BadKey(#[from] ed25519_dalek::SignatureError),
}

fn decode_fixed_hex<const N: usize>(
    field: &'static str,
    input: &str,
) -> Result<[u8; N], SignatureError> {
    let bytes = hex::decode(input).map_err(|source| SignatureError::BadHex { field, source })?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| SignatureError::BadLength {
        field,
        expected: N,
        actual,
    })
}

pub fn verify_detached_ed25519_hex(
    message: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool, SignatureError> {
    let key = VerifyingKey::from_bytes(&decode_fixed_hex::<32>("public key", public_key_hex)?)?;
    let signature = Signature::from_bytes(&decode_fixed_hex::<64>("signature", signature_hex)?);
    Ok(key.verify(message, &signature).is_ok())
}
