use super::*;

use std::io::{self, Cursor, Read};

use ed25519_dalek::{Signer, SigningKey};

fn artifact_bytes(header: &str, payload: &[u8]) -> Vec<u8> {
    let mut bytes = header.as_bytes().to_vec();
    bytes.push(b'\n');
    bytes.extend_from_slice(payload);
    bytes
}

fn header_json(artifact_name: &str, payload: &[u8]) -> String {
    format!(
        concat!(
            r#"{{"format":"rollout-artifact","version":1,"artifact_name":"{}","#,
            r#""artifact_group":"release","payload_type":"dummy","#,
            r#""artifact_provides":{{"artifact_name":"{}"}},"#,
            r#""clears_artifact_provides":["artifact_name"],"#,
            r#""payload":{{"name":"payload.img","size":{},"sha256":"{}"}}}}"#
        ),
        artifact_name,
        artifact_name,
        payload.len(),
        rollout_security::sha256_hex(payload)
    )
}

fn parse_bytes(bytes: Vec<u8>, config: &ParserConfig) -> Result<Artifact, ArtifactError> {
    parse(Cursor::new(bytes), config)
}

#[test]
fn parse_exposes_the_header_view() {
    let payload = b"payload contents";
    let bytes = artifact_bytes(&header_json("release-1", payload), payload);
    let artifact = parse_bytes(bytes, &ParserConfig::default()).expect("must parse");

    let view = artifact.payload_header_view(0).expect("must view");
    assert_eq!(view.artifact_name, "release-1");
    assert_eq!(view.artifact_group, "release");
    assert_eq!(view.payload_type, "dummy");
    assert_eq!(
        view.type_info
            .artifact_provides
            .as_ref()
            .expect("provides")
            .get("artifact_name")
            .map(String::as_str),
        Some("release-1")
    );
    assert_eq!(
        view.type_info.clears_artifact_provides,
        Some(vec!["artifact_name".to_string()])
    );

    assert_eq!(artifact.payload_info().name, "payload.img");
    assert_eq!(artifact.payload_info().size, payload.len() as u64);
}

#[test]
fn payload_view_index_other_than_zero_is_rejected() {
    let payload = b"x";
    let bytes = artifact_bytes(&header_json("release-1", payload), payload);
    let artifact = parse_bytes(bytes, &ParserConfig::default()).expect("must parse");

    let err = artifact.payload_header_view(1).expect_err("must fail");
    assert!(matches!(err, ArtifactError::PayloadIndex(1)));
}

#[test]
fn payload_reads_to_end_and_verifies() {
    let payload = b"some payload data";
    let bytes = artifact_bytes(&header_json("release-1", payload), payload);
    let mut artifact = parse_bytes(bytes, &ParserConfig::default()).expect("must parse");

    let mut stream = artifact.next_payload().expect("must take payload");
    assert_eq!(stream.name(), "payload.img");
    let mut out = Vec::new();
    stream.read_to_end(&mut out).expect("must read");
    assert_eq!(out, payload);
}

#[test]
fn payload_may_only_be_taken_once() {
    let payload = b"x";
    let bytes = artifact_bytes(&header_json("release-1", payload), payload);
    let mut artifact = parse_bytes(bytes, &ParserConfig::default()).expect("must parse");

    artifact.next_payload().expect("first take must work");
    let err = artifact.next_payload().expect_err("second take must fail");
    assert!(matches!(err, ArtifactError::PayloadConsumed));
}

#[test]
fn corrupted_payload_fails_the_read() {
    let payload = b"original bytes";
    let header = header_json("release-1", payload);
    let bytes = artifact_bytes(&header, b"tampered bytes");
    let mut artifact = parse_bytes(bytes, &ParserConfig::default()).expect("must parse");

    let mut stream = artifact.next_payload().expect("must take payload");
    let mut out = Vec::new();
    let err = stream.read_to_end(&mut out).expect_err("must fail");
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[test]
fn truncated_payload_fails_the_read() {
    let payload = b"full declared payload";
    let header = header_json("release-1", payload);
    let bytes = artifact_bytes(&header, &payload[..5]);
    let mut artifact = parse_bytes(bytes, &ParserConfig::default()).expect("must parse");

    let mut stream = artifact.next_payload().expect("must take payload");
    let mut out = Vec::new();
    let err = stream.read_to_end(&mut out).expect_err("must fail");
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}

#[test]
fn missing_header_is_a_parse_error() {
    let err = parse_bytes(Vec::new(), &ParserConfig::default()).expect_err("must fail");
    assert!(matches!(err, ArtifactError::Parse(_)));
}

#[test]
fn wrong_format_marker_is_rejected() {
    let header = r#"{"format":"other","version":1,"artifact_name":"a","payload_type":"dummy","payload":{"name":"p","size":0,"sha256":"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"}}"#;
    let err =
        parse_bytes(artifact_bytes(header, b""), &ParserConfig::default()).expect_err("must fail");
    assert!(matches!(err, ArtifactError::Parse(_)));
}

#[test]
fn unsupported_version_is_rejected() {
    let header = r#"{"format":"rollout-artifact","version":2,"artifact_name":"a","payload_type":"dummy","payload":{"name":"p","size":0,"sha256":"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"}}"#;
    let err =
        parse_bytes(artifact_bytes(header, b""), &ParserConfig::default()).expect_err("must fail");
    assert!(matches!(err, ArtifactError::Parse(_)));
}

#[test]
fn payload_name_with_path_separators_is_rejected() {
    let header = r#"{"format":"rollout-artifact","version":1,"artifact_name":"a","payload_type":"dummy","payload":{"name":"../escape","size":0,"sha256":"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"}}"#;
    let err =
        parse_bytes(artifact_bytes(header, b""), &ParserConfig::default()).expect_err("must fail");
    assert!(matches!(err, ArtifactError::Parse(_)));
}

#[test]
fn missing_artifact_group_defaults_to_empty() {
    let header = r#"{"format":"rollout-artifact","version":1,"artifact_name":"a","payload_type":"dummy","payload":{"name":"p","size":0,"sha256":"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"}}"#;
    let artifact =
        parse_bytes(artifact_bytes(header, b""), &ParserConfig::default()).expect("must parse");
    let view = artifact.payload_header_view(0).expect("must view");
    assert_eq!(view.artifact_group, "");
    assert!(view.type_info.artifact_provides.is_none());
    assert!(view.type_info.clears_artifact_provides.is_none());
}

fn signed_artifact(payload: &[u8]) -> (Vec<u8>, String) {
    let signing_key = SigningKey::from_bytes(&[0x42; 32]);
    let public_key_hex = hex::encode(signing_key.verifying_key().as_bytes());

    let sha256 = rollout_security::sha256_hex(payload);
    let signature = signing_key.sign(signed_message("release-1", &sha256).as_bytes());

    let header = format!(
        concat!(
            r#"{{"format":"rollout-artifact","version":1,"artifact_name":"release-1","#,
            r#""payload_type":"dummy","#,
            r#""payload":{{"name":"payload.img","size":{},"sha256":"{}"}},"#,
            r#""signature":"{}"}}"#
        ),
        payload.len(),
        sha256,
        hex::encode(signature.to_bytes())
    );
    (artifact_bytes(&header, payload), public_key_hex)
}

#[test]
fn signed_artifact_passes_with_trusted_key() {
    let (bytes, public_key_hex) = signed_artifact(b"signed payload");
    let config = ParserConfig {
        trusted_key_hex: Some(public_key_hex),
        ..ParserConfig::default()
    };
    parse_bytes(bytes, &config).expect("must parse");
}

#[test]
fn unsigned_artifact_fails_when_key_is_configured() {
    let payload = b"x";
    let bytes = artifact_bytes(&header_json("release-1", payload), payload);
    let config = ParserConfig {
        trusted_key_hex: Some(
            "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a".to_string(),
        ),
        ..ParserConfig::default()
    };
    let err = parse_bytes(bytes, &config).expect_err("must fail");
    assert!(matches!(err, ArtifactError::Signature(_)));
}

#[test]
fn signature_from_wrong_key_is_rejected() {
    let (bytes, _) = signed_artifact(b"signed payload");
    let config = ParserConfig {
        trusted_key_hex: Some(
            "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a".to_string(),
        ),
        ..ParserConfig::default()
    };
    let err = parse_bytes(bytes, &config).expect_err("must fail");
    assert!(matches!(err, ArtifactError::Signature(_)));
}

#[test]
fn signed_artifact_without_configured_key_still_parses() {
    let (bytes, _) = signed_artifact(b"signed payload");
    parse_bytes(bytes, &ParserConfig::default()).expect("must parse");
}
