//! Appl package build/extract.
//!
//! An appl package is the unit a directory stores and serves: a
//! line-terminated header of `key=value` fields joined by `:`, followed by
//! a body made of file records. Each file record is a single header line
//! `path=…:name=…:size=N` followed by exactly `N` raw bytes. Records are
//! sorted by `(path, name)`, except the first record, which must be the
//! manifest (by convention, the record named [`MANIFEST_NAME`]) — a
//! package whose first record isn't the manifest is rejected outright.
//!
//! The header always carries `name=` (the package's own identifier) and
//! `hash=` (a base64 BLAKE3 digest of the body); it optionally carries
//! `sign=`/`ksig=` (a base64 Ed25519 signature over the body and the
//! signer's public key) when the publisher wants recipients to be able to
//! verify provenance.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use meridian_crypto::hash;
use meridian_crypto::signatures::{Signature, SigningKey, VerifyingKey};

/// Name the manifest file record must carry for a package to be accepted.
pub const MANIFEST_NAME: &str = "MANIFEST";

/// Errors building or extracting an appl package.
#[derive(Debug, thiserror::Error)]
pub enum ApplError {
    /// The package's identifier is empty or doesn't start with a letter.
    #[error("invalid package name {0:?}")]
    InvalidName(String),
    /// A file record's `name` isn't a legal identifier.
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
    /// `files` was empty; a package needs at least a manifest.
    #[error("package has no file records")]
    Empty,
    /// The first file record in `files` was not named [`MANIFEST_NAME`].
    #[error("first file record must be the manifest")]
    MissingManifest,
    /// The header line was missing, unterminated, or malformed.
    #[error("malformed package header")]
    MalformedHeader,
    /// The header's `hash=` field didn't match the body.
    #[error("content hash mismatch")]
    HashMismatch,
    /// A `sign=`/`ksig=` field was present but didn't verify.
    #[error("signature verification failed")]
    BadSignature,
    /// A file record's header line was malformed or its body was
    /// truncated.
    #[error("malformed file record at offset {0}")]
    MalformedRecord(usize),
    /// A base64 field failed to decode.
    #[error("malformed base64 field {0:?}")]
    BadBase64(String),
}

/// One file record: a relative directory, a file name, and its bytes.
pub type FileRecord = (String, String, Vec<u8>);

fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !s.contains(':') && !s.contains('\n')
}

fn encode_record(path: &str, name: &str, bytes: &[u8]) -> Vec<u8> {
    let mut out = format!("path={path}:name={name}:size={}\n", bytes.len()).into_bytes();
    out.extend_from_slice(bytes);
    out
}

/// Build a package from `files` (manifest first, the remainder sorted by
/// `(path, name)`), under `package_name`, optionally signed with
/// `signing_key`.
///
/// # Errors
///
/// Returns [`ApplError::Empty`] if `files` is empty,
/// [`ApplError::MissingManifest`] if the first record isn't named
/// [`MANIFEST_NAME`], or [`ApplError::InvalidName`]/
/// [`ApplError::InvalidFileName`] if an identifier is malformed.
pub fn build(
    package_name: &str,
    files: &[FileRecord],
    signing_key: Option<&SigningKey>,
) -> Result<Vec<u8>, ApplError> {
    if !is_valid_identifier(package_name) {
        return Err(ApplError::InvalidName(package_name.to_string()));
    }
    let Some((manifest, rest)) = files.split_first() else {
        return Err(ApplError::Empty);
    };
    if manifest.1 != MANIFEST_NAME {
        return Err(ApplError::MissingManifest);
    }
    for (_, name, _) in files {
        if !is_valid_identifier(name) {
            return Err(ApplError::InvalidFileName(name.clone()));
        }
    }

    let mut ordered: Vec<&FileRecord> = rest.iter().collect();
    ordered.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    let mut body = encode_record(&manifest.0, &manifest.1, &manifest.2);
    for (path, name, bytes) in ordered {
        body.extend_from_slice(&encode_record(path, name, bytes));
    }

    let digest = hash::hash(&body);
    let mut header = format!("name={package_name}:hash={}", BASE64.encode(digest));

    if let Some(signing_key) = signing_key {
        let signature = signing_key.sign(&body);
        let verifying = signing_key.verifying_key();
        header.push_str(&format!(
            ":sign={}:ksig={}",
            BASE64.encode(signature.as_bytes()),
            BASE64.encode(verifying.to_bytes())
        ));
    }
    header.push('\n');

    let mut package = header.into_bytes();
    package.extend_from_slice(&body);
    Ok(package)
}

/// A parsed, integrity-checked appl package.
#[derive(Debug, Clone)]
pub struct Extracted {
    /// The package's own identifier (the header's `name=` field).
    pub name: String,
    /// File records in on-wire order (manifest first).
    pub files: Vec<FileRecord>,
    /// Whether a `sign=`/`ksig=` pair was present and verified. `false`
    /// means the package carried no signature, not that one failed — a
    /// failing signature is a hard [`ApplError::BadSignature`].
    pub signed: bool,
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, ApplError> {
    BASE64
        .decode(value)
        .map_err(|_| ApplError::BadBase64(field.to_string()))
}

fn parse_header(line: &str) -> Result<Vec<(&str, &str)>, ApplError> {
    line.split(':')
        .map(|field| field.split_once('=').ok_or(ApplError::MalformedHeader))
        .collect()
}

/// Parse and integrity-check a package previously produced by [`build`].
///
/// # Errors
///
/// Returns [`ApplError::MalformedHeader`]/[`ApplError::MalformedRecord`]
/// if the byte layout is invalid, [`ApplError::HashMismatch`] if the
/// body doesn't match the header's `hash=`, [`ApplError::BadSignature`]
/// if `sign=`/`ksig=` are present but don't verify, or
/// [`ApplError::MissingManifest`] if the first file record isn't named
/// [`MANIFEST_NAME`].
pub fn extract(package: &[u8]) -> Result<Extracted, ApplError> {
    let header_end = package
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ApplError::MalformedHeader)?;
    let header_line =
        std::str::from_utf8(&package[..header_end]).map_err(|_| ApplError::MalformedHeader)?;
    let fields = parse_header(header_line)?;

    let name = fields
        .iter()
        .find(|(k, _)| *k == "name")
        .map(|(_, v)| (*v).to_string())
        .ok_or(ApplError::MalformedHeader)?;
    let hash_field = fields
        .iter()
        .find(|(k, _)| *k == "hash")
        .map(|(_, v)| *v)
        .ok_or(ApplError::MalformedHeader)?;
    let expected_hash = decode_b64("hash", hash_field)?;

    let body = &package[header_end + 1..];
    let actual_hash = hash::hash(body);
    if actual_hash.as_slice() != expected_hash.as_slice() {
        return Err(ApplError::HashMismatch);
    }

    let sign_field = fields.iter().find(|(k, _)| *k == "sign").map(|(_, v)| *v);
    let ksig_field = fields.iter().find(|(k, _)| *k == "ksig").map(|(_, v)| *v);
    let signed = match (sign_field, ksig_field) {
        (Some(sign), Some(ksig)) => {
            let sig_bytes = decode_b64("sign", sign)?;
            let key_bytes = decode_b64("ksig", ksig)?;
            let signature = Signature::from_slice(&sig_bytes).map_err(|_| ApplError::BadSignature)?;
            let key_bytes: [u8; 32] = key_bytes.try_into().map_err(|_| ApplError::BadSignature)?;
            let verifying = VerifyingKey::from_bytes(&key_bytes).map_err(|_| ApplError::BadSignature)?;
            verifying
                .verify(body, &signature)
                .map_err(|_| ApplError::BadSignature)?;
            true
        }
        (None, None) => false,
        _ => return Err(ApplError::MalformedHeader),
    };

    let mut files = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        let line_end = body[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(ApplError::MalformedRecord(offset))?
            + offset;
        let record_header = std::str::from_utf8(&body[offset..line_end])
            .map_err(|_| ApplError::MalformedRecord(offset))?;

        let mut path = None;
        let mut name = None;
        let mut size = None;
        for field in record_header.split(':') {
            let (key, value) = field.split_once('=').ok_or(ApplError::MalformedRecord(offset))?;
            match key {
                "path" => path = Some(value.to_string()),
                "name" => name = Some(value.to_string()),
                "size" => size = Some(value.parse::<usize>().map_err(|_| ApplError::MalformedRecord(offset))?),
                _ => {}
            }
        }
        let (path, name, size) = match (path, name, size) {
            (Some(p), Some(n), Some(s)) => (p, n, s),
            _ => return Err(ApplError::MalformedRecord(offset)),
        };

        let content_start = line_end + 1;
        let content_end = content_start
            .checked_add(size)
            .ok_or(ApplError::MalformedRecord(offset))?;
        if content_end > body.len() {
            return Err(ApplError::MalformedRecord(offset));
        }

        files.push((path, name, body[content_start..content_end].to_vec()));
        offset = content_end;
    }

    match files.first() {
        Some((_, name, _)) if name == MANIFEST_NAME => {}
        _ => return Err(ApplError::MissingManifest),
    }

    Ok(Extracted { name, files, signed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn sample_files() -> Vec<FileRecord> {
        vec![
            (String::new(), MANIFEST_NAME.to_string(), b"manifest contents".to_vec()),
            ("assets".to_string(), "icon".to_string(), vec![1, 2, 3, 4]),
            ("".to_string(), "readme".to_string(), b"read me please".to_vec()),
        ]
    }

    #[test]
    fn unsigned_roundtrip_preserves_records_and_order() {
        let package = build("demo_app", &sample_files(), None).unwrap();
        let extracted = extract(&package).unwrap();

        assert_eq!(extracted.name, "demo_app");
        assert!(!extracted.signed);
        assert_eq!(extracted.files[0].1, MANIFEST_NAME);
        // "" sorts before "assets", so readme (path "") comes before icon.
        assert_eq!(extracted.files[1].1, "readme");
        assert_eq!(extracted.files[2].1, "icon");
    }

    #[test]
    fn signed_package_verifies() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let package = build("demo_app", &sample_files(), Some(&signing_key)).unwrap();
        let extracted = extract(&package).unwrap();
        assert!(extracted.signed);
    }

    #[test]
    fn tampered_body_fails_hash_check() {
        let mut package = build("demo_app", &sample_files(), None).unwrap();
        *package.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(extract(&package), Err(ApplError::HashMismatch)));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut package = build("demo_app", &sample_files(), Some(&signing_key)).unwrap();
        // Flip a byte inside the base64 sign= field without touching the body or hash.
        let header_end = package.iter().position(|&b| b == b'\n').unwrap();
        let sign_pos = package[..header_end]
            .windows(5)
            .position(|w| w == b"sign=")
            .unwrap()
            + 5;
        package[sign_pos] = if package[sign_pos] == b'A' { b'B' } else { b'A' };
        assert!(matches!(extract(&package), Err(ApplError::BadSignature)));
    }

    #[test]
    fn non_manifest_first_record_is_rejected() {
        let files = vec![("".to_string(), "readme".to_string(), b"oops".to_vec())];
        assert!(matches!(build("demo_app", &files, None), Err(ApplError::MissingManifest)));
    }

    #[test]
    fn empty_file_list_is_rejected() {
        assert!(matches!(build("demo_app", &[], None), Err(ApplError::Empty)));
    }
}
