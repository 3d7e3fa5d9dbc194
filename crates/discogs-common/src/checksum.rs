//! Checksum utilities for downloaded dump verification

use crate::error::{DiscogsError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Compute checksum for a file
pub fn compute_file_checksum(
    path: impl AsRef<Path>,
    algorithm: ChecksumAlgorithm,
) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file, algorithm)
}

/// Compute checksum for any readable source
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<String> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => digest_reader::<Sha256, _>(reader),
        ChecksumAlgorithm::Sha512 => digest_reader::<Sha512, _>(reader),
    }
}

fn digest_reader<D: Digest, R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Parse a checksum manifest in `sha256sum` format.
///
/// Each non-empty line is `<hex digest> <file name>`; the file name may be
/// prefixed with `*` (binary mode marker). Returns file name -> lowercase digest.
pub fn parse_checksum_manifest(content: &str) -> Result<HashMap<String, String>> {
    let mut entries = HashMap::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(digest), Some(name)) = (parts.next(), parts.next()) else {
            return Err(DiscogsError::Manifest {
                line: line_no + 1,
                message: format!("expected '<digest> <file name>', got '{}'", line),
            });
        };

        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DiscogsError::Manifest {
                line: line_no + 1,
                message: format!("'{}' is not a hex digest", digest),
            });
        }

        let name = name.trim_start_matches('*');
        entries.insert(name.to_string(), digest.to_ascii_lowercase());
    }

    Ok(entries)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_compute_checksum_sha256() {
        let data = b"hello world";
        let mut cursor = Cursor::new(data);
        let checksum = compute_checksum(&mut cursor, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
        assert_eq!(sha256_hex(data), checksum);
    }

    #[test]
    fn test_compute_checksum_sha512() {
        let data = b"hello world";
        let mut cursor = Cursor::new(data);
        let checksum = compute_checksum(&mut cursor, ChecksumAlgorithm::Sha512).unwrap();
        assert_eq!(
            checksum,
            "309ecc489c12d6eb4cc40f50c902f2b4d0ed77ee511a7c7a9bcd3ca86d4cd86f989dd35bc5ff499670da34255b45b0cfd830e81f605dcf7dc5542e93ae9cd76f"
        );
    }

    #[test]
    fn test_compute_file_checksum() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let checksum = compute_file_checksum(file.path(), ChecksumAlgorithm::default()).unwrap();
        assert_eq!(checksum, sha256_hex(b"hello world"));
        assert!(compute_file_checksum("/nonexistent/dump.xml.gz", ChecksumAlgorithm::Sha256).is_err());
    }

    #[test]
    fn test_parse_checksum_manifest() {
        let manifest = "\
abc123  discogs_20240101_artists.xml.gz
DEF456 *discogs_20240101_labels.xml.gz

";
        let entries = parse_checksum_manifest(manifest).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["discogs_20240101_artists.xml.gz"], "abc123");
        assert_eq!(entries["discogs_20240101_labels.xml.gz"], "def456");
    }

    #[test]
    fn test_parse_checksum_manifest_rejects_garbage() {
        assert!(parse_checksum_manifest("onlyonefield").is_err());
        match parse_checksum_manifest("abc12 ok.gz\nzzzz file.gz") {
            Err(DiscogsError::Manifest { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}
