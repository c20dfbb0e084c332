//! Checksum computation.
//!
//! This module provides:
//! - The digest algorithms accepted for verification (MD5, SHA-1, SHA-256, SHA-512)
//! - A streaming hasher trait with one implementation per algorithm
//! - Whole-file hashing, plus a bounded variant that honours a deadline and
//!   a cancellation token between read chunks

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::EngineError;

/// Read size used while hashing. Media files are large; keep syscalls few.
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// MD5 (weak, but still what many camera-card workflows expect)
    Md5,
    /// SHA-1 (160-bit)
    Sha1,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// SHA-512 (cryptographic, 512-bit)
    Sha512,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 4] = [Self::Md5, Self::Sha1, Self::Sha256, Self::Sha512];
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha1 => write!(f, "sha1"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(format!(
                "unknown checksum algorithm '{}' (expected md5, sha1, sha256 or sha512)",
                other
            )),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Format as "algo:hex"
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Trait for computing checksums incrementally
pub trait ChecksumHasher: Send {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the checksum value
    fn finalize(self: Box<Self>) -> ChecksumValue;
}

/// MD5 hasher (backed by md5 crate)
struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let Md5Hasher { context } = *self;
        let digest = context.compute();
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

/// SHA-1 / SHA-2 family hashers share the RustCrypto `Digest` interface.
struct DigestHasher<D> {
    algorithm: ChecksumAlgorithm,
    hasher: D,
}

impl<D> ChecksumHasher for DigestHasher<D>
where
    D: sha2::Digest + Send,
{
    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.hasher, data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let DigestHasher { algorithm, hasher } = *self;
        let hex = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        ChecksumValue::new(algorithm, hex)
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha1 => Box::new(DigestHasher {
            algorithm,
            hasher: <sha1::Sha1 as sha2::Digest>::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(DigestHasher {
            algorithm,
            hasher: <sha2::Sha256 as sha2::Digest>::new(),
        }),
        ChecksumAlgorithm::Sha512 => Box::new(DigestHasher {
            algorithm,
            hasher: <sha2::Sha512 as sha2::Digest>::new(),
        }),
    }
}

/// Result of a hash that may be interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundedHash {
    /// The whole file was read
    Complete(ChecksumValue),
    /// The deadline passed before the last chunk was read
    DeadlineExceeded,
    /// The cancellation token fired
    Cancelled,
}

/// Compute checksum for a whole file.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, EngineError> {
    match hash_file_bounded(path, algorithm, None, None)? {
        BoundedHash::Complete(value) => Ok(value),
        // Neither a deadline nor a token was supplied.
        BoundedHash::DeadlineExceeded | BoundedHash::Cancelled => Err(EngineError::ReadError {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Interrupted, "hash interrupted"),
        }),
    }
}

/// Hash a file, checking `deadline` and `cancel` before every read.
///
/// The file is opened read-only; nothing about it is modified.
pub fn hash_file_bounded(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    deadline: Option<Instant>,
    cancel: Option<&CancelToken>,
) -> Result<BoundedHash, EngineError> {
    let read_error = |e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    };

    let mut file = File::open(path).map_err(read_error)?;
    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Ok(BoundedHash::Cancelled);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(BoundedHash::DeadlineExceeded);
        }
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e)),
        }
    }

    Ok(BoundedHash::Complete(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn digest_of(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
        let mut hasher = create_hasher(algorithm);
        hasher.update(data);
        hasher.finalize().hex().to_string()
    }

    #[test]
    fn test_algorithm_display_round_trips_through_from_str() {
        for algorithm in ChecksumAlgorithm::ALL {
            assert_eq!(algorithm.to_string().parse::<ChecksumAlgorithm>(), Ok(algorithm));
        }
        assert_eq!("SHA-256".parse::<ChecksumAlgorithm>(), Ok(ChecksumAlgorithm::Sha256));
        assert!("blake3".parse::<ChecksumAlgorithm>().is_err());
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(
            digest_of(ChecksumAlgorithm::Md5, b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            digest_of(ChecksumAlgorithm::Sha1, b"hello"),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(
            digest_of(ChecksumAlgorithm::Sha256, b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest_of(ChecksumAlgorithm::Sha512, b"hello").len(), 128);
    }

    #[test]
    fn test_incremental_updates_match_single_update() {
        let mut hasher = create_hasher(ChecksumAlgorithm::Sha512);
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(
            hasher.finalize().hex(),
            digest_of(ChecksumAlgorithm::Sha512, b"hello")
        );
    }

    #[test]
    fn test_checksum_value_display() {
        let cs = ChecksumValue::new(ChecksumAlgorithm::Sha1, "abc123".to_string());
        assert_eq!(cs.to_string(), "abc123");
        assert_eq!(cs.to_string_with_algo(), "sha1:abc123");
    }

    #[test]
    fn test_compute_file_checksum() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("clip.mov");
        std::fs::write(&path, b"hello").expect("Failed to write file");

        let value = compute_file_checksum(&path, ChecksumAlgorithm::Md5)
            .expect("Checksum should succeed");
        assert_eq!(value.hex(), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(value.algorithm(), ChecksumAlgorithm::Md5);
    }

    #[test]
    fn test_compute_file_checksum_missing_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = compute_file_checksum(&temp_dir.path().join("absent"), ChecksumAlgorithm::Md5);
        assert!(matches!(result, Err(EngineError::ReadError { .. })));
    }

    #[test]
    fn test_bounded_hash_honours_expired_deadline() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("clip.mov");
        std::fs::write(&path, vec![7u8; 4096]).expect("Failed to write file");

        let past = Instant::now() - Duration::from_millis(1);
        let outcome = hash_file_bounded(&path, ChecksumAlgorithm::Sha256, Some(past), None)
            .expect("Hash should not error");
        assert_eq!(outcome, BoundedHash::DeadlineExceeded);
    }

    #[test]
    fn test_bounded_hash_honours_cancellation() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("clip.mov");
        std::fs::write(&path, b"frames").expect("Failed to write file");

        let token = CancelToken::new();
        token.cancel();
        let outcome = hash_file_bounded(&path, ChecksumAlgorithm::Sha256, None, Some(&token))
            .expect("Hash should not error");
        assert_eq!(outcome, BoundedHash::Cancelled);
    }
}
