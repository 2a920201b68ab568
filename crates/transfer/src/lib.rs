//! Navi Asset Transfer
//!
//! Asset bundles are pushed from the host to a controller over the
//! reliable-fragmented channel as a short RPC sequence:
//!
//! ```text
//! AssetStart(total) → AssetChunk(offset, bytes) × ⌈total / chunk⌉ → AssetComplete(sha256)
//! ```
//!
//! # Architecture
//!
//! - [`AssetUpload`]: sender side, yields the next call and advances only
//!   after the transport accepted it
//! - [`AssetReceiver`]: receiver side, pre-allocates and fills the buffer,
//!   verifies the fingerprint on completion
//! - [`AssetBundle`]: a verified bundle, plus file I/O for persisting it

#![deny(unsafe_code)]

mod receiver;
mod upload;

pub use receiver::AssetReceiver;
pub use upload::{AssetUpload, UploadStep};

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use navi_wire::AssetBundleFile;
use prost::Message;
use sha2::{Digest, Sha256};

// ============================================================================
// Constants
// ============================================================================

/// Default bytes per `AssetChunk`.
pub const DEFAULT_CHUNK_SIZE: usize = 20_000;

/// Largest bundle either side will handle. Also keeps offsets within `i32`.
pub const MAX_BUNDLE_SIZE: usize = 64 * 1024 * 1024;

/// Ticks a single step may fail transiently before the upload is abandoned.
pub const MAX_SEND_ATTEMPTS: u32 = 300;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("no transfer in progress")]
    NotStarted,

    #[error("chunk [{offset}, {offset}+{len}) outside bundle of {total} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        total: usize,
    },

    #[error("bundle incomplete: {received} of {total} bytes received")]
    Incomplete { received: usize, total: usize },

    #[error("bundle digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("cannot allocate {requested} bytes for bundle (limit {limit})")]
    ResourceExhaustion { requested: usize, limit: usize },

    #[error("chunk size must be non-zero")]
    InvalidChunkSize,
}

// ============================================================================
// Bundle
// ============================================================================

/// Lowercase hex SHA-256 of `bytes`.
pub fn bundle_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// A complete, fingerprint-verified asset bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBundle {
    bytes: Vec<u8>,
    sha256: String,
}

impl AssetBundle {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let sha256 = bundle_digest(&bytes);
        Self { bytes, sha256 }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// Bundle I/O
// ============================================================================

/// Write a bundle to a file. Refuses to overwrite an existing file.
pub fn write_bundle(bundle: &AssetBundle, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Asset bundle already exists at {}", path.display()),
            ),
            _ => e,
        })?;

    let record = AssetBundleFile {
        sha256: bundle.sha256.clone(),
        data: bundle.bytes.clone(),
    };
    file.write_all(&record.encode_to_vec())?;

    Ok(())
}

/// Read a bundle back, re-checking its fingerprint.
pub fn read_bundle(path: &Path) -> io::Result<AssetBundle> {
    let data = fs::read(path)?;
    let record = AssetBundleFile::decode(data.as_slice()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to decode asset bundle: {e}"),
        )
    })?;
    let bundle = AssetBundle::from_bytes(record.data);
    if !bundle.sha256.eq_ignore_ascii_case(&record.sha256) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            TransferError::DigestMismatch {
                expected: record.sha256,
                actual: bundle.sha256,
            },
        ));
    }
    Ok(bundle)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use navi_wire::method;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Push every call of an upload through a receiver.
    fn transfer(bytes: &[u8], chunk_size: usize) -> Result<AssetBundle, TransferError> {
        let mut upload = AssetUpload::new(bytes.to_vec(), chunk_size)?;
        let mut receiver = AssetReceiver::new();
        let mut result = None;
        while let Some(call) = upload.current_call() {
            match call.method.as_str() {
                method::ASSET_START => receiver.start(call.index(0).unwrap())?,
                method::ASSET_CHUNK => {
                    receiver.chunk(call.index(0).unwrap(), call.blob(1).unwrap())?
                }
                method::ASSET_COMPLETE => result = Some(receiver.complete(call.str(0).unwrap())),
                other => panic!("unexpected method {other}"),
            }
            upload.advance();
        }
        result.unwrap()
    }

    #[test]
    fn test_digest_is_lowercase_hex() {
        let digest = bundle_digest(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_transfer_reconstructs_for_all_shapes() {
        // N < C, N == C, N divisible by C, N not divisible by C, N == 0
        for (n, c) in [(5, 20), (20, 20), (60, 20), (61, 20), (0, 20), (1, 1)] {
            let bytes = pattern(n);
            let bundle = transfer(&bytes, c).unwrap();
            assert_eq!(bundle.bytes(), bytes.as_slice(), "n={n} c={c}");
        }
    }

    #[test]
    fn test_transfer_default_chunk_size() {
        let bytes = pattern(DEFAULT_CHUNK_SIZE * 2 + 17);
        let bundle = transfer(&bytes, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(bundle.len(), bytes.len());
        assert_eq!(bundle.sha256(), bundle_digest(&bytes));
    }

    #[test]
    fn test_receiver_rejects_wrong_digest() {
        let mut receiver = AssetReceiver::new();
        receiver.start(3).unwrap();
        receiver.chunk(0, &[1, 2, 3]).unwrap();
        let err = receiver.complete(&bundle_digest(b"other")).unwrap_err();
        assert!(matches!(err, TransferError::DigestMismatch { .. }));
        assert!(!receiver.is_receiving());
    }

    #[test]
    fn test_bundle_file_roundtrip_and_no_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundles").join("scene.bundle");
        let bundle = AssetBundle::from_bytes(pattern(1000));

        write_bundle(&bundle, &path).unwrap();
        assert_eq!(read_bundle(&path).unwrap(), bundle);

        let err = write_bundle(&bundle, &path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(err.to_string().contains("scene.bundle"));
    }

    #[test]
    fn test_write_bundle_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.bundle");
        fs::write(&path, b"not a bundle").unwrap();

        let bundle = AssetBundle::from_bytes(pattern(64));
        let err = write_bundle(&bundle, &path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&path).unwrap(), b"not a bundle");
    }

    #[test]
    fn test_read_bundle_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bundle");
        let record = AssetBundleFile {
            sha256: bundle_digest(b"expected"),
            data: b"tampered".to_vec(),
        };
        fs::write(&path, record.encode_to_vec()).unwrap();

        let err = read_bundle(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
