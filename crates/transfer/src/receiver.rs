//! Receiver side of an asset bundle transfer.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{AssetBundle, MAX_BUNDLE_SIZE, TransferError, bundle_digest};

#[derive(Debug)]
struct Incoming {
    buffer: Vec<u8>,
    /// Written ranges, offset → length.
    ranges: BTreeMap<usize, usize>,
}

impl Incoming {
    /// Bytes covered by contiguous ranges from offset 0.
    fn covered_prefix(&self) -> usize {
        let mut cursor = 0;
        for (&offset, &len) in &self.ranges {
            if offset > cursor {
                break;
            }
            cursor = cursor.max(offset + len);
        }
        cursor
    }
}

/// Assembles one bundle at a time.
///
/// Chunks may arrive at any offset. Nothing is exposed until
/// [`complete`](Self::complete) has verified full coverage and the digest.
#[derive(Debug)]
pub struct AssetReceiver {
    incoming: Option<Incoming>,
    max_size: usize,
}

impl Default for AssetReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetReceiver {
    pub fn new() -> Self {
        Self::with_limit(MAX_BUNDLE_SIZE)
    }

    pub fn with_limit(max_size: usize) -> Self {
        Self {
            incoming: None,
            max_size,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.incoming.is_some()
    }

    /// Bytes received so far for the bundle in progress.
    pub fn received(&self) -> usize {
        self.incoming.as_ref().map_or(0, Incoming::covered_prefix)
    }

    /// Pre-allocate a buffer of `total` bytes. Replaces any transfer in progress.
    pub fn start(&mut self, total: usize) -> Result<(), TransferError> {
        if self.incoming.take().is_some() {
            debug!("asset transfer restarted, previous buffer discarded");
        }
        if total > self.max_size {
            return Err(TransferError::ResourceExhaustion {
                requested: total,
                limit: self.max_size,
            });
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(total)
            .map_err(|_| TransferError::ResourceExhaustion {
                requested: total,
                limit: self.max_size,
            })?;
        buffer.resize(total, 0);
        self.incoming = Some(Incoming {
            buffer,
            ranges: BTreeMap::new(),
        });
        Ok(())
    }

    /// Copy `bytes` into `buffer[offset..offset + len]`.
    pub fn chunk(&mut self, offset: usize, bytes: &[u8]) -> Result<(), TransferError> {
        let incoming = self.incoming.as_mut().ok_or(TransferError::NotStarted)?;
        let total = incoming.buffer.len();
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= total)
            .ok_or(TransferError::OutOfBounds {
                offset,
                len: bytes.len(),
                total,
            })?;
        incoming.buffer[offset..end].copy_from_slice(bytes);
        let len = incoming.ranges.entry(offset).or_insert(0);
        *len = (*len).max(bytes.len());
        Ok(())
    }

    /// Finish the transfer. The buffer is released whether or not it verifies.
    pub fn complete(&mut self, expected_sha256: &str) -> Result<AssetBundle, TransferError> {
        let incoming = self.incoming.take().ok_or(TransferError::NotStarted)?;
        let total = incoming.buffer.len();
        let received = incoming.covered_prefix();
        if received < total {
            return Err(TransferError::Incomplete { received, total });
        }

        let actual = bundle_digest(&incoming.buffer);
        if !actual.eq_ignore_ascii_case(expected_sha256) {
            return Err(TransferError::DigestMismatch {
                expected: expected_sha256.to_string(),
                actual,
            });
        }
        Ok(AssetBundle::from_bytes(incoming.buffer))
    }

    /// Drop any partial buffer.
    pub fn abort(&mut self) {
        if self.incoming.take().is_some() {
            debug!("asset transfer aborted, partial buffer discarded");
        }
    }
}
