//! Sender side of an asset bundle transfer.

use navi_wire::RpcCall;

use crate::{DEFAULT_CHUNK_SIZE, MAX_BUNDLE_SIZE, MAX_SEND_ATTEMPTS, TransferError, bundle_digest};

/// Where an upload is in its call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStep {
    Start,
    Chunk { offset: usize },
    Complete,
    Done,
}

/// Chunked upload of one bundle.
///
/// The owner sends [`current_call`](Self::current_call) and calls
/// [`advance`](Self::advance) only once the transport accepted it. On a
/// transient send failure it calls
/// [`record_failure`](Self::record_failure) and retries the same step on a
/// later tick.
#[derive(Debug, Clone)]
pub struct AssetUpload {
    bytes: Vec<u8>,
    chunk_size: usize,
    digest: String,
    step: UploadStep,
    bytes_sent: usize,
    failed_attempts: u32,
}

impl AssetUpload {
    pub fn new(bytes: Vec<u8>, chunk_size: usize) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        if bytes.len() > MAX_BUNDLE_SIZE {
            return Err(TransferError::ResourceExhaustion {
                requested: bytes.len(),
                limit: MAX_BUNDLE_SIZE,
            });
        }
        let digest = bundle_digest(&bytes);
        Ok(Self {
            bytes,
            chunk_size,
            digest,
            step: UploadStep::Start,
            bytes_sent: 0,
            failed_attempts: 0,
        })
    }

    /// Upload with [`DEFAULT_CHUNK_SIZE`].
    pub fn with_default_chunks(bytes: Vec<u8>) -> Result<Self, TransferError> {
        Self::new(bytes, DEFAULT_CHUNK_SIZE)
    }

    pub fn step(&self) -> UploadStep {
        self.step
    }

    /// The call for the current step, `None` once done.
    pub fn current_call(&self) -> Option<RpcCall> {
        // Lengths are bounded by MAX_BUNDLE_SIZE, which fits in i32.
        match self.step {
            UploadStep::Start => Some(RpcCall::asset_start(self.bytes.len() as i32)),
            UploadStep::Chunk { offset } => {
                let end = (offset + self.chunk_size).min(self.bytes.len());
                Some(RpcCall::asset_chunk(
                    offset as i32,
                    self.bytes[offset..end].to_vec(),
                ))
            }
            UploadStep::Complete => Some(RpcCall::asset_complete(self.digest.clone())),
            UploadStep::Done => None,
        }
    }

    /// Move past the current step after a successful send.
    pub fn advance(&mut self) {
        self.failed_attempts = 0;
        self.step = match self.step {
            UploadStep::Start if self.bytes.is_empty() => UploadStep::Complete,
            UploadStep::Start => UploadStep::Chunk { offset: 0 },
            UploadStep::Chunk { offset } => {
                let end = (offset + self.chunk_size).min(self.bytes.len());
                self.bytes_sent = end;
                if end >= self.bytes.len() {
                    UploadStep::Complete
                } else {
                    UploadStep::Chunk { offset: end }
                }
            }
            UploadStep::Complete | UploadStep::Done => UploadStep::Done,
        };
    }

    /// Note a transient failure of the current step.
    ///
    /// Returns `false` once [`MAX_SEND_ATTEMPTS`] is reached and the upload
    /// should be abandoned.
    pub fn record_failure(&mut self) -> bool {
        self.failed_attempts += 1;
        self.failed_attempts < MAX_SEND_ATTEMPTS
    }

    pub fn is_done(&self) -> bool {
        self.step == UploadStep::Done
    }

    pub fn total_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Fraction of bundle bytes sent, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        if self.bytes.is_empty() {
            return if self.is_done() { 1.0 } else { 0.0 };
        }
        self.bytes_sent as f32 / self.bytes.len() as f32
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}
