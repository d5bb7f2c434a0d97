//! Validation accumulator: SHA-256 over every file byte ahead of the footer.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::file::DIGEST_SIZE;
use crate::partition::{PartitionError, PartitionIo};

/// Bytes read back per flash read during replay.
pub const REPLAY_CHUNK_SIZE: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("Partition {physical} ended at {offset} during replay")]
    ShortRead { physical: u16, offset: u32 },
}

/// SHA-256 of a complete byte slice.
pub fn file_digest(data: &[u8]) -> [u8; DIGEST_SIZE] {
    Sha256::digest(data).into()
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    hasher: Sha256,
    bytes_hashed: u64,
    last_digest: Option<[u8; DIGEST_SIZE]>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self) {
        self.hasher = Sha256::new();
        self.bytes_hashed = 0;
    }

    pub fn update(&mut self, data: &[u8]) -> bool {
        self.hasher.update(data);
        self.bytes_hashed += data.len() as u64;
        true
    }

    /// Compare the digest so far with the one carried in the footer.
    pub fn finalize(&mut self, signature: &[u8]) -> bool {
        let digest: [u8; DIGEST_SIZE] = self.hasher.finalize_reset().into();
        self.last_digest = Some(digest);
        let ok = signature.len() >= DIGEST_SIZE && signature[..DIGEST_SIZE] == digest;
        if ok {
            tracing::info!(digest = %hex::encode(digest), bytes = self.bytes_hashed, "Digest verified");
        } else {
            tracing::warn!(
                computed = %hex::encode(digest),
                expected = %hex::encode(&signature[..signature.len().min(DIGEST_SIZE)]),
                "Digest mismatch"
            );
        }
        self.bytes_hashed = 0;
        ok
    }

    /// Hash already-written partition bytes back into the accumulator.
    pub fn replay<F: PartitionIo>(
        &mut self,
        io: &F,
        physical: u16,
        skip: u32,
        len: u32,
    ) -> Result<u32, ValidationError> {
        let mut buf = [0u8; REPLAY_CHUNK_SIZE];
        let mut offset = skip;
        let end = skip + len;
        while offset < end {
            let want = ((end - offset) as usize).min(REPLAY_CHUNK_SIZE);
            let got = io.read(physical, offset, &mut buf[..want])?;
            if got == 0 {
                return Err(ValidationError::ShortRead { physical, offset });
            }
            self.update(&buf[..got]);
            offset += got as u32;
        }
        tracing::debug!(physical, replayed = len, "Partition replayed into digest");
        Ok(len)
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Digest of the last finalize, for diagnostics.
    pub fn last_digest(&self) -> Option<[u8; DIGEST_SIZE]> {
        self.last_digest
    }

    pub fn digest_hex(&self) -> String {
        self.last_digest.map(hex::encode).unwrap_or_default()
    }
}
