//! Persisted copy of every non-payload byte of the upgrade file.
//!
//! The peer relay rebuilds the file from this log plus the written
//! partitions, so it survives a reboot of the primary.

use super::keystore::{KeyStore, StoreError};
use super::record::PSKEY_MAX_WORDS;

/// Key holding the log length.
pub const HEADER_LOG_LENGTH_KEY: u16 = 0x0010;

/// First key holding log data.
pub const HEADER_LOG_DATA_KEY: u16 = 0x0011;

pub const HEADER_LOG_DATA_KEYS: usize = 15;

const BYTES_PER_KEY: usize = PSKEY_MAX_WORDS * 2;

pub const HEADER_LOG_MAX_BYTES: usize = HEADER_LOG_DATA_KEYS * BYTES_PER_KEY;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderLog {
    bytes: Vec<u8>,
}

impl HeaderLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the persisted log; an unwritten log is empty.
    pub fn load<K: KeyStore>(keys: &K) -> Self {
        let length_words = keys.retrieve(HEADER_LOG_LENGTH_KEY);
        let length = match length_words.as_slice() {
            [lo, hi, ..] => (u32::from(*lo) | (u32::from(*hi) << 16)) as usize,
            _ => 0,
        };
        let length = length.min(HEADER_LOG_MAX_BYTES);

        let mut bytes = Vec::with_capacity(length);
        let mut key = HEADER_LOG_DATA_KEY;
        while bytes.len() < length {
            let words = keys.retrieve(key);
            if words.is_empty() {
                tracing::warn!(key, "Header log key missing");
                break;
            }
            for word in words {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
            key += 1;
        }
        bytes.truncate(length);
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Start a new log.
    pub fn reset<K: KeyStore>(&mut self, keys: &mut K) -> Result<(), StoreError> {
        self.bytes.clear();
        keys.store(HEADER_LOG_LENGTH_KEY, &[0, 0])
    }

    /// Append bytes and persist the keys they touched.
    pub fn append<K: KeyStore>(&mut self, keys: &mut K, data: &[u8]) -> Result<(), StoreError> {
        if self.bytes.len() + data.len() > HEADER_LOG_MAX_BYTES {
            return Err(StoreError::TooLong {
                key: HEADER_LOG_DATA_KEY,
                max: HEADER_LOG_MAX_BYTES,
                actual: self.bytes.len() + data.len(),
            });
        }
        let first_key = self.bytes.len() / BYTES_PER_KEY;
        self.bytes.extend_from_slice(data);

        for (index, chunk) in self.bytes.chunks(BYTES_PER_KEY).enumerate().skip(first_key) {
            let words: Vec<u16> = chunk
                .chunks(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
                .collect();
            keys.store(HEADER_LOG_DATA_KEY + index as u16, &words)?;
        }
        let length = self.bytes.len() as u32;
        keys.store(HEADER_LOG_LENGTH_KEY, &[length as u16, (length >> 16) as u16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyStore;

    #[test]
    fn test_append_and_load() {
        let mut keys = MemoryKeyStore::new(4096);
        let mut log = HeaderLog::new();
        log.reset(&mut keys).unwrap();
        log.append(&mut keys, &[1, 2, 3]).unwrap();
        log.append(&mut keys, &[0xAA; 100]).unwrap();

        let loaded = HeaderLog::load(&keys);
        assert_eq!(loaded.len(), 103);
        assert_eq!(&loaded.bytes()[..3], &[1, 2, 3]);
        assert_eq!(loaded, log);
    }

    #[test]
    fn test_reset_truncates_persisted_log() {
        let mut keys = MemoryKeyStore::new(4096);
        let mut log = HeaderLog::new();
        log.append(&mut keys, &[5; 10]).unwrap();
        log.reset(&mut keys).unwrap();
        assert!(HeaderLog::load(&keys).is_empty());
    }

    #[test]
    fn test_log_capacity() {
        let mut keys = MemoryKeyStore::new(8192);
        let mut log = HeaderLog::new();
        assert!(log.append(&mut keys, &vec![0; HEADER_LOG_MAX_BYTES]).is_ok());
        assert!(matches!(
            log.append(&mut keys, &[0]),
            Err(StoreError::TooLong { .. })
        ));
    }
}
