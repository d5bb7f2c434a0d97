//! Persistent key store abstraction and the journal-like memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::record::PSKEY_MAX_WORDS;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("No space: need {needed} words, {available} free")]
    NoSpace { needed: usize, available: usize },

    #[error("Key 0x{key:04X} holds at most {max}, got {actual}")]
    TooLong { key: u16, max: usize, actual: usize },
}

/// Word-addressed persistent key/value storage.
pub trait KeyStore: Send {
    /// Stored words, empty if the key was never written.
    fn retrieve(&self, key: u16) -> Vec<u16>;

    fn store(&mut self, key: u16, words: &[u16]) -> Result<(), StoreError>;

    /// Words available before the store needs a flood.
    fn free_words(&self) -> usize;

    /// Reclaim space held by superseded copies.
    fn flood(&mut self);
}

#[derive(Debug, Default)]
struct KeyStoreState {
    keys: HashMap<u16, Vec<u16>>,
    capacity: usize,
    /// Words consumed by live and superseded copies.
    used: usize,
    /// Words held by superseded copies.
    garbage: usize,
    writes: u64,
    floods: u64,
}

/// Journal-like store: every write appends, a flood compacts.
///
/// Cloning shares the same storage, so a simulated reboot keeps the keys.
#[derive(Debug, Clone)]
pub struct MemoryKeyStore {
    inner: Arc<Mutex<KeyStoreState>>,
}

impl MemoryKeyStore {
    pub fn new(capacity_words: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(KeyStoreState {
                capacity: capacity_words,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, KeyStoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total successful writes.
    pub fn write_count(&self) -> u64 {
        self.state().writes
    }

    pub fn flood_count(&self) -> u64 {
        self.state().floods
    }

    /// Consume free space, as other firmware components writing keys would.
    pub fn consume(&self, words: usize) {
        let mut state = self.state();
        state.used = (state.used + words).min(state.capacity);
        state.garbage = (state.garbage + words).min(state.used);
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl KeyStore for MemoryKeyStore {
    fn retrieve(&self, key: u16) -> Vec<u16> {
        self.state().keys.get(&key).cloned().unwrap_or_default()
    }

    fn store(&mut self, key: u16, words: &[u16]) -> Result<(), StoreError> {
        if words.len() > PSKEY_MAX_WORDS {
            return Err(StoreError::TooLong {
                key,
                max: PSKEY_MAX_WORDS,
                actual: words.len(),
            });
        }
        let mut state = self.state();
        let available = state.capacity - state.used;
        if words.len() > available {
            return Err(StoreError::NoSpace {
                needed: words.len(),
                available,
            });
        }
        if let Some(previous) = state.keys.insert(key, words.to_vec()) {
            state.garbage += previous.len();
        }
        state.used += words.len();
        state.writes += 1;
        Ok(())
    }

    fn free_words(&self) -> usize {
        let state = self.state();
        state.capacity - state.used
    }

    fn flood(&mut self) {
        let mut state = self.state();
        state.used -= state.garbage;
        state.garbage = 0;
        state.floods += 1;
        tracing::info!(free = state.capacity - state.used, "Key store flooded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_empty() {
        let store = MemoryKeyStore::new(64);
        assert!(store.retrieve(7).is_empty());
    }

    #[test]
    fn test_writes_consume_space_until_flood() {
        let mut store = MemoryKeyStore::new(40);
        store.store(1, &[0; 16]).unwrap();
        store.store(1, &[1; 16]).unwrap();
        assert_eq!(store.free_words(), 8);
        assert_eq!(
            store.store(1, &[2; 16]),
            Err(StoreError::NoSpace {
                needed: 16,
                available: 8
            })
        );
        store.flood();
        assert_eq!(store.free_words(), 24);
        store.store(1, &[2; 16]).unwrap();
        assert_eq!(store.retrieve(1), vec![2; 16]);
    }

    #[test]
    fn test_clone_shares_storage() {
        let mut store = MemoryKeyStore::new(64);
        let view = store.clone();
        store.store(3, &[9, 8]).unwrap();
        assert_eq!(view.retrieve(3), vec![9, 8]);
        assert_eq!(view.write_count(), 1);
    }

    #[test]
    fn test_key_length_limit() {
        let mut store = MemoryKeyStore::new(1024);
        assert!(matches!(
            store.store(1, &[0; 33]),
            Err(StoreError::TooLong { .. })
        ));
    }
}
