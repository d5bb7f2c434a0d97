//! Resume store: the persisted upgrade records and their save discipline.

use tracing::{debug, info};

use super::keystore::{KeyStore, StoreError};
use super::record::*;
use crate::file::Version;
use crate::partition::PartitionTable;

/// Owns the key store and the in-memory copy of both records.
///
/// Records are read once when the store is loaded; every change reaches
/// flash only through [`ResumeStore::save`].
#[derive(Debug)]
pub struct ResumeStore<K: KeyStore> {
    keys: K,
    record: ResumeRecord,
    peer: PeerRecord,
}

impl<K: KeyStore> ResumeStore<K> {
    pub fn load(keys: K) -> Self {
        let mut store = Self {
            keys,
            record: ResumeRecord::default(),
            peer: PeerRecord::default(),
        };
        store.reload();
        store
    }

    /// Re-read both records, discarding unsaved changes.
    pub fn reload(&mut self) {
        let words = self.keys.retrieve(UPGRADE_CONTEXT_KEY);
        let section = |offset: usize| words.get(offset..).unwrap_or(&[]);
        self.record = ResumeRecord::from_words(section(RESUME_RECORD_OFFSET));
        self.peer = PeerRecord::from_words(section(PEER_RECORD_OFFSET));
        debug!(
            resume_point = %self.record.resume_point,
            upgrade_id = self.record.upgrade_id,
            "Resume record loaded"
        );
    }

    pub fn record(&self) -> &ResumeRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut ResumeRecord {
        &mut self.record
    }

    pub fn peer_record(&self) -> &PeerRecord {
        &self.peer
    }

    pub fn peer_record_mut(&mut self) -> &mut PeerRecord {
        &mut self.peer
    }

    pub fn keys(&self) -> &K {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut K {
        &mut self.keys
    }

    /// Give the key store back, dropping the cached records.
    pub fn into_keys(self) -> K {
        self.keys
    }

    /// Write both records as one key.
    pub fn save(&mut self) -> Result<(), StoreError> {
        let mut words = [0u16; PSKEY_MAX_WORDS];
        words[RESUME_RECORD_OFFSET..RESUME_RECORD_OFFSET + RESUME_RECORD_WORDS]
            .copy_from_slice(&self.record.to_words());
        words[PEER_RECORD_OFFSET..PEER_RECORD_OFFSET + PEER_RECORD_WORDS]
            .copy_from_slice(&self.peer.to_words());
        self.keys.store(UPGRADE_CONTEXT_KEY, &words)
    }

    pub fn free_words(&self) -> usize {
        self.keys.free_words()
    }

    /// Whether a full record save currently fits.
    pub fn has_space_for_save(&self) -> bool {
        self.keys.free_words() >= PSKEY_MAX_WORDS
    }

    pub fn set_resume_point(&mut self, point: ResumePoint) -> Result<(), StoreError> {
        info!(from = %self.record.resume_point, to = %point, "Resume point saved");
        self.record.resume_point = point;
        self.save()
    }

    /// Record the factory image on first boot.
    pub fn init_factory(&mut self, version: Version, config_version: u16) -> Result<(), StoreError> {
        if self.record.active_version != Version::default() || self.record.upgrade_id != 0 {
            return Ok(());
        }
        info!(%version, config_version, "First boot, recording factory version");
        self.record.active_version = version;
        self.record.active_config_version = config_version;
        self.save()
    }

    /// Boot the new image on trial before it is committed.
    pub fn set_to_try_upgrades(&mut self) -> Result<(), StoreError> {
        self.record.trial_active = true;
        self.save()
    }

    /// Make the trial image permanent: swap the written banks in.
    pub fn commit_upgrades(&mut self, table: &PartitionTable) -> Result<(), StoreError> {
        let record = &mut self.record;
        record.partition_bitmap = table.committed_bitmap(record.partition_bitmap, record.pending_bitmap);
        record.pending_bitmap = 0;
        record.trial_active = false;
        info!(bitmap = record.partition_bitmap, "Upgrades committed");
        self.save()
    }

    /// Fall back to the previous image on the next boot.
    pub fn revert_upgrades(&mut self) -> Result<(), StoreError> {
        self.record.trial_active = false;
        info!("Upgrades reverted");
        self.save()
    }

    pub fn is_running_new_image(&self) -> bool {
        self.record.trial_active
    }

    /// Clear every in-progress field ahead of an erase. Does not save.
    pub fn reset_for_erase(&mut self) {
        let record = &mut self.record;
        record.partitions_state = PartitionsState::Erased;
        record.in_progress_version = Version::default();
        record.in_progress_config_version = 0;
        record.upgrade_id = 0;
        record.resume_point = ResumePoint::Start;
        record.last_closed_partition = 0;
        record.dfu_partition_number = 0;
        record.pending_bitmap = 0;
    }

    pub fn flood(&mut self) {
        self.keys.flood();
    }
}
