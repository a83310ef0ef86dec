//! C4: `KeyStore` — durable store for key records.
//!
//! The in-memory implementation here stands in for database engine
//! choice: a real deployment swaps this trait for a SQL-backed store
//! without touching any caller, since every mutating operation is
//! expressed as an atomic, store-local operation.

use crate::model::{KeyId, KeyRecord, KeyStatus, SaeId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key {0} already exists")]
    Conflict(KeyId),
    #[error("store I/O error: {0}")]
    Io(String),
}

pub struct GetManyResult {
    pub found: Vec<KeyRecord>,
    pub missing: Vec<KeyId>,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn insert(&self, record: KeyRecord) -> Result<(), KeyStoreError>;

    async fn get(&self, key_id: KeyId) -> Result<Option<KeyRecord>, KeyStoreError>;

    async fn get_many(&self, ids: &[KeyId]) -> Result<GetManyResult, KeyStoreError>;

    /// Atomic compare-and-set. Returns `false` (no error) if the current
    /// status is not `expected_status` — callers use this to detect
    /// contention, not as an error path.
    async fn update_status(
        &self,
        key_id: KeyId,
        expected_status: KeyStatus,
        new_status: KeyStatus,
    ) -> Result<bool, KeyStoreError>;

    /// Atomically claims an `available` record for a *new* reservation:
    /// CASes `status` from `available` to `reserved` and, in the same
    /// step, overwrites `master_sae_id`/`slave_sae_ids` with the new
    /// reservation's SAE tuple. A record reused from a prior, aborted
    /// reservation must never keep that reservation's binding — an
    /// `update_status`-only CAS would leave the old master/slave pair in
    /// place. Returns `false` (no error) if the record is no longer
    /// `available` when this runs.
    async fn claim_for_reservation(
        &self,
        key_id: KeyId,
        master_sae_id: &str,
        slave_sae_ids: &BTreeSet<SaeId>,
    ) -> Result<bool, KeyStoreError>;

    async fn count_available(
        &self,
        source_kme_id: &str,
        target_kme_id: &str,
    ) -> Result<usize, KeyStoreError>;

    /// Total number of records held, regardless of status — used by
    /// `KeyPool` admission control against `max_key_count`.
    async fn total_count(&self) -> Result<usize, KeyStoreError>;

    /// Up to `limit` key IDs currently `available` for the given link, in
    /// no particular order. `KeyPool` CASes each candidate individually, so
    /// returning a stale or already-claimed ID is harmless — it is simply
    /// skipped by the caller's CAS loop.
    async fn find_available(
        &self,
        size_bits: u32,
        source_kme_id: &str,
        target_kme_id: &str,
        limit: u32,
    ) -> Result<Vec<KeyId>, KeyStoreError>;

    /// Snapshot of every record whose status is `available` or
    /// `delivered_master`/`delivered_slave` and whose `expires_at` is in
    /// the past — used by the background expiry sweeper.
    async fn find_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<KeyId>, KeyStoreError>;
}

/// Reference in-memory `KeyStore`. Each row is protected individually by
/// `dashmap`'s per-shard locking, so `update_status` below is a genuine
/// compare-and-swap without a store-wide lock.
#[derive(Default)]
pub struct InMemoryKeyStore {
    records: DashMap<KeyId, KeyRecord>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn insert(&self, record: KeyRecord) -> Result<(), KeyStoreError> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(record.key_id) {
            Entry::Occupied(_) => Err(KeyStoreError::Conflict(record.key_id)),
            Entry::Vacant(v) => {
                v.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, key_id: KeyId) -> Result<Option<KeyRecord>, KeyStoreError> {
        Ok(self.records.get(&key_id).map(|r| r.value().clone()))
    }

    async fn get_many(&self, ids: &[KeyId]) -> Result<GetManyResult, KeyStoreError> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.records.get(id) {
                Some(r) => found.push(r.value().clone()),
                None => missing.push(*id),
            }
        }
        Ok(GetManyResult { found, missing })
    }

    async fn update_status(
        &self,
        key_id: KeyId,
        expected_status: KeyStatus,
        new_status: KeyStatus,
    ) -> Result<bool, KeyStoreError> {
        match self.records.get_mut(&key_id) {
            Some(mut entry) => {
                if entry.status == expected_status {
                    entry.status = new_status;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Ok(false),
        }
    }

    async fn claim_for_reservation(
        &self,
        key_id: KeyId,
        master_sae_id: &str,
        slave_sae_ids: &BTreeSet<SaeId>,
    ) -> Result<bool, KeyStoreError> {
        match self.records.get_mut(&key_id) {
            Some(mut entry) => {
                if entry.status == KeyStatus::Available {
                    entry.status = KeyStatus::Reserved;
                    entry.master_sae_id = master_sae_id.to_string();
                    entry.slave_sae_ids = slave_sae_ids.clone();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Ok(false),
        }
    }

    async fn count_available(
        &self,
        source_kme_id: &str,
        target_kme_id: &str,
    ) -> Result<usize, KeyStoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| {
                r.status == KeyStatus::Available
                    && r.source_kme_id == source_kme_id
                    && r.target_kme_id == target_kme_id
            })
            .count())
    }

    async fn total_count(&self) -> Result<usize, KeyStoreError> {
        Ok(self.records.len())
    }

    async fn find_available(
        &self,
        size_bits: u32,
        source_kme_id: &str,
        target_kme_id: &str,
        limit: u32,
    ) -> Result<Vec<KeyId>, KeyStoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| {
                r.status == KeyStatus::Available
                    && r.size_bits == size_bits
                    && r.source_kme_id == source_kme_id
                    && r.target_kme_id == target_kme_id
            })
            .take(limit as usize)
            .map(|r| r.key_id)
            .collect())
    }

    async fn find_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<KeyId>, KeyStoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.status.is_live() && r.expires_at.is_some_and(|exp| exp <= now))
            .map(|r| r.key_id)
            .collect())
    }
}
