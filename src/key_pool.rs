//! C5: `KeyPool` — the hardest component. Mediates every concurrent
//! request touching key material.
//!
//! Allocation never holds a pool-wide lock across a `KeySource` fetch:
//! the selection/CAS phase is the only critical section, and it is
//! expressed as per-key compare-and-swap on the `KeyStore` rather than
//! a single process-wide mutex, to keep concurrent requests from
//! serializing behind a generation call to the source.

use crate::crypto_random::CryptoRandom;
use crate::error::KmeError;
use crate::key_source::KeySource;
use crate::key_store::{KeyStore, KeyStoreError};
use crate::model::{KeyGenerationMetrics, KeyId, KeyRecord, KeyStatus, SaeId};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

impl From<KeyStoreError> for KmeError {
    fn from(e: KeyStoreError) -> Self {
        KmeError::Internal(e.to_string())
    }
}

/// Pool-wide bounds, taken from configuration.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    pub min_key_size: u32,
    pub max_key_size: u32,
    pub max_key_per_request: u32,
    pub max_key_count: usize,
    pub max_sae_id_count: u32,
    pub default_key_size: u32,
}

/// A transient binding of a set of reserved keys to a pending master
/// request. Dropped (via `abort`) on any failure path between reservation
/// and commit.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: Uuid,
    pub key_ids: Vec<KeyId>,
    pub master_sae_id: SaeId,
    pub slave_sae_ids: BTreeSet<SaeId>,
    pub size_bits: u32,
    pub source_kme_id: String,
    pub target_kme_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub stored_key_count: usize,
}

pub struct KeyPool {
    store: Arc<dyn KeyStore>,
    source: Arc<dyn KeySource>,
    limits: PoolLimits,
    kme_id: String,
    /// Serializes the *selection* phase only. Never held across
    /// `KeySource::fetch` or any `KeyStore` I/O beyond the CAS loop itself.
    selection_lock: AsyncMutex<()>,
    generated_counter: AtomicUsize,
    bytes_generated_total: AtomicU64,
    last_generated_at: SyncMutex<Option<chrono::DateTime<Utc>>>,
    generation_errors_total: AtomicUsize,
    rng: CryptoRandom,
}

impl KeyPool {
    pub fn new(
        store: Arc<dyn KeyStore>,
        source: Arc<dyn KeySource>,
        limits: PoolLimits,
        kme_id: String,
    ) -> Self {
        Self {
            store,
            source,
            limits,
            kme_id,
            selection_lock: AsyncMutex::new(()),
            generated_counter: AtomicUsize::new(0),
            bytes_generated_total: AtomicU64::new(0),
            last_generated_at: SyncMutex::new(None),
            generation_errors_total: AtomicUsize::new(0),
            rng: CryptoRandom::new(),
        }
    }

    fn validate_request(
        &self,
        number: u32,
        size_bits: u32,
        additional_slaves: usize,
    ) -> Result<(), KmeError> {
        if number < 1 {
            return Err(KmeError::InvalidArgument(
                "number must be at least 1".into(),
            ));
        }
        if number > self.limits.max_key_per_request {
            return Err(KmeError::InvalidArgument(format!(
                "number {number} exceeds max_key_per_request {}",
                self.limits.max_key_per_request
            )));
        }
        if size_bits % 8 != 0 {
            return Err(KmeError::InvalidArgument(
                "size must be a multiple of 8".into(),
            ));
        }
        if size_bits < self.limits.min_key_size || size_bits > self.limits.max_key_size {
            return Err(KmeError::InvalidArgument(format!(
                "size {size_bits} out of range [{}, {}]",
                self.limits.min_key_size, self.limits.max_key_size
            )));
        }
        if self.limits.max_sae_id_count > 0
            && (additional_slaves + 1) as u32 > self.limits.max_sae_id_count + 1
        {
            return Err(KmeError::InvalidArgument(format!(
                "additional_slave_SAE_IDs count {additional_slaves} exceeds max_SAE_ID_count {}",
                self.limits.max_sae_id_count
            )));
        }
        Ok(())
    }

    /// Atomically selects `number` distinct available keys satisfying the
    /// size constraint, binds them to the given SAE tuple, and returns the
    /// reservation.
    pub async fn reserve_for_master(
        &self,
        master_sae_id: &str,
        slave_sae_ids: &[SaeId],
        number: u32,
        size_bits: u32,
        source_kme_id: &str,
        target_kme_id: &str,
    ) -> Result<Reservation, KmeError> {
        self.validate_request(number, size_bits, slave_sae_ids.len())?;

        let mut all_slaves: BTreeSet<SaeId> = slave_sae_ids.iter().cloned().collect();
        if all_slaves.len() != slave_sae_ids.len() {
            return Err(KmeError::InvalidArgument(
                "duplicate slave SAE IDs in request".into(),
            ));
        }
        if all_slaves.contains(master_sae_id) {
            return Err(KmeError::InvalidArgument(
                "master SAE ID cannot also be a slave".into(),
            ));
        }
        // Keep a stable copy; `all_slaves` above only existed to detect dups.
        let slave_set: BTreeSet<SaeId> = slave_sae_ids.iter().cloned().collect();
        all_slaves = slave_set;

        let reservation_id = self.rng.new_uuid();
        let mut reserved_ids = Vec::with_capacity(number as usize);

        // --- selection phase: serialized, but never spans a KeySource call.
        let candidate_ids: Vec<KeyId> = {
            let _guard = self.selection_lock.lock().await;
            self.select_available_candidates(size_bits, source_kme_id, target_kme_id, number)
                .await?
        };

        for id in candidate_ids {
            if self
                .store
                .claim_for_reservation(id, master_sae_id, &all_slaves)
                .await?
            {
                reserved_ids.push(id);
            }
        }

        // Top up with freshly sourced material if selection + CAS left us
        // short (contention, or the store simply didn't have enough yet).
        if reserved_ids.len() < number as usize {
            let shortfall = number as usize - reserved_ids.len();
            let stored_total = self.store.total_count().await?;
            if stored_total + shortfall > self.limits.max_key_count {
                self.release(&reserved_ids).await;
                return Err(KmeError::Exhausted(format!(
                    "pool cannot grow by {shortfall} keys without exceeding max_key_count {}",
                    self.limits.max_key_count
                )));
            }

            match self
                .source
                .fetch(source_kme_id, target_kme_id, size_bits, shortfall as u32)
                .await
            {
                Ok(fresh) => {
                    for bytes in fresh {
                        let id = self.rng.new_uuid();
                        self.bytes_generated_total
                            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        let record = KeyRecord {
                            key_id: id,
                            bytes,
                            size_bits,
                            master_sae_id: master_sae_id.to_string(),
                            slave_sae_ids: all_slaves.clone(),
                            source_kme_id: source_kme_id.to_string(),
                            target_kme_id: target_kme_id.to_string(),
                            status: KeyStatus::Reserved,
                            created_at: Utc::now(),
                            expires_at: None,
                        };
                        self.store.insert(record).await?;
                        reserved_ids.push(id);
                        self.generated_counter.fetch_add(1, Ordering::Relaxed);
                        *self.last_generated_at.lock().expect("mutex poisoned") = Some(Utc::now());
                    }
                }
                Err(e) => {
                    self.generation_errors_total.fetch_add(1, Ordering::Relaxed);
                    self.release(&reserved_ids).await;
                    return Err(e);
                }
            }
        }

        if reserved_ids.len() < number as usize {
            self.release(&reserved_ids).await;
            return Err(KmeError::Exhausted(
                "insufficient keys available to satisfy request".into(),
            ));
        }

        Ok(Reservation {
            reservation_id,
            key_ids: reserved_ids,
            master_sae_id: master_sae_id.to_string(),
            slave_sae_ids: all_slaves,
            size_bits,
            source_kme_id: source_kme_id.to_string(),
            target_kme_id: target_kme_id.to_string(),
        })
    }

    async fn select_available_candidates(
        &self,
        size_bits: u32,
        source_kme_id: &str,
        target_kme_id: &str,
        number: u32,
    ) -> Result<Vec<KeyId>, KmeError> {
        // The reference `KeyStore` doesn't expose a dedicated "list
        // available matching criteria" query beyond `count_available`, so
        // the pool keeps its candidate search local to this module by
        // scanning via `get_many`-friendly primitives is not applicable
        // here; instead we rely on the store's iteration for the mock
        // in-memory backend. A SQL-backed store would replace this with an
        // indexed `SELECT ... FOR UPDATE SKIP LOCKED`-style query.
        let ids = self
            .store
            .find_available(size_bits, source_kme_id, target_kme_id, number)
            .await?;
        Ok(ids)
    }

    /// Reverts `key_ids` from `from` back to `available`. CAS failures are
    /// swallowed: a key that's already moved on (e.g. concurrently expired)
    /// simply isn't touched, which is the correct outcome for a release.
    async fn revert(&self, key_ids: &[KeyId], from: KeyStatus) {
        for id in key_ids {
            let _ = self.store.update_status(*id, from, KeyStatus::Available).await;
        }
    }

    async fn release(&self, key_ids: &[KeyId]) {
        self.revert(key_ids, KeyStatus::Reserved).await;
    }

    /// Finalizes status to `delivered_master` and returns the bytes. If any
    /// CAS fails partway through, every key touched so far in this call is
    /// rolled back: keys already flipped to `delivered_master` are reverted
    /// from that status, and keys not yet reached are reverted from
    /// `reserved` — neither set is still `reserved`, so a single
    /// `reserved`-only release (as used by `abort`) would silently leave the
    /// already-committed keys stuck in `delivered_master` forever.
    pub async fn commit(&self, reservation: Reservation) -> Result<Vec<KeyRecord>, KmeError> {
        let mut committed = Vec::with_capacity(reservation.key_ids.len());
        for id in &reservation.key_ids {
            let ok = self
                .store
                .update_status(*id, KeyStatus::Reserved, KeyStatus::DeliveredMaster)
                .await?;
            if !ok {
                let remaining: Vec<KeyId> = reservation
                    .key_ids
                    .iter()
                    .filter(|k| !committed.contains(k))
                    .copied()
                    .collect();
                self.revert(&committed, KeyStatus::DeliveredMaster).await;
                self.revert(&remaining, KeyStatus::Reserved).await;
                return Err(KmeError::Internal(
                    "reservation commit lost a race; request aborted".into(),
                ));
            }
            committed.push(*id);
        }

        let mut records = Vec::with_capacity(committed.len());
        for id in committed {
            match self.store.get(id).await? {
                Some(r) => records.push(r),
                None => {
                    return Err(KmeError::Internal(
                        "committed key vanished from store".into(),
                    ))
                }
            }
        }
        Ok(records)
    }

    /// Releases reserved keys back to `available`. Safe to call on a
    /// partially or fully committed reservation's leftovers via `commit`'s
    /// own rollback path; idempotent for keys no longer in `Reserved`.
    pub async fn abort(&self, reservation: Reservation) {
        self.release(&reservation.key_ids).await;
    }

    /// Returns keys whose `slave_sae_ids` contains `requesting_sae_id`.
    /// Ordering matches the input order.
    pub async fn retrieve_for_slave(
        &self,
        requesting_sae_id: &str,
        master_sae_id: &str,
        key_ids: &[KeyId],
    ) -> Result<Vec<KeyRecord>, KmeError> {
        let result = self.store.get_many(key_ids).await?;
        if !result.missing.is_empty() {
            return Err(KmeError::NotFound(format!(
                "unknown key_ID(s): {}",
                result
                    .missing
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let mut by_id = std::collections::HashMap::new();
        for record in result.found {
            by_id.insert(record.key_id, record);
        }

        let mut ordered = Vec::with_capacity(key_ids.len());
        for id in key_ids {
            let record = by_id.remove(id).expect("checked present above");
            if !record.is_authorized_slave(requesting_sae_id) || record.master_sae_id != master_sae_id
            {
                return Err(KmeError::Forbidden(format!(
                    "{requesting_sae_id} is not an authorized slave of key {id}"
                )));
            }
            if record.status.is_dead() {
                return Err(KmeError::Gone(format!("key {id} is no longer live")));
            }
            ordered.push(record);
        }
        Ok(ordered)
    }

    pub async fn stats(&self, source_kme_id: &str, target_kme_id: &str) -> Result<PoolStats, KmeError> {
        let stored_key_count = self.store.count_available(source_kme_id, target_kme_id).await?;
        Ok(PoolStats { stored_key_count })
    }

    /// Snapshot for `/health/ready`: cumulative keys sourced since process
    /// start plus the current available count for this link.
    pub async fn generation_metrics(
        &self,
        source_kme_id: &str,
        target_kme_id: &str,
    ) -> Result<KeyGenerationMetrics, KmeError> {
        let stored_key_count = self.store.count_available(source_kme_id, target_kme_id).await?;
        Ok(KeyGenerationMetrics {
            keys_generated_total: self.generated_counter.load(Ordering::Relaxed),
            bytes_generated_total: self.bytes_generated_total.load(Ordering::Relaxed),
            last_generated_at: *self.last_generated_at.lock().expect("mutex poisoned"),
            generation_errors_total: self.generation_errors_total.load(Ordering::Relaxed),
            stored_key_count,
        })
    }

    pub fn kme_id(&self) -> &str {
        &self.kme_id
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    /// Background sweeper: transitions any key whose `expires_at` is in
    /// the past to `expired`.
    pub async fn sweep_expired(&self) -> Result<usize, KmeError> {
        let now = Utc::now();
        let expired_ids = self.store.find_expired(now).await?;
        let mut swept = 0;
        for id in expired_ids {
            for from in [
                KeyStatus::Available,
                KeyStatus::DeliveredMaster,
                KeyStatus::DeliveredSlave,
            ] {
                if self.store.update_status(id, from, KeyStatus::Expired).await? {
                    swept += 1;
                    break;
                }
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_source::MockKeySource;
    use crate::key_store::InMemoryKeyStore;

    fn limits() -> PoolLimits {
        PoolLimits {
            min_key_size: 64,
            max_key_size: 1024,
            max_key_per_request: 10,
            max_key_count: 1000,
            max_sae_id_count: 10,
            default_key_size: 256,
        }
    }

    fn make_pool() -> KeyPool {
        KeyPool::new(
            Arc::new(InMemoryKeyStore::new()),
            Arc::new(MockKeySource::new()),
            limits(),
            "kmeA".to_string(),
        )
    }

    #[tokio::test]
    async fn reserve_then_commit_then_slave_retrieve_round_trip() {
        let pool = make_pool();
        let reservation = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                2,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap();
        let committed = pool.commit(reservation).await.unwrap();
        assert_eq!(committed.len(), 2);

        let ids: Vec<KeyId> = committed.iter().map(|r| r.key_id).collect();
        let retrieved = pool
            .retrieve_for_slave("SLAVE00000000001", "MASTER0000000001", &ids)
            .await
            .unwrap();

        for (a, b) in committed.iter().zip(retrieved.iter()) {
            assert_eq!(a.bytes, b.bytes);
        }
    }

    #[tokio::test]
    async fn unauthorized_slave_is_forbidden() {
        let pool = make_pool();
        let reservation = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                1,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap();
        let committed = pool.commit(reservation).await.unwrap();
        let ids = vec![committed[0].key_id];

        let err = pool
            .retrieve_for_slave("OTHER0000000003", "MASTER0000000001", &ids)
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn missing_key_id_yields_not_found_for_whole_request() {
        let pool = make_pool();
        let reservation = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                1,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap();
        let committed = pool.commit(reservation).await.unwrap();
        let ids = vec![committed[0].key_id, Uuid::new_v4()];

        let err = pool
            .retrieve_for_slave("SLAVE00000000001", "MASTER0000000001", &ids)
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::NotFound(_)));
    }

    #[tokio::test]
    async fn abort_releases_keys_back_to_available() {
        let pool = make_pool();
        let reservation = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                1,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap();
        let id = reservation.key_ids[0];
        pool.abort(reservation).await;

        let record = pool.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, KeyStatus::Available);
    }

    #[tokio::test]
    async fn reused_available_key_is_rebound_to_the_new_reservation() {
        let pool = make_pool();
        let first = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                1,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap();
        let id = first.key_ids[0];
        pool.abort(first).await;

        let second = pool
            .reserve_for_master(
                "MASTER0000000002",
                &["SLAVE00000000002".to_string()],
                1,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap();
        assert_eq!(second.key_ids, vec![id]);
        let committed = pool.commit(second).await.unwrap();

        // The reused record must carry the new reservation's binding, not
        // the aborted one's.
        assert_eq!(committed[0].master_sae_id, "MASTER0000000002");
        assert!(committed[0].is_authorized_slave("SLAVE00000000002"));
        assert!(!committed[0].is_authorized_slave("SLAVE00000000001"));

        let retrieved = pool
            .retrieve_for_slave("SLAVE00000000002", "MASTER0000000002", &[id])
            .await
            .unwrap();
        assert_eq!(retrieved[0].bytes, committed[0].bytes);

        let forbidden = pool
            .retrieve_for_slave("SLAVE00000000001", "MASTER0000000001", &[id])
            .await
            .unwrap_err();
        assert!(matches!(forbidden, KmeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn commit_race_reverts_already_delivered_keys_instead_of_leaking_them() {
        let pool = make_pool();
        let reservation = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                2,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap();
        let first_id = reservation.key_ids[0];
        let second_id = reservation.key_ids[1];

        // Simulate a concurrent actor knocking the second key out of
        // `reserved` before `commit` reaches it (e.g. a racing expiry sweep).
        pool.store
            .update_status(second_id, KeyStatus::Reserved, KeyStatus::Expired)
            .await
            .unwrap();

        let err = pool.commit(reservation).await.unwrap_err();
        assert!(matches!(err, KmeError::Internal(_)));

        // The first key had already been flipped to `delivered_master` by
        // the time the second CAS failed; it must be reverted to
        // `available`, not left stranded.
        let first_record = pool.store.get(first_id).await.unwrap().unwrap();
        assert_eq!(first_record.status, KeyStatus::Available);
    }

    #[tokio::test]
    async fn rejects_number_over_max_key_per_request() {
        let pool = make_pool();
        let err = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                999,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn rejects_size_not_multiple_of_eight() {
        let pool = make_pool();
        let err = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                1,
                257,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn exhausted_when_pool_capacity_reached() {
        let mut l = limits();
        l.max_key_count = 1;
        let pool = KeyPool::new(
            Arc::new(InMemoryKeyStore::new()),
            Arc::new(MockKeySource::new()),
            l,
            "kmeA".to_string(),
        );
        let err = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                5,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::Exhausted(_)));
    }

    #[tokio::test]
    async fn at_most_once_master_delivery() {
        let pool = make_pool();
        let reservation = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                1,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap();
        let committed = pool.commit(reservation).await.unwrap();
        let id = committed[0].key_id;

        // The same key must never be selected again by a later reservation.
        for _ in 0..5 {
            let r = pool
                .reserve_for_master(
                    "MASTER0000000002",
                    &["SLAVE00000000002".to_string()],
                    1,
                    256,
                    "kmeA",
                    "kmeB",
                )
                .await
                .unwrap();
            assert!(!r.key_ids.contains(&id));
            pool.abort(r).await;
        }
    }

    #[tokio::test]
    async fn generation_metrics_tracks_freshly_sourced_keys() {
        let pool = make_pool();
        let before = pool.generation_metrics("kmeA", "kmeB").await.unwrap();
        assert_eq!(before.keys_generated_total, 0);
        assert!(before.last_generated_at.is_none());

        let reservation = pool
            .reserve_for_master(
                "MASTER0000000001",
                &["SLAVE00000000001".to_string()],
                2,
                256,
                "kmeA",
                "kmeB",
            )
            .await
            .unwrap();
        pool.commit(reservation).await.unwrap();

        let after = pool.generation_metrics("kmeA", "kmeB").await.unwrap();
        assert_eq!(after.keys_generated_total, 2);
        assert_eq!(after.bytes_generated_total, 2 * 32);
        assert!(after.last_generated_at.is_some());
    }
}
