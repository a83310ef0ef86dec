//! Core data model: identifiers, key records, and the lifecycle states they
//! move through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Opaque SAE identifier. The wire format only requires printable
/// characters that are unique within the deployment; the reference
/// configuration uses 16-character alphanumeric tokens.
pub type SaeId = String;

/// KME instance identifier.
pub type KmeId = String;

/// Key identifier — a UUID (v4 recommended, not enforced on generation
/// since a store may be seeded from elsewhere).
pub type KeyId = Uuid;

/// Lifecycle state of a key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Freshly generated, not yet handed to a master.
    Available,
    /// Bound to a pending `reserve_for_master` reservation. Not yet
    /// readable by slaves; either becomes `DeliveredMaster` (`commit`) or
    /// reverts to `Available` (`abort`).
    Reserved,
    /// Delivered to the master; readable by authorized slaves.
    DeliveredMaster,
    /// Retrieved by at least one slave. Kept distinct from
    /// `DeliveredMaster` for observability only — both are "live" states
    /// and behave identically for read access.
    DeliveredSlave,
    /// Consumed by a single-use extension; no longer live.
    Consumed,
    /// Past `expires_at`.
    Expired,
    /// Explicitly revoked by an operator.
    Revoked,
}

impl KeyStatus {
    /// Whether a key in this status may still be returned by either
    /// endpoint.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            KeyStatus::Available | KeyStatus::DeliveredMaster | KeyStatus::DeliveredSlave
        )
    }

    pub fn is_dead(self) -> bool {
        !self.is_live()
    }
}

/// The central, durable entity. Uniquely identified by `key_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: KeyId,
    /// Octet string; confidential. Length always equals `size_bits / 8`.
    pub bytes: Vec<u8>,
    pub size_bits: u32,
    pub master_sae_id: SaeId,
    /// Non-empty; includes the original slave plus any
    /// `additional_slave_SAE_IDs`. Fixed at delivery time.
    pub slave_sae_ids: BTreeSet<SaeId>,
    pub source_kme_id: KmeId,
    pub target_kme_id: KmeId,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub fn is_authorized_slave(&self, sae_id: &str) -> bool {
        self.slave_sae_ids.iter().any(|s| s == sae_id)
    }
}

/// Audit row for a master key request. Recorded for diagnostics only —
/// never serialized back to a SAE.
#[derive(Debug, Clone, Serialize)]
pub struct KeyRequestRecord {
    pub request_id: Uuid,
    pub master_sae_id: SaeId,
    pub slave_sae_ids: Vec<SaeId>,
    pub number: u32,
    pub size_bits: u32,
    pub status: KeyRequestOutcome,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRequestOutcome {
    Committed,
    Aborted,
}

/// Snapshot of pool key-generation activity, exposed through the
/// health/readiness endpoints. Purely observability — never affects
/// request semantics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct KeyGenerationMetrics {
    /// Cumulative count of keys freshly sourced from the `KeySource` since
    /// process start (not reset on expiry or delivery).
    pub keys_generated_total: usize,
    pub bytes_generated_total: u64,
    pub last_generated_at: Option<DateTime<Utc>>,
    /// Count of failed `KeySource::fetch` calls since process start.
    pub generation_errors_total: usize,
    pub stored_key_count: usize,
}

/// SAE registration status, as consumed from the external `SAERegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaeStatus {
    Active,
    Suspended,
    Revoked,
}

/// A SAE registration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaeRegistration {
    pub sae_id: SaeId,
    pub status: SaeStatus,
    pub kme_id: KmeId,
    pub certificate_fingerprint: String,
}
