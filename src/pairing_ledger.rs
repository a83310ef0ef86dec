//! Tracks which master most recently requested keys for a given slave, so
//! `Get Status` can answer "who is my master" — see `DESIGN.md` for the decision record.
//!
//! This is runtime-observed state, distinct from `SAERegistry`'s
//! deployment-configured pairing table: the registry says who is *allowed*
//! to pair, this ledger says who actually *has*.

use crate::model::SaeId;
use dashmap::DashMap;

#[derive(Default)]
pub struct PairingLedger {
    /// slave_SAE_ID -> most recent master_SAE_ID to successfully request
    /// keys for it.
    last_master_for_slave: DashMap<SaeId, SaeId>,
}

impl PairingLedger {
    pub fn new() -> Self {
        Self {
            last_master_for_slave: DashMap::new(),
        }
    }

    pub fn record(&self, master_sae_id: &str, slave_sae_id: &str) {
        self.last_master_for_slave
            .insert(slave_sae_id.to_string(), master_sae_id.to_string());
    }

    pub fn known_master_for(&self, slave_sae_id: &str) -> Option<SaeId> {
        self.last_master_for_slave
            .get(slave_sae_id)
            .map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_recalls_most_recent_master() {
        let ledger = PairingLedger::new();
        ledger.record("MASTER0000000001", "SLAVE00000000001");
        ledger.record("MASTER0000000002", "SLAVE00000000001");
        assert_eq!(
            ledger.known_master_for("SLAVE00000000001"),
            Some("MASTER0000000002".to_string())
        );
    }

    #[test]
    fn unknown_slave_has_no_master() {
        let ledger = PairingLedger::new();
        assert_eq!(ledger.known_master_for("SLAVE00000000009"), None);
    }
}
