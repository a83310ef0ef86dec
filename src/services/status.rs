//! C9: `StatusService` — produces the `Get Status` response.

use crate::config::KmeConfig;
use crate::error::KmeError;
use crate::http::dto::StatusResponse;
use crate::key_pool::KeyPool;
use crate::pairing_ledger::PairingLedger;
use std::sync::Arc;

pub struct StatusService {
    pool: Arc<KeyPool>,
    config: Arc<KmeConfig>,
    ledger: Arc<PairingLedger>,
}

impl StatusService {
    pub fn new(pool: Arc<KeyPool>, config: Arc<KmeConfig>, ledger: Arc<PairingLedger>) -> Self {
        Self {
            pool,
            config,
            ledger,
        }
    }

    pub async fn get_status(
        &self,
        requesting_sae_id: &str,
        slave_sae_id: &str,
    ) -> Result<StatusResponse, KmeError> {
        let stats = self
            .pool
            .stats(&self.config.general.kme_id, &self.config.general.target_kme_id)
            .await?;

        // Open Question (a), decided in DESIGN.md: the requester is the
        // master for this pairing if it has ever successfully requested
        // keys for this slave; otherwise fall back to this KME's own ID.
        let master_sae_id = if self
            .ledger
            .known_master_for(slave_sae_id)
            .as_deref()
            == Some(requesting_sae_id)
        {
            requesting_sae_id.to_string()
        } else {
            self.ledger
                .known_master_for(slave_sae_id)
                .unwrap_or_else(|| self.config.general.kme_id.clone())
        };

        Ok(StatusResponse {
            source_kme_id: self.config.general.kme_id.clone(),
            target_kme_id: self.config.general.target_kme_id.clone(),
            master_sae_id,
            slave_sae_id: slave_sae_id.to_string(),
            key_size: self.config.general.default_key_size,
            stored_key_count: stats.stored_key_count,
            max_key_count: self.config.general.max_key_count,
            max_key_per_request: self.config.general.max_key_per_request,
            max_key_size: self.config.general.max_key_size,
            min_key_size: self.config.general.min_key_size,
            max_sae_id_count: self.config.general.max_sae_id_count,
            status_extension: None,
        })
    }
}
