//! C11: `KeyRetrievalService` — slave path (`POST .../dec_keys`).

use crate::authz::{AuthorizationPolicy, EndpointKind};
use crate::error::KmeError;
use crate::http::dto::{KeyRetrievalBody, KeyWire, KeysResponse};
use crate::key_pool::KeyPool;
use data_encoding::BASE64;
use std::sync::Arc;
use uuid::Uuid;

pub struct KeyRetrievalService {
    pool: Arc<KeyPool>,
    authz: Arc<AuthorizationPolicy>,
}

impl KeyRetrievalService {
    pub fn new(pool: Arc<KeyPool>, authz: Arc<AuthorizationPolicy>) -> Self {
        Self { pool, authz }
    }

    pub async fn retrieve_keys(
        &self,
        requesting_sae_id: &str,
        master_sae_id: &str,
        body: KeyRetrievalBody,
    ) -> Result<KeysResponse, KmeError> {
        self.authz
            .check(requesting_sae_id, EndpointKind::KeyRetrieval, master_sae_id, &[])
            .await?;

        // All-or-nothing UUID validation.
        let mut key_ids = Vec::with_capacity(body.key_ids.len());
        for entry in &body.key_ids {
            let id = Uuid::parse_str(&entry.key_id).map_err(|_| {
                KmeError::InvalidArgument(format!("'{}' is not a valid key_ID", entry.key_id))
            })?;
            key_ids.push(id);
        }

        let keys = self
            .pool
            .retrieve_for_slave(requesting_sae_id, master_sae_id, &key_ids)
            .await?;

        Ok(KeysResponse {
            keys: keys
                .into_iter()
                .map(|record| KeyWire {
                    key_id: record.key_id.to_string(),
                    key: BASE64.encode(&record.bytes),
                })
                .collect(),
            key_extension: None,
        })
    }
}
