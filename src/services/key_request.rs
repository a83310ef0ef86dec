//! C10: `KeyRequestService` — master path (`POST .../enc_keys`).

use crate::audit_log::RequestAuditLog;
use crate::authz::{AuthorizationPolicy, EndpointKind};
use crate::config::KmeConfig;
use crate::error::KmeError;
use crate::extensions::ExtensionEngine;
use crate::http::dto::{KeyRequestBody, KeyWire, KeysResponse};
use crate::key_pool::{KeyPool, Reservation};
use crate::model::{KeyRequestOutcome, KeyRequestRecord};
use crate::pairing_ledger::PairingLedger;
use chrono::Utc;
use data_encoding::BASE64;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub struct KeyRequestService {
    pool: Arc<KeyPool>,
    authz: Arc<AuthorizationPolicy>,
    extensions: Arc<ExtensionEngine>,
    config: Arc<KmeConfig>,
    ledger: Arc<PairingLedger>,
    audit_log: Arc<RequestAuditLog>,
}

impl KeyRequestService {
    pub fn new(
        pool: Arc<KeyPool>,
        authz: Arc<AuthorizationPolicy>,
        extensions: Arc<ExtensionEngine>,
        config: Arc<KmeConfig>,
        ledger: Arc<PairingLedger>,
        audit_log: Arc<RequestAuditLog>,
    ) -> Self {
        Self {
            pool,
            authz,
            extensions,
            config,
            ledger,
            audit_log,
        }
    }

    pub async fn request_keys(
        &self,
        requesting_sae_id: &str,
        slave_sae_id: &str,
        body: KeyRequestBody,
    ) -> Result<KeysResponse, KmeError> {
        self.authz
            .check(
                requesting_sae_id,
                EndpointKind::KeyRequest,
                slave_sae_id,
                &body.additional_slave_sae_ids,
            )
            .await?;

        let mandatory_outcome = self.extensions.validate_mandatory(&body.extension_mandatory)?;
        let optional_outcome = self.extensions.apply_optional(&body.extension_optional);
        let mut extension_results = mandatory_outcome.results;
        extension_results.extend(optional_outcome.results);

        let size_bits = body.size.unwrap_or(self.config.general.default_key_size);
        let mut slaves = vec![slave_sae_id.to_string()];
        slaves.extend(body.additional_slave_sae_ids.iter().cloned());

        let deadline = Duration::from_millis(self.config.general.request_timeout_ms);

        let reservation: Reservation = match timeout(
            deadline,
            self.pool.reserve_for_master(
                requesting_sae_id,
                &slaves,
                body.number,
                size_bits,
                &self.config.general.kme_id,
                &self.config.general.target_kme_id,
            ),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(KmeError::Timeout(
                    "key reservation did not complete before the request deadline".into(),
                ))
            }
        };

        let reservation_id = reservation.reservation_id;
        let keys = match timeout(deadline, self.pool.commit(reservation.clone())).await {
            Ok(Ok(keys)) => keys,
            Ok(Err(e)) => {
                self.audit_log.record(KeyRequestRecord {
                    request_id: reservation_id,
                    master_sae_id: requesting_sae_id.to_string(),
                    slave_sae_ids: slaves.clone(),
                    number: body.number,
                    size_bits,
                    status: KeyRequestOutcome::Aborted,
                    error: Some(e.to_string()),
                    at: Utc::now(),
                });
                return Err(e);
            }
            Err(_) => {
                self.pool.abort(reservation).await;
                self.audit_log.record(KeyRequestRecord {
                    request_id: reservation_id,
                    master_sae_id: requesting_sae_id.to_string(),
                    slave_sae_ids: slaves.clone(),
                    number: body.number,
                    size_bits,
                    status: KeyRequestOutcome::Aborted,
                    error: Some("request deadline exceeded during commit".to_string()),
                    at: Utc::now(),
                });
                return Err(KmeError::Timeout(
                    "key commit did not complete before the request deadline; reservation aborted"
                        .into(),
                ));
            }
        };

        for slave in &slaves {
            self.ledger.record(requesting_sae_id, slave);
        }

        self.audit_log.record(KeyRequestRecord {
            request_id: reservation_id,
            master_sae_id: requesting_sae_id.to_string(),
            slave_sae_ids: slaves.clone(),
            number: body.number,
            size_bits,
            status: KeyRequestOutcome::Committed,
            error: None,
            at: Utc::now(),
        });

        let key_extension = if extension_results.is_empty() {
            None
        } else {
            Some(serde_json::to_value(extension_results).map_err(|e| {
                KmeError::Internal(format!("failed to serialize extension results: {e}"))
            })?)
        };

        Ok(KeysResponse {
            keys: keys
                .into_iter()
                .map(|record| KeyWire {
                    key_id: record.key_id.to_string(),
                    key: BASE64.encode(&record.bytes),
                })
                .collect(),
            key_extension,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::StatusQueryPolicy;
    use crate::key_pool::PoolLimits;
    use crate::key_source::MockKeySource;
    use crate::key_store::InMemoryKeyStore;
    use crate::model::{SaeRegistration, SaeStatus};
    use crate::sae_registry::InMemorySaeRegistry;

    fn config() -> KmeConfig {
        toml::from_str(
            r#"
            [general]
            kme_id = "kmeA"
            target_kme_id = "kmeB"
            "#,
        )
        .unwrap()
    }

    fn setup() -> (KeyRequestService, Arc<PairingLedger>, Arc<RequestAuditLog>) {
        let registry = InMemorySaeRegistry::new();
        registry.register(SaeRegistration {
            sae_id: "MASTER0000000001".to_string(),
            status: SaeStatus::Active,
            kme_id: "kmeA".to_string(),
            certificate_fingerprint: "a".to_string(),
        });
        registry.register(SaeRegistration {
            sae_id: "SLAVE00000000001".to_string(),
            status: SaeStatus::Active,
            kme_id: "kmeA".to_string(),
            certificate_fingerprint: "b".to_string(),
        });
        let registry = Arc::new(registry);
        let authz = Arc::new(AuthorizationPolicy::new(
            registry.clone(),
            StatusQueryPolicy::RelationshipOnly,
        ));
        let pool = Arc::new(KeyPool::new(
            Arc::new(InMemoryKeyStore::new()),
            Arc::new(MockKeySource::new()),
            PoolLimits {
                min_key_size: 64,
                max_key_size: 1024,
                max_key_per_request: 10,
                max_key_count: 1000,
                max_sae_id_count: 10,
                default_key_size: 256,
            },
            "kmeA".to_string(),
        ));
        let ledger = Arc::new(PairingLedger::new());
        let audit_log = Arc::new(RequestAuditLog::new());
        let service = KeyRequestService::new(
            pool,
            authz,
            Arc::new(ExtensionEngine::new()),
            Arc::new(config()),
            ledger.clone(),
            audit_log.clone(),
        );
        (service, ledger, audit_log)
    }

    #[tokio::test]
    async fn happy_path_returns_requested_key_count() {
        let (service, _ledger, _audit_log) = setup();
        let body = KeyRequestBody {
            number: 3,
            ..Default::default()
        };
        let response = service
            .request_keys("MASTER0000000001", "SLAVE00000000001", body)
            .await
            .unwrap();
        assert_eq!(response.keys.len(), 3);
    }

    #[tokio::test]
    async fn records_pairing_ledger_on_success() {
        let (service, ledger, _audit_log) = setup();
        service
            .request_keys("MASTER0000000001", "SLAVE00000000001", KeyRequestBody::default())
            .await
            .unwrap();
        assert_eq!(
            ledger.known_master_for("SLAVE00000000001"),
            Some("MASTER0000000001".to_string())
        );
    }

    #[tokio::test]
    async fn records_committed_outcome_in_audit_log() {
        let (service, _ledger, audit_log) = setup();
        service
            .request_keys("MASTER0000000001", "SLAVE00000000001", KeyRequestBody::default())
            .await
            .unwrap();
        let recent = audit_log.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, KeyRequestOutcome::Committed);
        assert_eq!(recent[0].master_sae_id, "MASTER0000000001");
    }

    #[tokio::test]
    async fn unauthorized_master_slave_pair_is_rejected() {
        let (service, _ledger, _audit_log) = setup();
        let err = service
            .request_keys("MASTER0000000001", "SLAVE00000000099", KeyRequestBody::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn unknown_mandatory_extension_rejects_before_reserving() {
        let (service, _ledger, _audit_log) = setup();
        let body = KeyRequestBody {
            extension_mandatory: vec![crate::extensions::ExtensionParameter {
                extension_type: "unknown_vendor_thing".to_string(),
                data: serde_json::json!({}),
                version: None,
                vendor: None,
            }],
            ..Default::default()
        };
        let err = service
            .request_keys("MASTER0000000001", "SLAVE00000000001", body)
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::ExtensionRejected(_)));
    }
}
