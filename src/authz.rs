//! C7: `AuthorizationPolicy` — per-endpoint role rules.

use crate::error::KmeError;
use crate::sae_registry::SaeRegistry;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Status,
    KeyRequest,
    KeyRetrieval,
}

/// Deployment-wide knob for `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusQueryPolicy {
    RelationshipOnly,
    AnyActiveSae,
}

impl Default for StatusQueryPolicy {
    fn default() -> Self {
        StatusQueryPolicy::RelationshipOnly
    }
}

pub struct AuthorizationPolicy {
    registry: Arc<dyn SaeRegistry>,
    status_query_policy: StatusQueryPolicy,
}

impl AuthorizationPolicy {
    pub fn new(registry: Arc<dyn SaeRegistry>, status_query_policy: StatusQueryPolicy) -> Self {
        Self {
            registry,
            status_query_policy,
        }
    }

    pub async fn check(
        &self,
        requesting_sae_id: &str,
        endpoint_kind: EndpointKind,
        url_sae_id: &str,
        additional_slave_sae_ids: &[String],
    ) -> Result<(), KmeError> {
        match endpoint_kind {
            EndpointKind::Status => self.check_status(requesting_sae_id, url_sae_id).await,
            EndpointKind::KeyRequest => {
                self.check_key_request(requesting_sae_id, url_sae_id, additional_slave_sae_ids)
                    .await
            }
            EndpointKind::KeyRetrieval => {
                self.check_key_retrieval(requesting_sae_id, url_sae_id).await
            }
        }
    }

    async fn check_status(&self, requesting_sae_id: &str, url_sae_id: &str) -> Result<(), KmeError> {
        if requesting_sae_id == url_sae_id {
            return Ok(());
        }
        match self.status_query_policy {
            StatusQueryPolicy::AnyActiveSae => {
                if self.registry.is_active(requesting_sae_id).await {
                    return Ok(());
                }
            }
            StatusQueryPolicy::RelationshipOnly => {
                if self
                    .registry
                    .has_pairing(requesting_sae_id, url_sae_id)
                    .await
                {
                    return Ok(());
                }
            }
        }
        Err(KmeError::Forbidden(format!(
            "{requesting_sae_id} has no relationship with {url_sae_id}"
        )))
    }

    async fn check_key_request(
        &self,
        requesting_sae_id: &str,
        url_sae_id: &str,
        additional_slave_sae_ids: &[String],
    ) -> Result<(), KmeError> {
        if requesting_sae_id == url_sae_id {
            return Err(KmeError::InvalidArgument(
                "master SAE ID cannot equal slave SAE ID".into(),
            ));
        }
        self.check_master_slave_pair(requesting_sae_id, url_sae_id)
            .await?;
        for extra in additional_slave_sae_ids {
            self.check_master_slave_pair(requesting_sae_id, extra)
                .await?;
        }
        Ok(())
    }

    async fn check_master_slave_pair(&self, master: &str, slave: &str) -> Result<(), KmeError> {
        if !self.registry.is_active(master).await {
            return Err(KmeError::Forbidden(format!("{master} is not active")));
        }
        if !self.registry.is_active(slave).await {
            return Err(KmeError::Forbidden(format!("{slave} is not active")));
        }
        if !self.registry.has_pairing(master, slave).await {
            return Err(KmeError::Forbidden(format!(
                "{master} is not authorized to request keys for {slave}"
            )));
        }
        Ok(())
    }

    /// `url_sae_id` here is the master that produced the keys; final
    /// per-key binding is still checked by `KeyPool::retrieve_for_slave`.
    async fn check_key_retrieval(
        &self,
        requesting_sae_id: &str,
        url_sae_id: &str,
    ) -> Result<(), KmeError> {
        if !self.registry.is_active(requesting_sae_id).await {
            return Err(KmeError::Forbidden(format!(
                "{requesting_sae_id} is not active"
            )));
        }
        if !self.registry.is_active(url_sae_id).await {
            return Err(KmeError::Forbidden(format!("{url_sae_id} is not active")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SaeRegistration, SaeStatus};
    use crate::sae_registry::InMemorySaeRegistry;

    fn reg(id: &str) -> SaeRegistration {
        SaeRegistration {
            sae_id: id.to_string(),
            status: SaeStatus::Active,
            kme_id: "kmeA".to_string(),
            certificate_fingerprint: "deadbeef".to_string(),
        }
    }

    fn policy_with(registry: InMemorySaeRegistry) -> AuthorizationPolicy {
        AuthorizationPolicy::new(Arc::new(registry), StatusQueryPolicy::RelationshipOnly)
    }

    #[tokio::test]
    async fn status_self_query_always_allowed() {
        let registry = InMemorySaeRegistry::new();
        let policy = policy_with(registry);
        policy
            .check(
                "SLAVE00000000001",
                EndpointKind::Status,
                "SLAVE00000000001",
                &[],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn key_request_requires_active_pairing() {
        let registry = InMemorySaeRegistry::new();
        registry.register(reg("MASTER0000000001"));
        registry.register(reg("SLAVE00000000001"));
        let policy = policy_with(registry);
        policy
            .check(
                "MASTER0000000001",
                EndpointKind::KeyRequest,
                "SLAVE00000000001",
                &[],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn key_request_rejects_master_equal_slave() {
        let registry = InMemorySaeRegistry::new();
        let policy = policy_with(registry);
        let err = policy
            .check(
                "MASTER0000000001",
                EndpointKind::KeyRequest,
                "MASTER0000000001",
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn key_request_checks_every_additional_slave() {
        let registry = InMemorySaeRegistry::new();
        registry.register(reg("MASTER0000000001"));
        registry.register(reg("SLAVE00000000001"));
        registry.register(reg("SLAVE00000000002"));
        registry.allow_pairing("MASTER0000000001", "SLAVE00000000001");
        // no explicit pairing for SLAVE...02, but since the table is
        // non-empty the fallback "any two active" no longer applies.
        let policy = policy_with(registry);
        let err = policy
            .check(
                "MASTER0000000001",
                EndpointKind::KeyRequest,
                "SLAVE00000000001",
                &["SLAVE00000000002".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::Forbidden(_)));
    }
}
