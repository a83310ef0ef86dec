//! C2: `SAERegistry` — external collaborator mapping a SAE identifier to
//! its registration record. SAE on-boarding tooling is out of scope;
//! this module only consumes the registry.

use crate::model::{SaeId, SaeRegistration, SaeStatus};
use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait SaeRegistry: Send + Sync {
    async fn lookup(&self, sae_id: &str) -> Option<SaeRegistration>;

    async fn is_active(&self, sae_id: &str) -> bool {
        matches!(
            self.lookup(sae_id).await,
            Some(reg) if reg.status == SaeStatus::Active
        )
    }

    /// Whether `master` is permitted to pair with `slave` as master→slave.
    /// Relationships are symmetric registrations: a deployment registers
    /// the pairs it wants to allow. The default in-memory registry treats
    /// "both active and both registered" as sufficient; a stricter
    /// deployment policy can be layered on by swapping this trait impl.
    async fn has_pairing(&self, master: &str, slave: &str) -> bool {
        self.is_active(master).await && self.is_active(slave).await
    }
}

/// Reference in-memory registry, seeded at construction time. A real
/// deployment would back this with the operator's SAE on-boarding system.
pub struct InMemorySaeRegistry {
    entries: DashMap<SaeId, SaeRegistration>,
    /// Explicit master→slave pairings, when the deployment wants to
    /// restrict beyond "both active".
    pairings: DashMap<(SaeId, SaeId), ()>,
}

impl InMemorySaeRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            pairings: DashMap::new(),
        }
    }

    pub fn register(&self, reg: SaeRegistration) {
        self.entries.insert(reg.sae_id.clone(), reg);
    }

    pub fn allow_pairing(&self, master: &str, slave: &str) {
        self.pairings
            .insert((master.to_string(), slave.to_string()), ());
    }
}

impl Default for InMemorySaeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SaeRegistry for InMemorySaeRegistry {
    async fn lookup(&self, sae_id: &str) -> Option<SaeRegistration> {
        self.entries.get(sae_id).map(|e| e.value().clone())
    }

    async fn has_pairing(&self, master: &str, slave: &str) -> bool {
        if !self.is_active(master).await || !self.is_active(slave).await {
            return false;
        }
        if self.pairings.is_empty() {
            // No explicit pairing table configured: fall back to
            // "any two active, registered SAEs may pair".
            return true;
        }
        self.pairings
            .contains_key(&(master.to_string(), slave.to_string()))
    }
}
