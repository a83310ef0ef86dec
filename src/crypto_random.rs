//! C3: `CryptoRandom` — process-wide cryptographically strong randomness.

use crate::error::KmeError;
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

/// Draws from the platform CSPRNG. All key identifiers and any key bytes
/// produced internally must come from this component.
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptoRandom;

impl CryptoRandom {
    pub fn new() -> Self {
        Self
    }

    /// Fails only on catastrophic entropy failure, surfaced as a fatal
    /// server error.
    pub fn random_bytes(&self, n: usize) -> Result<Vec<u8>, KmeError> {
        let mut buf = vec![0u8; n];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| KmeError::Internal(format!("entropy source failed: {e}")))?;
        Ok(buf)
    }

    pub fn new_uuid(&self) -> Uuid {
        Uuid::new_v4()
    }
}
