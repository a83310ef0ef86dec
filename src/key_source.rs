//! C1: `KeySource` — the (notionally QKD-derived) source of fresh key
//! octet strings. A single interface,
//! `KeySource::fetch(size_bits, count) -> [bytes]`, is sufficient; it is
//! parameterized by `(source_kme_id, target_kme_id)` to allow per-link
//! sources later without reshaping callers.

use crate::crypto_random::CryptoRandom;
use crate::error::KmeError;
use async_trait::async_trait;

#[async_trait]
pub trait KeySource: Send + Sync {
    /// Yields `count` freshly generated octet strings, each `size_bits / 8`
    /// bytes long, for the given KME link.
    async fn fetch(
        &self,
        source_kme_id: &str,
        target_kme_id: &str,
        size_bits: u32,
        count: u32,
    ) -> Result<Vec<Vec<u8>>, KmeError>;
}

/// Reference key source: a mock CSPRNG. A real deployment swaps this for
/// an adapter over the actual QKD link without touching any caller.
pub struct MockKeySource {
    rng: CryptoRandom,
}

impl MockKeySource {
    pub fn new() -> Self {
        Self {
            rng: CryptoRandom::new(),
        }
    }
}

impl Default for MockKeySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeySource for MockKeySource {
    async fn fetch(
        &self,
        source_kme_id: &str,
        target_kme_id: &str,
        size_bits: u32,
        count: u32,
    ) -> Result<Vec<Vec<u8>>, KmeError> {
        tracing::debug!(
            source_kme_id,
            target_kme_id,
            size_bits,
            count,
            "drawing key material from mock QKD source"
        );
        let size_bytes = (size_bits / 8) as usize;
        (0..count)
            .map(|_| self.rng.random_bytes(size_bytes))
            .collect()
    }
}
