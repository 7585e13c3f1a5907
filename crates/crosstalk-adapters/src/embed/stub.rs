//! Deterministic stub embedder.
//!
//! Grounded on the original's `stub_embedder_consumer.py::stub_embedding`:
//! seed a PRNG from `SHA-256(org_id || message_id || text[:128])` and draw
//! `D` uniform floats in `[-1, 1]`, then L2-normalize. Ported with
//! `rand::rngs::StdRng::seed_from_u64` fed by the first 8 bytes of the
//! digest (the same construction as the Python `int.from_bytes(h[:8],
//! "big")`), so a given `(org_id, message_id, text)` triple always produces
//! the same vector across languages and across repeated runs.

use crosstalk_ports::{EmbedError, Embedder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const TEXT_PREFIX_LEN: usize = 128;

fn stable_seed(org_id: &str, message_id: Uuid, text: &str) -> u64 {
    let prefix: String = text.chars().take(TEXT_PREFIX_LEN).collect();

    let mut hasher = Sha256::new();
    hasher.update(org_id.as_bytes());
    hasher.update(message_id.to_string().as_bytes());
    hasher.update(prefix.as_bytes());
    let digest = hasher.finalize();

    let mut seed_bytes = [0u8; 8];
    seed_bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(seed_bytes)
}

/// Deterministic stub embedder. Never fails, never calls out over the network.
pub struct StubEmbedder {
    model_version: String,
    dim: usize,
}

impl StubEmbedder {
    #[must_use]
    pub fn new(model_version: String, dim: usize) -> Self {
        Self { model_version, dim }
    }
}

impl Embedder for StubEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(
        &self,
        org_id: &str,
        message_id: Uuid,
        text: &str,
    ) -> Result<Vec<f32>, EmbedError> {
        let seed = stable_seed(org_id, message_id, text);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut embedding: Vec<f32> = (0..self.dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        crosstalk_domain::l2_normalize(&mut embedding);
        Ok(embedding)
    }
}
