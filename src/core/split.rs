//! Training/validation split.
//!
//! The split is made once per group, at record level: all clips of one
//! record land on the same side. Combining groups later never re-splits.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

/// Number of items that go to validation.
///
/// Training takes `floor((1 - ratio) * n)` and validation the remainder, so a
/// lone item lands in validation.
pub fn validation_count(n: usize, ratio: f64) -> usize {
    let ratio = ratio.clamp(0.0, 1.0);
    let training = (n as f64 * (1.0 - ratio)).floor() as usize;
    n - training.min(n)
}

/// Shuffle `items` and split them into `(training, validation)`
pub fn split_items<T>(mut items: Vec<T>, ratio: f64, rng: &mut StdRng) -> (Vec<T>, Vec<T>) {
    items.shuffle(rng);
    let validation_len = validation_count(items.len(), ratio);
    let validation = items.split_off(items.len() - validation_len);
    (items, validation)
}

/// RNG for one group's split.
///
/// With a base seed the split is reproducible per group; without one every
/// run draws fresh randomness.
pub fn split_rng(group_id: &str, base_seed: Option<u64>) -> StdRng {
    match base_seed {
        Some(seed) => StdRng::seed_from_u64(derive_seed(group_id, seed)),
        None => StdRng::seed_from_u64(rand::random()),
    }
}

fn derive_seed(group_id: &str, base_seed: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(base_seed.to_le_bytes());
    hasher.update(group_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
