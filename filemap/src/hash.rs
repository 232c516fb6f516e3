use std::hash::Hasher;

use rustc_hash::FxHasher;

/// Maps key content to a 32-bit hash used to pick a primary slot.
///
/// Must be deterministic across processes: the bucket of every stored key
/// depends on it, so a file must always be reopened with the same hash.
pub trait KeyHash {
    fn hash_key(&self, key: &[u8]) -> u32;
}

/// Multiplicative string hash, `h = h * 131 + byte` in wrapping arithmetic.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bkdr;

impl KeyHash for Bkdr {
    fn hash_key(&self, key: &[u8]) -> u32 {
        key.iter()
            .take_while(|&&b| b != 0)
            .fold(0u32, |h, &b| h.wrapping_mul(131).wrapping_add(b as u32))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FxKeyHash;

impl KeyHash for FxKeyHash {
    fn hash_key(&self, key: &[u8]) -> u32 {
        let mut hasher = FxHasher::default();
        hasher.write(key);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }
}
