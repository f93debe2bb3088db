//! The input-mutation contract (§1, §4.7 step 1): `mutate(seed, max_len) →
//! bytes` is an external collaborator in the source system. `Mutator` is the
//! trait the master dispatches through; [`BitFlipMutator`] is a small
//! deterministic default so the crate is runnable standalone, not a
//! claim about mutation quality.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub trait Mutator: Send + Sync {
    fn mutate(&self, seed: &[u8], max_len: usize) -> Vec<u8>;
}

/// Flips a small number of random bits in a copy of `seed`, truncating or
/// zero-padding to `max_len`. Host-side, fuzzer-scheduling randomness only —
/// unrelated to the guest-visible `rdrand` path (§4.3.1), which must never
/// observe host entropy.
pub struct BitFlipMutator {
    rng_seed: u64,
}

impl BitFlipMutator {
    pub fn new(rng_seed: u64) -> Self {
        Self { rng_seed }
    }
}

impl Mutator for BitFlipMutator {
    fn mutate(&self, seed: &[u8], max_len: usize) -> Vec<u8> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.rng_seed ^ seed.len() as u64);
        let mut out = seed.to_vec();
        out.resize(max_len.max(1), 0);
        let max_flips = (out.len() / 16 + 1).max(4);
        let flips = rng.gen_range(1..=max_flips);
        for _ in 0..flips {
            let byte_index = rng.gen_range(0..out.len());
            let bit = rng.gen_range(0..8);
            out[byte_index] ^= 1 << bit;
        }
        out.truncate(max_len);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_never_exceeds_max_len() {
        let mutator = BitFlipMutator::new(1);
        let out = mutator.mutate(b"hello world this is a seed", 4);
        assert!(out.len() <= 4);
    }

    #[test]
    fn same_seed_and_input_are_deterministic() {
        let mutator = BitFlipMutator::new(42);
        let a = mutator.mutate(b"abc", 16);
        let b = mutator.mutate(b"abc", 16);
        assert_eq!(a, b);
    }

    #[test]
    fn short_seed_grows_to_max_len() {
        let mutator = BitFlipMutator::new(7);
        let out = mutator.mutate(b"a", 8);
        assert_eq!(out.len(), 8);
    }
}
