//! Seeded, replayable pseudorandom generation.
//!
//! Every randomized decision in the dial pipeline that may later be replayed
//! (obfuscator padding, randomized ClientHello assembly) is driven by a
//! [`SeededPrng`] so that persisting the 32-byte [`Seed`] is enough to
//! reproduce the exact wire image on a later attempt.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::ObfuscationError;

/// Length in bytes of a PRNG seed.
pub const SEED_LENGTH: usize = 32;

/// A seed for a replayable PRNG.
///
/// Seeds are persisted (hex-encoded) inside dial parameter records and
/// transmitted as the leading bytes of obfuscator padding, so the
/// representation is fixed at 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Seed([u8; SEED_LENGTH]);

impl Seed {
    /// Generate a fresh seed from the system entropy source.
    pub fn new() -> Result<Self, ObfuscationError> {
        let mut bytes = [0u8; SEED_LENGTH];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| ObfuscationError::EntropyFailure)?;
        Ok(Seed(bytes))
    }

    /// Build a seed from raw bytes. Returns `None` unless exactly
    /// [`SEED_LENGTH`] bytes are supplied.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; SEED_LENGTH] = bytes.try_into().ok()?;
        Some(Seed(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LENGTH] {
        &self.0
    }

    /// Derive an independent seed distinguished by `salt`.
    ///
    /// The same (seed, salt) pair always yields the same derived seed, which
    /// is what lets a server replay protocol decisions from the seed a client
    /// embedded in its obfuscator padding.
    pub fn derived(&self, salt: &str) -> Seed {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(salt.as_bytes());
        Seed(hasher.finalize().into())
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Seeds are secrets-adjacent; log a prefix only.
        write!(f, "Seed({}…)", hex::encode(&self.0[..4]))
    }
}

impl Serialize for Seed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Seed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Seed::from_bytes(&bytes)
            .ok_or_else(|| serde::de::Error::custom("seed must be 32 bytes"))
    }
}

/// A deterministic PRNG over a [`Seed`].
///
/// Two instances built from the same seed produce identical outputs for
/// identical call sequences.
pub struct SeededPrng {
    rng: StdRng,
}

impl SeededPrng {
    pub fn new(seed: &Seed) -> Self {
        SeededPrng {
            rng: StdRng::from_seed(*seed.as_bytes()),
        }
    }

    /// A PRNG over the seed derived from (`seed`, `salt`); independent of
    /// the stream produced by any other salt.
    pub fn with_salt(seed: &Seed, salt: &str) -> Self {
        SeededPrng::new(&seed.derived(salt))
    }

    /// Uniform integer in `[0, n)`. `n` must be positive.
    pub fn intn(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }

    /// Uniform integer in `[min, max]`.
    pub fn range(&mut self, min: usize, max: usize) -> usize {
        self.rng.gen_range(min..=max)
    }

    /// A uniform permutation of `[0, n)`.
    pub fn perm(&mut self, n: usize) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..n).collect();
        // Fisher-Yates
        for i in (1..n).rev() {
            let j = self.rng.gen_range(0..=i);
            perm.swap(i, j);
        }
        perm
    }

    /// Shuffle a slice in place, uniformly.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.rng.gen_range(0..=i);
            items.swap(i, j);
        }
    }

    /// Fair coin.
    pub fn flip_coin(&mut self) -> bool {
        self.rng.gen::<bool>()
    }

    /// Coin that lands heads with the given probability in `[0, 1]`.
    pub fn flip_weighted_coin(&mut self, probability: f64) -> bool {
        self.rng.gen::<f64>() <= probability
    }

    /// Fill a buffer with deterministic pseudorandom bytes.
    pub fn fill_bytes(&mut self, buf: &mut [u8]) {
        self.rng.fill(buf);
    }

    /// Padding of uniform length in `[min, max]`, filled with pseudorandom
    /// bytes.
    pub fn padding(&mut self, min: usize, max: usize) -> Vec<u8> {
        let len = self.range(min, max);
        let mut padding = vec![0u8; len];
        self.rng.fill(&mut padding[..]);
        padding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_seed(byte: u8) -> Seed {
        Seed::from_bytes(&[byte; SEED_LENGTH]).unwrap()
    }

    #[test]
    fn test_determinism() {
        let seed = fixed_seed(7);
        let mut a = SeededPrng::new(&seed);
        let mut b = SeededPrng::new(&seed);

        for _ in 0..100 {
            assert_eq!(a.intn(1000), b.intn(1000));
        }
        assert_eq!(a.perm(32), b.perm(32));
        assert_eq!(a.padding(10, 50), b.padding(10, 50));
    }

    #[test]
    fn test_salted_streams_are_independent() {
        let seed = fixed_seed(7);
        let mut a = SeededPrng::with_salt(&seed, "client-hello");
        let mut b = SeededPrng::with_salt(&seed, "obfuscator-padding");

        let va: Vec<usize> = (0..16).map(|_| a.intn(1 << 30)).collect();
        let vb: Vec<usize> = (0..16).map(|_| b.intn(1 << 30)).collect();
        assert_ne!(va, vb);

        // Same salt replays the same stream.
        let mut c = SeededPrng::with_salt(&seed, "client-hello");
        let vc: Vec<usize> = (0..16).map(|_| c.intn(1 << 30)).collect();
        assert_eq!(va, vc);
    }

    #[test]
    fn test_padding_bounds() {
        let seed = fixed_seed(3);
        let mut prng = SeededPrng::new(&seed);
        for _ in 0..200 {
            let padding = prng.padding(32, 64);
            assert!(padding.len() >= 32 && padding.len() <= 64);
        }
    }

    #[test]
    fn test_perm_is_permutation() {
        let mut prng = SeededPrng::new(&fixed_seed(9));
        let perm = prng.perm(100);
        let mut sorted = perm.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_seed_serde_roundtrip() {
        let seed = fixed_seed(0xAB);
        let json = serde_json::to_string(&seed).unwrap();
        let back: Seed = serde_json::from_str(&json).unwrap();
        assert_eq!(seed, back);
    }

    #[test]
    fn test_seed_from_bytes_length() {
        assert!(Seed::from_bytes(&[0u8; 31]).is_none());
        assert!(Seed::from_bytes(&[0u8; 33]).is_none());
        assert!(Seed::from_bytes(&[0u8; 32]).is_some());
    }
}
