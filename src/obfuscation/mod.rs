//! Traffic obfuscation layer
//!
//! Provides:
//! - The seed-message + stream-cipher obfuscator framing
//! - Replayable seeded PRNGs for padding and protocol randomness
//! - An async stream adapter layering the obfuscator onto a connection
//!
//! ## Replay
//!
//! The obfuscator's padding is generated from a persisted seed, and the
//! server reuses the leading padding bytes to seed its own randomness. A
//! client that replays the seed therefore reproduces not just its own wire
//! image but the server's downstream protocol decisions too.

mod obfuscator;
pub mod prng;
mod stream;

pub use obfuscator::{
    Obfuscator, ObfuscatorConfig, OBFUSCATE_MAGIC_VALUE, OBFUSCATE_MAX_PADDING,
    OBFUSCATE_SEED_LENGTH,
};
pub use prng::{Seed, SeededPrng, SEED_LENGTH};
pub use stream::ObfuscatedStream;

/// Obfuscation errors
#[derive(Debug, thiserror::Error)]
pub enum ObfuscationError {
    #[error("system entropy source failed")]
    EntropyFailure,

    #[error("invalid padding range: min {min}, max {max}")]
    InvalidPaddingRange { min: usize, max: usize },

    #[error("client obfuscator requires a padding seed")]
    MissingPaddingSeed,

    #[error("invalid magic value: {0:#010x}")]
    InvalidMagic(u32),

    #[error("invalid padding length: {0}")]
    InvalidPaddingLength(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
