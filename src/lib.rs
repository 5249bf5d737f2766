//! # Mirage Tunnel
//!
//! The dial/establishment core of a censorship-circumvention tunnel client.
//! Given a store of known servers, it picks candidates in rank order, dresses
//! each connection attempt up as ordinary browser traffic, and remembers what
//! worked so the next attempt can replay it.
//!
//! ## Features
//!
//! - **Candidate selection** with server affinity and replay-aware ordering
//! - **Obfuscated transport** using a seed-message stream-cipher handshake
//! - **TLS fingerprint mimicry** with byte-level browser ClientHello templates
//! - **Dial parameter replay** keyed by server and network
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Establishment Pipeline                │
//! │         (worker pool, first success wins)            │
//! ├─────────────────────────────────────────────────────┤
//! │                 Custom TLS Dialer                    │
//! │    (raw dial → obfuscation → handshake → verify)     │
//! ├──────────────────────────┬──────────────────────────┤
//! │   Fingerprint Assembler  │       Obfuscator         │
//! │  (browser ClientHellos)  │   (seed message + RC4)   │
//! ├──────────────────────────┴──────────────────────────┤
//! │           Server-Entry Store & Iterator              │
//! │     (rank order: affinity, replay, shuffled rest)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod dial;
pub mod obfuscation;
pub mod params;
pub mod store;
pub mod tls;

pub use config::Config;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parameter error: {0}")]
    Params(#[from] params::ParamError),

    #[error("Storage error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] obfuscation::ObfuscationError),

    #[error("Dial error: {0}")]
    Dial(#[from] tls::DialError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No server entry candidates remain")]
    CandidatesExhausted,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}
