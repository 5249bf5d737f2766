//! Browser-shaped TLS.
//!
//! Three pieces cooperate here:
//!
//! - **Profiles** ([`profiles`]): named recipes reproducing the ClientHello
//!   of specific browser builds, plus seed-driven randomized variants.
//! - **Hello assembly** ([`hello`]): the byte-level ClientHello encoder the
//!   profiles feed, and the JA3 fingerprint math.
//! - **The dialer** ([`dialer`]): raw dial → optional obfuscation → TLS
//!   handshake → verification, under cooperative cancellation.
//!
//! An obfuscated session ticket ([`ticket`]) can be attached so the exchange
//! reads as session resumption, keeping the server certificate off the wire
//! on the TLS 1.2 path.

pub mod dialer;
pub mod hello;
pub mod profiles;
pub mod ticket;

pub use dialer::{
    dial, CustomTlsConfig, ObfuscationLayer, RawDialer, TcpDialer, TransportStream, TunnelConn,
};
pub use hello::{ClientHelloSpec, Extension};
pub use profiles::{
    is_randomized_profile, is_tls13_profile, make_client_hello_spec, profile_uses_obfuscator,
    select_tls_profile, HelloInputs, SUPPORTED_TLS_PROFILES,
};
pub use ticket::{new_obfuscated_session_state, ObfuscatedSessionState, TICKET_KEY_LENGTH};

/// Dial errors, by kind. The establishment layer treats these differently:
/// configuration errors are fatal at load, everything else abandons the
/// attempt and lets the iterator advance.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// Invalid configuration; never surfaced mid-dial.
    #[error("configuration error: {0}")]
    Config(String),

    /// Raw dial or connection failure.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// The TLS or obfuscator handshake was rejected.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Post-handshake verification failed.
    #[error("untrusted peer: {0}")]
    UntrustedPeer(String),

    /// The caller's context was canceled or timed out.
    #[error("canceled")]
    Canceled,
}
