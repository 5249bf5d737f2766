//! TLS profiles.
//!
//! Each named profile is a hard-coded recipe reproducing the ClientHello of
//! a specific browser build: cipher suites in exact order, extensions in
//! exact order, extension bodies, curves, point formats, signature
//! algorithms, ALPN, and padding style. Randomized profiles instead assemble
//! a hello deterministically from a seed.

use rand::Rng;

use crate::obfuscation::Seed;
use crate::params::{ParameterSnapshot, LIMIT_TLS_PROFILES};

use super::hello::{
    grease_value, randomized_spec, randomized_tls13_spec, ClientHelloSpec, Extension,
};

/// GREASE values from RFC 8701. Browsers sprinkle these through cipher and
/// extension lists so middleboxes stay tolerant of unknowns.
pub const GREASE_VALUES: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

/// TLS cipher suite identifiers
#[allow(dead_code)]
pub mod cipher_suites {
    // TLS 1.3
    pub const TLS13_AES_128_GCM_SHA256: u16 = 0x1301;
    pub const TLS13_AES_256_GCM_SHA384: u16 = 0x1302;
    pub const TLS13_CHACHA20_POLY1305_SHA256: u16 = 0x1303;

    // ECDHE AEAD
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: u16 = 0xc02b;
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: u16 = 0xc02f;
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: u16 = 0xc02c;
    pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: u16 = 0xc030;
    pub const TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305: u16 = 0xcca9;
    pub const TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305: u16 = 0xcca8;

    // Pre-standard ChaCha20 ids still sent by older mobile stacks.
    pub const OLD_TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305: u16 = 0xcc13;
    pub const OLD_TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305: u16 = 0xcc14;
    pub const OLD_TLS_DHE_RSA_WITH_CHACHA20_POLY1305: u16 = 0xcc15;

    // CBC and legacy
    pub const TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA: u16 = 0xc013;
    pub const TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA: u16 = 0xc014;
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA: u16 = 0xc009;
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA: u16 = 0xc00a;
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256: u16 = 0xc023;
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384: u16 = 0xc024;
    pub const TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256: u16 = 0xc027;
    pub const TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384: u16 = 0xc028;
    pub const TLS_ECDHE_RSA_WITH_RC4_128_SHA: u16 = 0xc011;
    pub const TLS_ECDHE_ECDSA_WITH_RC4_128_SHA: u16 = 0xc007;
    pub const TLS_RSA_WITH_AES_128_GCM_SHA256: u16 = 0x009c;
    pub const TLS_RSA_WITH_AES_256_GCM_SHA384: u16 = 0x009d;
    pub const TLS_DHE_RSA_WITH_AES_128_GCM_SHA256: u16 = 0x009e;
    pub const TLS_DHE_RSA_WITH_AES_128_CBC_SHA: u16 = 0x0033;
    pub const TLS_DHE_RSA_WITH_AES_256_CBC_SHA: u16 = 0x0039;
    pub const TLS_RSA_WITH_AES_128_CBC_SHA: u16 = 0x002f;
    pub const TLS_RSA_WITH_AES_256_CBC_SHA: u16 = 0x0035;
    pub const TLS_RSA_WITH_AES_128_CBC_SHA256: u16 = 0x003c;
    pub const TLS_RSA_WITH_AES_256_CBC_SHA256: u16 = 0x003d;
    pub const TLS_RSA_WITH_3DES_EDE_CBC_SHA: u16 = 0x000a;
    pub const TLS_RSA_WITH_RC4_128_SHA: u16 = 0x0005;
    pub const TLS_RSA_WITH_RC4_128_MD5: u16 = 0x0004;
    pub const TLS_EMPTY_RENEGOTIATION_INFO_SCSV: u16 = 0x00ff;
}

/// Supported groups (elliptic curves)
pub mod curves {
    pub const X25519: u16 = 0x001d;
    pub const SECP256R1: u16 = 0x0017;
    pub const SECP384R1: u16 = 0x0018;
    pub const SECP521R1: u16 = 0x0019;
}

/// EC point formats
pub mod point_formats {
    pub const UNCOMPRESSED: u8 = 0x00;
}

/// Signature algorithm (hash, signature) pairs as wire u16 values.
#[allow(dead_code)]
pub mod signature_algorithms {
    pub const RSA_PKCS1_SHA1: u16 = 0x0201;
    pub const ECDSA_SHA1: u16 = 0x0203;
    pub const RSA_PKCS1_SHA224: u16 = 0x0301;
    pub const ECDSA_SHA224: u16 = 0x0303;
    pub const RSA_PKCS1_SHA256: u16 = 0x0401;
    pub const ECDSA_SHA256: u16 = 0x0403;
    pub const RSA_PKCS1_SHA384: u16 = 0x0501;
    pub const ECDSA_SHA384: u16 = 0x0503;
    pub const RSA_PKCS1_SHA512: u16 = 0x0601;
    pub const ECDSA_SHA512: u16 = 0x0603;
    pub const RSA_PSS_SHA256: u16 = 0x0804;
    pub const RSA_PSS_SHA384: u16 = 0x0805;
    pub const RSA_PSS_SHA512: u16 = 0x0806;
}

pub const TLS_PROFILE_CHROME_57: &str = "chrome-57";
pub const TLS_PROFILE_CHROME_58: &str = "chrome-58";
pub const TLS_PROFILE_CHROME_62: &str = "chrome-62";
pub const TLS_PROFILE_FIREFOX_55: &str = "firefox-55";
pub const TLS_PROFILE_FIREFOX_56: &str = "firefox-56";
pub const TLS_PROFILE_IOS_SAFARI_11: &str = "ios-safari-11";
pub const TLS_PROFILE_ANDROID_51: &str = "android-51";
pub const TLS_PROFILE_ANDROID_60: &str = "android-60";
pub const TLS_PROFILE_RANDOMIZED: &str = "randomized";
pub const TLS_PROFILE_TLS13_RANDOMIZED: &str = "tls13-randomized";

/// All profiles this client can emit.
pub const SUPPORTED_TLS_PROFILES: [&str; 10] = [
    TLS_PROFILE_CHROME_57,
    TLS_PROFILE_CHROME_58,
    TLS_PROFILE_CHROME_62,
    TLS_PROFILE_FIREFOX_55,
    TLS_PROFILE_FIREFOX_56,
    TLS_PROFILE_IOS_SAFARI_11,
    TLS_PROFILE_ANDROID_51,
    TLS_PROFILE_ANDROID_60,
    TLS_PROFILE_RANDOMIZED,
    TLS_PROFILE_TLS13_RANDOMIZED,
];

/// Whether the profile's hello is assembled from a PRNG seed.
pub fn is_randomized_profile(profile: &str) -> bool {
    profile == TLS_PROFILE_RANDOMIZED || profile == TLS_PROFILE_TLS13_RANDOMIZED
}

/// Whether the profile negotiates TLS 1.3. TLS 1.3 encrypts the server
/// certificate on its own, so these profiles skip the obfuscator layer.
pub fn is_tls13_profile(profile: &str) -> bool {
    profile == TLS_PROFILE_TLS13_RANDOMIZED
}

/// Whether dials with this profile layer the obfuscator under TLS.
pub fn profile_uses_obfuscator(profile: &str) -> bool {
    !is_tls13_profile(profile)
}

/// Pick a profile uniformly at random from the snapshot's whitelist
/// intersected with the supported set; over all supported profiles when no
/// whitelist is published. `None` when the intersection is empty.
pub fn select_tls_profile(snapshot: &ParameterSnapshot) -> Option<String> {
    let limit = snapshot.string_list(LIMIT_TLS_PROFILES);
    let candidates: Vec<&str> = SUPPORTED_TLS_PROFILES
        .iter()
        .copied()
        .filter(|profile| limit.is_empty() || limit.iter().any(|name| name == profile))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let choice = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates[choice].to_string())
}

/// Inputs for assembling a profile's ClientHello.
pub struct HelloInputs<'a> {
    /// SNI to present; `None` omits the server_name extension body.
    pub server_name: Option<&'a str>,
    /// A fabricated or cached session ticket to attach, making the exchange
    /// look like a resumption.
    pub session_ticket: Option<Vec<u8>>,
    /// The 32-byte hello random; GREASE values derive from it.
    pub random: &'a [u8; 32],
    /// Seed for randomized profiles.
    pub hello_seed: Option<&'a Seed>,
}

/// Assemble the ClientHello spec for a named profile. `None` for unknown
/// profiles, or when a randomized profile is missing its seed.
pub fn make_client_hello_spec(profile: &str, inputs: &HelloInputs) -> Option<ClientHelloSpec> {
    match profile {
        TLS_PROFILE_CHROME_57 => Some(chrome_spec(inputs, true)),
        TLS_PROFILE_CHROME_58 | TLS_PROFILE_CHROME_62 => Some(chrome_spec(inputs, false)),
        TLS_PROFILE_FIREFOX_55 | TLS_PROFILE_FIREFOX_56 => Some(firefox_spec(inputs)),
        TLS_PROFILE_IOS_SAFARI_11 => Some(ios_safari_spec(inputs)),
        TLS_PROFILE_ANDROID_51 => Some(android_5_1_spec(inputs)),
        TLS_PROFILE_ANDROID_60 => Some(android_6_0_spec(inputs)),
        TLS_PROFILE_RANDOMIZED => {
            let seed = inputs.hello_seed?;
            // The ALPN/no-ALPN split is itself a seeded decision so the
            // whole hello replays from the seed.
            let include_alpn =
                crate::obfuscation::SeededPrng::with_salt(seed, "randomized-alpn")
                    .flip_weighted_coin(0.5);
            Some(randomized_spec(
                seed,
                inputs.server_name,
                inputs.session_ticket.clone(),
                include_alpn,
            ))
        }
        TLS_PROFILE_TLS13_RANDOMIZED => {
            let seed = inputs.hello_seed?;
            let include_alpn =
                crate::obfuscation::SeededPrng::with_salt(seed, "randomized-alpn")
                    .flip_weighted_coin(0.5);
            Some(randomized_tls13_spec(seed, inputs.server_name, include_alpn))
        }
        _ => None,
    }
}

fn ticket_session_id(session_ticket: &Option<Vec<u8>>) -> Vec<u8> {
    match session_ticket {
        Some(ticket) if !ticket.is_empty() => {
            use sha2::{Digest, Sha256};
            Sha256::digest(ticket).to_vec()
        }
        _ => Vec::new(),
    }
}

fn chrome_spec(inputs: &HelloInputs, include_old_chacha: bool) -> ClientHelloSpec {
    use cipher_suites::*;

    let mut suites = vec![grease_value(inputs.random, 0)];
    suites.extend([
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305,
    ]);
    if include_old_chacha {
        suites.extend([
            OLD_TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305,
            OLD_TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305,
        ]);
    }
    suites.extend([
        TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
        TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
        TLS_RSA_WITH_AES_128_GCM_SHA256,
        TLS_RSA_WITH_AES_256_GCM_SHA384,
        TLS_RSA_WITH_AES_128_CBC_SHA,
        TLS_RSA_WITH_AES_256_CBC_SHA,
        TLS_RSA_WITH_3DES_EDE_CBC_SHA,
    ]);

    let grease_ext1 = grease_value(inputs.random, 2);
    let mut grease_ext2 = grease_value(inputs.random, 3);
    if grease_ext1 == grease_ext2 {
        grease_ext2 ^= 0x1010;
    }

    ClientHelloSpec {
        tls_version: 0x0303,
        cipher_suites: suites,
        compression_methods: vec![0x00],
        session_id: ticket_session_id(&inputs.session_ticket),
        extensions: vec![
            Extension::Grease {
                value: grease_ext1,
                body: Vec::new(),
            },
            Extension::RenegotiationInfo,
            Extension::ServerName(inputs.server_name.unwrap_or_default().to_string()),
            Extension::ExtendedMasterSecret,
            Extension::SessionTicket(inputs.session_ticket.clone().unwrap_or_default()),
            Extension::SignatureAlgorithms(vec![
                signature_algorithms::ECDSA_SHA256,
                signature_algorithms::RSA_PSS_SHA256,
                signature_algorithms::RSA_PKCS1_SHA256,
                signature_algorithms::ECDSA_SHA384,
                signature_algorithms::RSA_PSS_SHA384,
                signature_algorithms::RSA_PKCS1_SHA384,
                signature_algorithms::RSA_PSS_SHA512,
                signature_algorithms::RSA_PKCS1_SHA512,
                signature_algorithms::RSA_PKCS1_SHA1,
            ]),
            Extension::StatusRequest,
            Extension::Sct,
            Extension::Alpn(vec!["h2".to_string(), "http/1.1".to_string()]),
            Extension::ChannelId,
            Extension::PointFormats(vec![point_formats::UNCOMPRESSED]),
            Extension::SupportedGroups(vec![
                grease_value(inputs.random, 1),
                curves::X25519,
                curves::SECP256R1,
                curves::SECP384R1,
            ]),
            Extension::Grease {
                value: grease_ext2,
                body: vec![0x00],
            },
            Extension::Padding,
        ],
    }
}

fn firefox_spec(inputs: &HelloInputs) -> ClientHelloSpec {
    use cipher_suites::*;

    ClientHelloSpec {
        tls_version: 0x0303,
        cipher_suites: vec![
            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305,
            TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305,
            TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
            TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
            TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
            TLS_DHE_RSA_WITH_AES_128_CBC_SHA,
            TLS_DHE_RSA_WITH_AES_256_CBC_SHA,
            TLS_RSA_WITH_AES_128_CBC_SHA,
            TLS_RSA_WITH_AES_256_CBC_SHA,
            TLS_RSA_WITH_3DES_EDE_CBC_SHA,
        ],
        compression_methods: vec![0x00],
        session_id: ticket_session_id(&inputs.session_ticket),
        extensions: vec![
            Extension::ServerName(inputs.server_name.unwrap_or_default().to_string()),
            Extension::ExtendedMasterSecret,
            Extension::RenegotiationInfo,
            Extension::SupportedGroups(vec![
                curves::X25519,
                curves::SECP256R1,
                curves::SECP384R1,
                curves::SECP521R1,
            ]),
            Extension::PointFormats(vec![point_formats::UNCOMPRESSED]),
            Extension::SessionTicket(inputs.session_ticket.clone().unwrap_or_default()),
            Extension::Alpn(vec!["h2".to_string(), "http/1.1".to_string()]),
            Extension::StatusRequest,
            Extension::SignatureAlgorithms(vec![
                signature_algorithms::ECDSA_SHA256,
                signature_algorithms::ECDSA_SHA384,
                signature_algorithms::ECDSA_SHA512,
                signature_algorithms::RSA_PSS_SHA256,
                signature_algorithms::RSA_PSS_SHA384,
                signature_algorithms::RSA_PSS_SHA512,
                signature_algorithms::RSA_PKCS1_SHA256,
                signature_algorithms::RSA_PKCS1_SHA384,
                signature_algorithms::RSA_PKCS1_SHA512,
                signature_algorithms::ECDSA_SHA1,
                signature_algorithms::RSA_PKCS1_SHA1,
            ]),
            Extension::Padding,
        ],
    }
}

fn ios_safari_spec(inputs: &HelloInputs) -> ClientHelloSpec {
    use cipher_suites::*;

    ClientHelloSpec {
        tls_version: 0x0303,
        cipher_suites: vec![
            TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384,
            TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
            TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305,
            TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384,
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256,
            TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
            TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305,
            TLS_RSA_WITH_AES_256_GCM_SHA384,
            TLS_RSA_WITH_AES_128_GCM_SHA256,
            TLS_RSA_WITH_AES_256_CBC_SHA256,
            TLS_RSA_WITH_AES_128_CBC_SHA256,
            TLS_RSA_WITH_AES_256_CBC_SHA,
            TLS_RSA_WITH_AES_128_CBC_SHA,
        ],
        compression_methods: vec![0x00],
        session_id: ticket_session_id(&inputs.session_ticket),
        extensions: vec![
            Extension::RenegotiationInfo,
            Extension::ServerName(inputs.server_name.unwrap_or_default().to_string()),
            Extension::ExtendedMasterSecret,
            Extension::SessionTicket(inputs.session_ticket.clone().unwrap_or_default()),
            Extension::SignatureAlgorithms(vec![
                signature_algorithms::ECDSA_SHA256,
                signature_algorithms::RSA_PSS_SHA256,
                signature_algorithms::RSA_PKCS1_SHA256,
                signature_algorithms::ECDSA_SHA384,
                signature_algorithms::RSA_PSS_SHA384,
                signature_algorithms::RSA_PKCS1_SHA384,
                signature_algorithms::RSA_PSS_SHA512,
                signature_algorithms::RSA_PKCS1_SHA512,
                signature_algorithms::RSA_PKCS1_SHA1,
            ]),
            Extension::StatusRequest,
            Extension::NextProtocolNegotiation,
            Extension::Sct,
            Extension::Alpn(vec![
                "h2".to_string(),
                "h2-16".to_string(),
                "h2-15".to_string(),
                "h2-14".to_string(),
                "spdy/3.1".to_string(),
                "spdy/3".to_string(),
                "http/1.1".to_string(),
            ]),
            Extension::PointFormats(vec![point_formats::UNCOMPRESSED]),
            Extension::SupportedGroups(vec![
                curves::X25519,
                curves::SECP256R1,
                curves::SECP384R1,
                curves::SECP521R1,
            ]),
        ],
    }
}

fn android_6_0_spec(inputs: &HelloInputs) -> ClientHelloSpec {
    use cipher_suites::*;

    ClientHelloSpec {
        tls_version: 0x0303,
        cipher_suites: vec![
            OLD_TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305,
            OLD_TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305,
            OLD_TLS_DHE_RSA_WITH_CHACHA20_POLY1305,
            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_DHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
            TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
            TLS_DHE_RSA_WITH_AES_256_CBC_SHA,
            TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
            TLS_DHE_RSA_WITH_AES_128_CBC_SHA,
            TLS_RSA_WITH_AES_128_GCM_SHA256,
            TLS_RSA_WITH_AES_256_CBC_SHA,
            TLS_RSA_WITH_AES_128_CBC_SHA,
            TLS_RSA_WITH_3DES_EDE_CBC_SHA,
            TLS_EMPTY_RENEGOTIATION_INFO_SCSV,
        ],
        compression_methods: vec![0x00],
        session_id: ticket_session_id(&inputs.session_ticket),
        extensions: vec![
            Extension::ServerName(inputs.server_name.unwrap_or_default().to_string()),
            Extension::ExtendedMasterSecret,
            Extension::SessionTicket(inputs.session_ticket.clone().unwrap_or_default()),
            Extension::SignatureAlgorithms(vec![
                signature_algorithms::RSA_PKCS1_SHA512,
                signature_algorithms::ECDSA_SHA512,
                signature_algorithms::RSA_PKCS1_SHA384,
                signature_algorithms::ECDSA_SHA384,
                signature_algorithms::RSA_PKCS1_SHA256,
                signature_algorithms::ECDSA_SHA256,
                signature_algorithms::RSA_PKCS1_SHA224,
                signature_algorithms::ECDSA_SHA224,
                signature_algorithms::RSA_PKCS1_SHA1,
                signature_algorithms::ECDSA_SHA1,
            ]),
            Extension::StatusRequest,
            Extension::NextProtocolNegotiation,
            Extension::Sct,
            Extension::Alpn(vec!["http/1.1".to_string(), "spdy/8.1".to_string()]),
            Extension::PointFormats(vec![point_formats::UNCOMPRESSED]),
            Extension::SupportedGroups(vec![curves::SECP256R1, curves::SECP384R1]),
            Extension::Padding,
        ],
    }
}

fn android_5_1_spec(inputs: &HelloInputs) -> ClientHelloSpec {
    use cipher_suites::*;

    ClientHelloSpec {
        tls_version: 0x0303,
        cipher_suites: vec![
            OLD_TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305,
            OLD_TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305,
            OLD_TLS_DHE_RSA_WITH_CHACHA20_POLY1305,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            TLS_DHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
            TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
            TLS_DHE_RSA_WITH_AES_256_CBC_SHA,
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
            TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            TLS_DHE_RSA_WITH_AES_128_CBC_SHA,
            TLS_ECDHE_RSA_WITH_RC4_128_SHA,
            TLS_ECDHE_ECDSA_WITH_RC4_128_SHA,
            TLS_RSA_WITH_AES_128_GCM_SHA256,
            TLS_RSA_WITH_AES_256_CBC_SHA,
            TLS_RSA_WITH_AES_128_CBC_SHA,
            TLS_RSA_WITH_RC4_128_SHA,
            TLS_RSA_WITH_RC4_128_MD5,
            TLS_RSA_WITH_3DES_EDE_CBC_SHA,
            TLS_EMPTY_RENEGOTIATION_INFO_SCSV,
        ],
        compression_methods: vec![0x00],
        session_id: ticket_session_id(&inputs.session_ticket),
        extensions: vec![
            Extension::ServerName(inputs.server_name.unwrap_or_default().to_string()),
            Extension::SessionTicket(inputs.session_ticket.clone().unwrap_or_default()),
            Extension::SignatureAlgorithms(vec![
                signature_algorithms::RSA_PKCS1_SHA512,
                signature_algorithms::ECDSA_SHA512,
                signature_algorithms::RSA_PKCS1_SHA384,
                signature_algorithms::ECDSA_SHA384,
                signature_algorithms::RSA_PKCS1_SHA256,
                signature_algorithms::ECDSA_SHA256,
                signature_algorithms::RSA_PKCS1_SHA224,
                signature_algorithms::ECDSA_SHA224,
                signature_algorithms::RSA_PKCS1_SHA1,
                signature_algorithms::ECDSA_SHA1,
            ]),
            Extension::StatusRequest,
            Extension::NextProtocolNegotiation,
            Extension::Sct,
            Extension::Alpn(vec![
                "http/1.1".to_string(),
                "spdy/3".to_string(),
                "spdy/3.1".to_string(),
            ]),
            Extension::PointFormats(vec![point_formats::UNCOMPRESSED]),
            Extension::SupportedGroups(vec![
                curves::SECP256R1,
                curves::SECP384R1,
                curves::SECP521R1,
            ]),
            Extension::Padding,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::SEED_LENGTH;
    use crate::params::Parameters;
    use std::collections::HashMap;

    fn inputs<'a>(random: &'a [u8; 32], seed: Option<&'a Seed>) -> HelloInputs<'a> {
        HelloInputs {
            server_name: Some("www.example.org"),
            session_ticket: None,
            random,
            hello_seed: seed,
        }
    }

    #[test]
    fn test_every_supported_profile_assembles() {
        let random = [0x11u8; 32];
        let seed = Seed::from_bytes(&[4u8; SEED_LENGTH]).unwrap();
        for profile in SUPPORTED_TLS_PROFILES {
            let spec = make_client_hello_spec(profile, &inputs(&random, Some(&seed)));
            assert!(spec.is_some(), "profile {profile} failed to assemble");
            let encoded = spec.unwrap().encode(&random);
            assert!(encoded.len() > 100, "profile {profile} suspiciously short");
        }
    }

    #[test]
    fn test_unknown_profile() {
        let random = [0u8; 32];
        assert!(make_client_hello_spec("netscape-4", &inputs(&random, None)).is_none());
    }

    #[test]
    fn test_randomized_profile_requires_seed() {
        let random = [0u8; 32];
        assert!(
            make_client_hello_spec(TLS_PROFILE_RANDOMIZED, &inputs(&random, None)).is_none()
        );
    }

    #[test]
    fn test_profiles_have_distinct_ja3() {
        let random = [0x22u8; 32];
        let chrome = make_client_hello_spec(TLS_PROFILE_CHROME_58, &inputs(&random, None))
            .unwrap()
            .ja3_string();
        let firefox = make_client_hello_spec(TLS_PROFILE_FIREFOX_56, &inputs(&random, None))
            .unwrap()
            .ja3_string();
        let safari = make_client_hello_spec(TLS_PROFILE_IOS_SAFARI_11, &inputs(&random, None))
            .unwrap()
            .ja3_string();
        assert_ne!(chrome, firefox);
        assert_ne!(chrome, safari);
        assert_ne!(firefox, safari);
    }

    #[test]
    fn test_chrome_grease_placement() {
        let random = [0x37u8; 32];
        let spec =
            make_client_hello_spec(TLS_PROFILE_CHROME_58, &inputs(&random, None)).unwrap();
        // First cipher suite and first extension are GREASE.
        assert!(GREASE_VALUES.contains(&spec.cipher_suites[0]));
        assert!(GREASE_VALUES.contains(&spec.extensions[0].extension_id()));
        // The two extension GREASE values differ.
        let grease_ids: Vec<u16> = spec
            .extensions
            .iter()
            .map(Extension::extension_id)
            .filter(|id| GREASE_VALUES.contains(id))
            .collect();
        assert_eq!(grease_ids.len(), 2);
        assert_ne!(grease_ids[0], grease_ids[1]);
    }

    #[test]
    fn test_session_ticket_attachment() {
        let random = [0x44u8; 32];
        let ticket = vec![0xAB; 192];
        let spec = make_client_hello_spec(
            TLS_PROFILE_CHROME_58,
            &HelloInputs {
                server_name: Some("www.example.org"),
                session_ticket: Some(ticket.clone()),
                random: &random,
                hello_seed: None,
            },
        )
        .unwrap();

        // The ticket rides in the session_ticket extension and the session
        // id mirrors it, as a real resuming client would.
        assert!(spec
            .extensions
            .iter()
            .any(|ext| matches!(ext, Extension::SessionTicket(body) if *body == ticket)));
        assert_eq!(spec.session_id.len(), 32);
    }

    #[test]
    fn test_tls13_profile_never_carries_session_ticket() {
        // Session tickets of the obfuscated form claim TLS 1.2; the 1.3
        // template must drop a supplied ticket rather than contradict its
        // own negotiated version.
        let random = [0x55u8; 32];
        let seed = Seed::from_bytes(&[8u8; SEED_LENGTH]).unwrap();
        let spec = make_client_hello_spec(
            TLS_PROFILE_TLS13_RANDOMIZED,
            &HelloInputs {
                server_name: Some("www.example.org"),
                session_ticket: Some(vec![0xAB; 192]),
                random: &random,
                hello_seed: Some(&seed),
            },
        )
        .unwrap();
        assert!(!spec
            .extensions
            .iter()
            .any(|ext| matches!(ext, Extension::SessionTicket(_))));
    }

    #[test]
    fn test_select_profile_respects_whitelist() {
        let params = Parameters::new();
        let mut apply = HashMap::new();
        apply.insert(
            crate::params::LIMIT_TLS_PROFILES.to_string(),
            serde_json::json!([TLS_PROFILE_FIREFOX_56]),
        );
        params.set("", false, &apply).unwrap();

        for _ in 0..20 {
            assert_eq!(
                select_tls_profile(&params.get()).as_deref(),
                Some(TLS_PROFILE_FIREFOX_56)
            );
        }

        // A whitelist with no supported members yields no selection.
        let mut apply = HashMap::new();
        apply.insert(
            crate::params::LIMIT_TLS_PROFILES.to_string(),
            serde_json::json!(["mosaic-1"]),
        );
        params.set("", false, &apply).unwrap();
        assert!(select_tls_profile(&params.get()).is_none());
    }

    #[test]
    fn test_select_profile_unconstrained_covers_all() {
        let params = Parameters::new();
        let snapshot = params.get();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            seen.insert(select_tls_profile(&snapshot).unwrap());
        }
        assert_eq!(seen.len(), SUPPORTED_TLS_PROFILES.len());
    }

    #[test]
    fn test_profile_classes() {
        assert!(is_randomized_profile(TLS_PROFILE_RANDOMIZED));
        assert!(is_randomized_profile(TLS_PROFILE_TLS13_RANDOMIZED));
        assert!(!is_randomized_profile(TLS_PROFILE_CHROME_58));

        assert!(is_tls13_profile(TLS_PROFILE_TLS13_RANDOMIZED));
        assert!(!is_tls13_profile(TLS_PROFILE_RANDOMIZED));

        // All non-1.3 profiles layer the obfuscator.
        for profile in SUPPORTED_TLS_PROFILES {
            assert_eq!(profile_uses_obfuscator(profile), !is_tls13_profile(profile));
        }
    }
}
