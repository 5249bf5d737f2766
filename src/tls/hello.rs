//! ClientHello construction.
//!
//! A [`ClientHelloSpec`] is the exact recipe for one ClientHello: cipher
//! suites in order, extensions in order, and extension bodies. Profile
//! templates produce specs that match a target browser build byte-for-byte
//! (up to genuine randomness); the encoder renders a spec to wire bytes.
//!
//! Randomized specs are assembled entirely from a [`SeededPrng`], so the
//! same (profile, seed) pair always renders the same bytes. That determinism
//! is the replay lever: persist the seed, replay the hello.

use crate::obfuscation::{Seed, SeededPrng};

use super::profiles::{
    cipher_suites::*, curves, point_formats, signature_algorithms as sigalg, GREASE_VALUES,
};

/// TLS extension identifiers used by the encoder.
pub mod extension_ids {
    pub const SERVER_NAME: u16 = 0x0000;
    pub const STATUS_REQUEST: u16 = 0x0005;
    pub const SUPPORTED_GROUPS: u16 = 0x000a;
    pub const EC_POINT_FORMATS: u16 = 0x000b;
    pub const SIGNATURE_ALGORITHMS: u16 = 0x000d;
    pub const ALPN: u16 = 0x0010;
    pub const SCT: u16 = 0x0012;
    pub const PADDING: u16 = 0x0015;
    pub const EXTENDED_MASTER_SECRET: u16 = 0x0017;
    pub const SESSION_TICKET: u16 = 0x0023;
    pub const SUPPORTED_VERSIONS: u16 = 0x002b;
    pub const PSK_KEY_EXCHANGE_MODES: u16 = 0x002d;
    pub const KEY_SHARE: u16 = 0x0033;
    pub const NEXT_PROTOCOL_NEGOTIATION: u16 = 0x3374;
    pub const CHANNEL_ID: u16 = 0x7550;
    pub const RENEGOTIATION_INFO: u16 = 0xff01;
}

/// One ClientHello extension, ordered and bodied exactly as it will appear
/// on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Extension {
    ServerName(String),
    ExtendedMasterSecret,
    RenegotiationInfo,
    SupportedGroups(Vec<u16>),
    PointFormats(Vec<u8>),
    /// Body is the session ticket; empty requests a fresh ticket.
    SessionTicket(Vec<u8>),
    Alpn(Vec<String>),
    StatusRequest,
    SignatureAlgorithms(Vec<u16>),
    Sct,
    NextProtocolNegotiation,
    ChannelId,
    SupportedVersions(Vec<u16>),
    PskKeyExchangeModes(Vec<u8>),
    KeyShare(Vec<(u16, Vec<u8>)>),
    Grease { value: u16, body: Vec<u8> },
    /// BoringSSL-style padding, sized at encode time.
    Padding,
}

impl Extension {
    pub fn extension_id(&self) -> u16 {
        use extension_ids::*;
        match self {
            Extension::ServerName(_) => SERVER_NAME,
            Extension::ExtendedMasterSecret => EXTENDED_MASTER_SECRET,
            Extension::RenegotiationInfo => RENEGOTIATION_INFO,
            Extension::SupportedGroups(_) => SUPPORTED_GROUPS,
            Extension::PointFormats(_) => EC_POINT_FORMATS,
            Extension::SessionTicket(_) => SESSION_TICKET,
            Extension::Alpn(_) => ALPN,
            Extension::StatusRequest => STATUS_REQUEST,
            Extension::SignatureAlgorithms(_) => SIGNATURE_ALGORITHMS,
            Extension::Sct => SCT,
            Extension::NextProtocolNegotiation => NEXT_PROTOCOL_NEGOTIATION,
            Extension::ChannelId => CHANNEL_ID,
            Extension::SupportedVersions(_) => SUPPORTED_VERSIONS,
            Extension::PskKeyExchangeModes(_) => PSK_KEY_EXCHANGE_MODES,
            Extension::KeyShare(_) => KEY_SHARE,
            Extension::Grease { value, .. } => *value,
            Extension::Padding => PADDING,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Extension::ServerName(name) => {
                let mut body = Vec::with_capacity(5 + name.len());
                body.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
                body.push(0); // name_type host_name
                body.extend_from_slice(&(name.len() as u16).to_be_bytes());
                body.extend_from_slice(name.as_bytes());
                body
            }
            Extension::ExtendedMasterSecret
            | Extension::Sct
            | Extension::NextProtocolNegotiation
            | Extension::ChannelId => Vec::new(),
            Extension::RenegotiationInfo => vec![0x00],
            Extension::SupportedGroups(groups) => {
                let mut body = Vec::with_capacity(2 + groups.len() * 2);
                body.extend_from_slice(&((groups.len() * 2) as u16).to_be_bytes());
                for group in groups {
                    body.extend_from_slice(&group.to_be_bytes());
                }
                body
            }
            Extension::PointFormats(formats) => {
                let mut body = Vec::with_capacity(1 + formats.len());
                body.push(formats.len() as u8);
                body.extend_from_slice(formats);
                body
            }
            Extension::SessionTicket(ticket) => ticket.clone(),
            Extension::Alpn(protocols) => {
                let mut list = Vec::new();
                for protocol in protocols {
                    list.push(protocol.len() as u8);
                    list.extend_from_slice(protocol.as_bytes());
                }
                let mut body = Vec::with_capacity(2 + list.len());
                body.extend_from_slice(&(list.len() as u16).to_be_bytes());
                body.extend_from_slice(&list);
                body
            }
            // OCSP status_request with empty responder id and extension lists.
            Extension::StatusRequest => vec![0x01, 0x00, 0x00, 0x00, 0x00],
            Extension::SignatureAlgorithms(algorithms) => {
                let mut body = Vec::with_capacity(2 + algorithms.len() * 2);
                body.extend_from_slice(&((algorithms.len() * 2) as u16).to_be_bytes());
                for algorithm in algorithms {
                    body.extend_from_slice(&algorithm.to_be_bytes());
                }
                body
            }
            Extension::SupportedVersions(versions) => {
                let mut body = Vec::with_capacity(1 + versions.len() * 2);
                body.push((versions.len() * 2) as u8);
                for version in versions {
                    body.extend_from_slice(&version.to_be_bytes());
                }
                body
            }
            Extension::PskKeyExchangeModes(modes) => {
                let mut body = Vec::with_capacity(1 + modes.len());
                body.push(modes.len() as u8);
                body.extend_from_slice(modes);
                body
            }
            Extension::KeyShare(shares) => {
                let mut entries = Vec::new();
                for (group, key) in shares {
                    entries.extend_from_slice(&group.to_be_bytes());
                    entries.extend_from_slice(&(key.len() as u16).to_be_bytes());
                    entries.extend_from_slice(key);
                }
                let mut body = Vec::with_capacity(2 + entries.len());
                body.extend_from_slice(&(entries.len() as u16).to_be_bytes());
                body.extend_from_slice(&entries);
                body
            }
            Extension::Grease { body, .. } => body.clone(),
            Extension::Padding => Vec::new(),
        }
    }
}

/// A complete ClientHello recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientHelloSpec {
    /// Legacy record/handshake version; 0x0303 for everything modern.
    pub tls_version: u16,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
    /// Session id; mirrors the fabricated ticket when one is attached.
    pub session_id: Vec<u8>,
}

impl ClientHelloSpec {
    /// Render the spec to a full TLS record containing the ClientHello.
    /// `random` is the 32-byte hello random supplied by the caller.
    pub fn encode(&self, random: &[u8; 32]) -> Vec<u8> {
        let mut body = Vec::with_capacity(512);
        body.extend_from_slice(&self.tls_version.to_be_bytes());
        body.extend_from_slice(random);
        body.push(self.session_id.len() as u8);
        body.extend_from_slice(&self.session_id);
        body.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in &self.cipher_suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }
        body.push(self.compression_methods.len() as u8);
        body.extend_from_slice(&self.compression_methods);

        let mut extensions = Vec::with_capacity(256);
        let mut wants_padding = false;
        for extension in &self.extensions {
            if matches!(extension, Extension::Padding) {
                wants_padding = true;
                continue;
            }
            let ext_body = extension.encode_body();
            extensions.extend_from_slice(&extension.extension_id().to_be_bytes());
            extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext_body);
        }

        if wants_padding {
            // 4-byte handshake header + fields + 2-byte extensions length +
            // extensions so far + the padding extension's own header.
            let unpadded = 4 + body.len() + 2 + extensions.len() + 4;
            let padding_len = boring_padding_len(unpadded);
            extensions.extend_from_slice(&extension_ids::PADDING.to_be_bytes());
            extensions.extend_from_slice(&(padding_len as u16).to_be_bytes());
            extensions.extend_from_slice(&vec![0u8; padding_len]);
        }

        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::with_capacity(body.len() + 4);
        handshake.push(0x01); // client_hello
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::with_capacity(handshake.len() + 5);
        record.push(0x16); // handshake
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    /// The JA3 fingerprint string: version, ciphers, extensions, curves,
    /// point formats, GREASE values excluded.
    pub fn ja3_string(&self) -> String {
        let ciphers: Vec<String> = self
            .cipher_suites
            .iter()
            .filter(|&&suite| !GREASE_VALUES.contains(&suite))
            .map(|suite| suite.to_string())
            .collect();
        let extensions: Vec<String> = self
            .extensions
            .iter()
            .map(Extension::extension_id)
            .filter(|id| !GREASE_VALUES.contains(id))
            .map(|id| id.to_string())
            .collect();
        let mut curves_list: Vec<String> = Vec::new();
        let mut formats: Vec<String> = Vec::new();
        for extension in &self.extensions {
            match extension {
                Extension::SupportedGroups(groups) => {
                    curves_list = groups
                        .iter()
                        .filter(|&&group| !GREASE_VALUES.contains(&group))
                        .map(|group| group.to_string())
                        .collect();
                }
                Extension::PointFormats(points) => {
                    formats = points.iter().map(|point| point.to_string()).collect();
                }
                _ => {}
            }
        }
        format!(
            "{},{},{},{},{}",
            self.tls_version,
            ciphers.join("-"),
            extensions.join("-"),
            curves_list.join("-"),
            formats.join("-")
        )
    }

    /// MD5 of the JA3 string, the form fingerprint databases index by.
    pub fn ja3_hash(&self) -> String {
        format!("{:x}", md5::compute(self.ja3_string().as_bytes()))
    }

    /// The ALPN protocols this hello offers, if any.
    pub fn alpn_protocols(&self) -> Option<&[String]> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::Alpn(protocols) => Some(protocols.as_slice()),
            _ => None,
        })
    }
}

/// BoringSSL padding policy: pad hellos whose length falls in (0xff, 0x200)
/// up to 0x200 bytes, since some middleboxes choke on 256..511 byte hellos.
fn boring_padding_len(unpadded_len: usize) -> usize {
    if unpadded_len > 0xff && unpadded_len < 0x200 {
        let padding_len = 0x200 - unpadded_len;
        if padding_len >= 5 {
            padding_len - 4
        } else {
            1
        }
    } else {
        0
    }
}

/// GREASE value selection, deterministic in the hello random the way
/// BoringSSL derives it.
pub fn grease_value(random: &[u8; 32], slot: usize) -> u16 {
    GREASE_VALUES[(random[slot] & 0x0f) as usize]
}

/// Cipher suites eligible for randomized assembly, tagged with whether the
/// suite is obsolete (no TLS 1.2 AEAD); obsolete suites are forced to the
/// tail of any shuffle.
const RANDOMIZABLE_CIPHER_SUITES: [(u16, bool); 14] = [
    (TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256, false),
    (TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, false),
    (TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384, false),
    (TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384, false),
    (TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305, false),
    (TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305, false),
    (TLS_RSA_WITH_AES_128_GCM_SHA256, false),
    (TLS_RSA_WITH_AES_256_GCM_SHA384, false),
    (TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA, true),
    (TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA, true),
    (TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA, true),
    (TLS_RSA_WITH_AES_128_CBC_SHA, true),
    (TLS_RSA_WITH_AES_256_CBC_SHA, true),
    (TLS_RSA_WITH_3DES_EDE_CBC_SHA, true),
];

const TLS13_CIPHER_SUITES: [u16; 3] = [
    TLS13_AES_128_GCM_SHA256,
    TLS13_AES_256_GCM_SHA384,
    TLS13_CHACHA20_POLY1305_SHA256,
];

/// Assemble a randomized pre-1.3 ClientHello, deterministic in `seed`.
///
/// `include_alpn` mirrors the coin the profile alias flips: a randomized
/// dial is split between an ALPN and a no-ALPN variant.
pub fn randomized_spec(
    seed: &Seed,
    server_name: Option<&str>,
    session_ticket: Option<Vec<u8>>,
    include_alpn: bool,
) -> ClientHelloSpec {
    let mut prng = SeededPrng::with_salt(seed, "randomized-client-hello");

    let cipher_suites = shuffled_cipher_suites(&mut prng);

    let mut signature_algorithms = vec![
        sigalg::ECDSA_SHA256,
        sigalg::RSA_PKCS1_SHA256,
        sigalg::ECDSA_SHA384,
        sigalg::RSA_PKCS1_SHA384,
        sigalg::RSA_PKCS1_SHA1,
    ];
    if prng.flip_weighted_coin(0.5) {
        signature_algorithms.push(sigalg::ECDSA_SHA512);
    }
    if prng.flip_weighted_coin(0.5) {
        signature_algorithms.push(sigalg::RSA_PKCS1_SHA512);
    }
    if prng.flip_weighted_coin(0.5) {
        signature_algorithms.push(sigalg::ECDSA_SHA1);
    }
    prng.shuffle(&mut signature_algorithms);

    let mut curve_ids = Vec::new();
    if prng.flip_weighted_coin(0.7) {
        curve_ids.push(curves::X25519);
    }
    curve_ids.push(curves::SECP256R1);
    curve_ids.push(curves::SECP384R1);
    if prng.flip_weighted_coin(0.3) {
        curve_ids.push(curves::SECP521R1);
    }

    let (session_id, ticket) = session_ticket_fields(session_ticket, &mut prng);

    let mut extensions = vec![
        Extension::ServerName(server_name.unwrap_or_default().to_string()),
        Extension::SessionTicket(ticket),
        Extension::SignatureAlgorithms(signature_algorithms),
        Extension::PointFormats(vec![point_formats::UNCOMPRESSED]),
        Extension::SupportedGroups(curve_ids),
    ];
    if prng.flip_weighted_coin(0.66) {
        extensions.push(Extension::Padding);
    }
    if prng.flip_weighted_coin(0.66) {
        extensions.push(Extension::StatusRequest);
    }
    if prng.flip_weighted_coin(0.55) {
        extensions.push(Extension::Sct);
    }
    if prng.flip_weighted_coin(0.44) {
        extensions.push(Extension::RenegotiationInfo);
    }
    prng.shuffle(&mut extensions);

    if include_alpn {
        extensions.push(Extension::Alpn(vec![
            "h2".to_string(),
            "http/1.1".to_string(),
        ]));
    }

    ClientHelloSpec {
        tls_version: 0x0303,
        cipher_suites,
        compression_methods: vec![0x00],
        extensions,
        session_id,
    }
}

/// Assemble a randomized TLS 1.3 ClientHello, deterministic in `seed`.
pub fn randomized_tls13_spec(
    seed: &Seed,
    server_name: Option<&str>,
    include_alpn: bool,
) -> ClientHelloSpec {
    let mut prng = SeededPrng::with_salt(seed, "randomized-tls13-client-hello");

    let mut tls13_suites = TLS13_CIPHER_SUITES.to_vec();
    prng.shuffle(&mut tls13_suites);
    let mut cipher_suites = tls13_suites;
    cipher_suites.extend(shuffled_cipher_suites(&mut prng));

    let mut signature_algorithms = vec![
        sigalg::ECDSA_SHA256,
        sigalg::RSA_PSS_SHA256,
        sigalg::RSA_PKCS1_SHA256,
        sigalg::ECDSA_SHA384,
        sigalg::RSA_PSS_SHA384,
        sigalg::RSA_PKCS1_SHA384,
        sigalg::RSA_PSS_SHA512,
        sigalg::RSA_PKCS1_SHA512,
    ];
    prng.shuffle(&mut signature_algorithms);

    // The key share carries a fresh-looking x25519 public key drawn from the
    // seeded PRNG, so the whole hello image replays.
    let mut key_share = vec![0u8; 32];
    prng.fill_bytes(&mut key_share);

    let mut session_id = vec![0u8; 32];
    prng.fill_bytes(&mut session_id);

    let mut extensions = vec![
        Extension::ServerName(server_name.unwrap_or_default().to_string()),
        Extension::SupportedGroups(vec![
            curves::X25519,
            curves::SECP256R1,
            curves::SECP384R1,
        ]),
        Extension::SignatureAlgorithms(signature_algorithms),
        Extension::SupportedVersions(vec![0x0304, 0x0303]),
        Extension::PskKeyExchangeModes(vec![0x01]),
        Extension::KeyShare(vec![(curves::X25519, key_share)]),
    ];
    if prng.flip_weighted_coin(0.5) {
        extensions.push(Extension::Sct);
    }
    if prng.flip_weighted_coin(0.66) {
        extensions.push(Extension::Padding);
    }
    prng.shuffle(&mut extensions);

    if include_alpn {
        extensions.push(Extension::Alpn(vec![
            "h2".to_string(),
            "http/1.1".to_string(),
        ]));
    }

    ClientHelloSpec {
        tls_version: 0x0303,
        cipher_suites,
        compression_methods: vec![0x00],
        extensions,
        session_id,
    }
}

fn shuffled_cipher_suites(prng: &mut SeededPrng) -> Vec<u16> {
    // Shuffle, then stable-partition obsolete suites to the tail so the
    // leading suites always look current.
    let tags = prng.perm(RANDOMIZABLE_CIPHER_SUITES.len());
    let mut tagged: Vec<(usize, u16, bool)> = RANDOMIZABLE_CIPHER_SUITES
        .iter()
        .zip(tags)
        .map(|((suite, obsolete), tag)| (tag, *suite, *obsolete))
        .collect();
    tagged.sort_by(|a, b| a.2.cmp(&b.2).then(a.0.cmp(&b.0)));

    let mut suites: Vec<u16> = tagged.into_iter().map(|(_, suite, _)| suite).collect();

    // Drop a random subset, never the leading suite, with removal
    // probability growing toward the tail.
    let original_len = suites.len() as f64;
    let mut index = 1;
    while index < suites.len() {
        if prng.flip_weighted_coin(0.4 * index as f64 / original_len) {
            suites.remove(index);
        } else {
            index += 1;
        }
    }
    suites
}

fn session_ticket_fields(
    session_ticket: Option<Vec<u8>>,
    prng: &mut SeededPrng,
) -> (Vec<u8>, Vec<u8>) {
    match session_ticket {
        Some(ticket) => {
            // A resumption attempt carries a non-empty session id alongside
            // the ticket.
            let mut session_id = vec![0u8; 32];
            prng.fill_bytes(&mut session_id);
            (session_id, ticket)
        }
        None => (Vec::new(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::SEED_LENGTH;

    fn test_seed(byte: u8) -> Seed {
        Seed::from_bytes(&[byte; SEED_LENGTH]).unwrap()
    }

    #[test]
    fn test_randomized_spec_is_deterministic() {
        let seed = test_seed(5);
        let a = randomized_spec(&seed, Some("example.org"), None, true);
        let b = randomized_spec(&seed, Some("example.org"), None, true);
        assert_eq!(a, b);

        let random = [0x20u8; 32];
        assert_eq!(a.encode(&random), b.encode(&random));
    }

    #[test]
    fn test_randomized_specs_differ_across_seeds() {
        let a = randomized_spec(&test_seed(1), Some("example.org"), None, true);
        let b = randomized_spec(&test_seed(2), Some("example.org"), None, true);
        let random = [0u8; 32];
        assert_ne!(a.encode(&random), b.encode(&random));
    }

    #[test]
    fn test_randomized_obsolete_ciphers_trail() {
        for byte in 0..32u8 {
            let spec = randomized_spec(&test_seed(byte), None, None, false);
            let obsolete_flags: Vec<bool> = spec
                .cipher_suites
                .iter()
                .map(|suite| {
                    RANDOMIZABLE_CIPHER_SUITES
                        .iter()
                        .find(|(id, _)| id == suite)
                        .map(|(_, obsolete)| *obsolete)
                        .unwrap_or(false)
                })
                .collect();
            // Once an obsolete suite appears, no current suite follows.
            let first_obsolete = obsolete_flags.iter().position(|flag| *flag);
            if let Some(position) = first_obsolete {
                assert!(obsolete_flags[position..].iter().all(|flag| *flag));
            }
        }
    }

    #[test]
    fn test_tls13_spec_has_required_extensions() {
        let spec = randomized_tls13_spec(&test_seed(3), Some("example.org"), true);
        assert!(spec
            .extensions
            .iter()
            .any(|ext| matches!(ext, Extension::SupportedVersions(_))));
        assert!(spec
            .extensions
            .iter()
            .any(|ext| matches!(ext, Extension::KeyShare(_))));
        assert!(spec.cipher_suites.contains(&TLS13_AES_128_GCM_SHA256));

        // Determinism holds here too.
        let again = randomized_tls13_spec(&test_seed(3), Some("example.org"), true);
        assert_eq!(spec, again);
    }

    #[test]
    fn test_encode_structure() {
        let spec = ClientHelloSpec {
            tls_version: 0x0303,
            cipher_suites: vec![TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256],
            compression_methods: vec![0x00],
            extensions: vec![
                Extension::ServerName("example.org".to_string()),
                Extension::SupportedGroups(vec![curves::X25519]),
            ],
            session_id: Vec::new(),
        };
        let random = [7u8; 32];
        let encoded = spec.encode(&random);

        // Record header: handshake, TLS 1.0 legacy record version.
        assert_eq!(encoded[0], 0x16);
        assert_eq!(&encoded[1..3], &[0x03, 0x01]);
        let record_len = u16::from_be_bytes([encoded[3], encoded[4]]) as usize;
        assert_eq!(record_len, encoded.len() - 5);

        // Handshake header: client_hello with matching length.
        assert_eq!(encoded[5], 0x01);
        let hs_len =
            u32::from_be_bytes([0, encoded[6], encoded[7], encoded[8]]) as usize;
        assert_eq!(hs_len, encoded.len() - 9);

        // Version and random follow.
        assert_eq!(&encoded[9..11], &[0x03, 0x03]);
        assert_eq!(&encoded[11..43], &random);
    }

    #[test]
    fn test_boring_padding() {
        // Below and above the window: no padding.
        assert_eq!(boring_padding_len(0xff), 0);
        assert_eq!(boring_padding_len(0x200), 0);
        // Inside the window: pads to 0x200 total, net of the 4-byte header.
        assert_eq!(boring_padding_len(0x100), 0x100 - 4);
        assert_eq!(boring_padding_len(0x1fe), 1);
    }

    #[test]
    fn test_ja3_excludes_grease() {
        let spec = ClientHelloSpec {
            tls_version: 0x0303,
            cipher_suites: vec![0x0a0a, TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256],
            compression_methods: vec![0x00],
            extensions: vec![
                Extension::Grease {
                    value: 0x1a1a,
                    body: Vec::new(),
                },
                Extension::ServerName("example.org".to_string()),
                Extension::SupportedGroups(vec![0x2a2a, curves::X25519]),
                Extension::PointFormats(vec![point_formats::UNCOMPRESSED]),
            ],
            session_id: Vec::new(),
        };
        let ja3 = spec.ja3_string();
        assert!(!ja3.contains("2570")); // 0x0a0a
        assert!(ja3.starts_with("771,"));
        assert_eq!(spec.ja3_hash().len(), 32);
    }

    #[test]
    fn test_grease_value_is_deterministic_in_random() {
        let random = [0x13u8; 32];
        assert_eq!(grease_value(&random, 0), grease_value(&random, 1));
        assert!(GREASE_VALUES.contains(&grease_value(&random, 0)));
    }
}
