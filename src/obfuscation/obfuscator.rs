//! Seed-message obfuscator.
//!
//! The client opens every obfuscated connection with a single seed message:
//!
//! ```text
//! [ 16-byte random seed (plaintext) ]
//! [ 32-bit magic value   (encrypted) ]
//! [ 32-bit padding length (encrypted) ]
//! [ padding              (encrypted) ]
//! ```
//!
//! Both sides derive per-direction RC4 keys from the seed and a shared
//! keyword; after the seed message, every byte in both directions passes
//! through the direction's stream cipher. All integers are big-endian.
//!
//! The first [`SEED_LENGTH`](super::prng::SEED_LENGTH) bytes of padding double
//! as a PRNG seed the server uses to derive later protocol randomness, which
//! lets the client deterministically replay downstream decisions.

use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::prng::{Seed, SeededPrng, SEED_LENGTH};
use super::ObfuscationError;

/// Length of the plaintext seed that opens the seed message.
pub const OBFUSCATE_SEED_LENGTH: usize = 16;

/// RC4 key length in bytes.
pub const OBFUSCATE_KEY_LENGTH: usize = 16;

/// Number of times the key digest is re-hashed.
pub const OBFUSCATE_HASH_ITERATIONS: usize = 6000;

/// Protocol maximum for the padding field.
pub const OBFUSCATE_MAX_PADDING: usize = 8192;

/// Fixed magic value; the server rejects any seed message that does not
/// decrypt to it.
pub const OBFUSCATE_MAGIC_VALUE: u32 = 0x0BF5_CA7E;

const CLIENT_TO_SERVER_IV: &[u8] = b"client_to_server";
const SERVER_TO_CLIENT_IV: &[u8] = b"server_to_client";

/// RC4 stream cipher.
///
/// Hand-rolled because the wire format demands RC4 and nothing else in the
/// dependency tree provides it. Key-scheduling and PRGA are the textbook
/// algorithm.
#[derive(Debug)]
struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        debug_assert!(!key.is_empty() && key.len() <= 256);
        let mut state = [0u8; 256];
        for (idx, slot) in state.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(state[i])
                .wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Rc4 { state, i: 0, j: 0 }
    }

    fn xor_keystream(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state[(self.state[self.i as usize]
                .wrapping_add(self.state[self.j as usize]))
                as usize];
            *byte ^= k;
        }
    }
}

/// Configuration for an [`Obfuscator`].
///
/// Padding bounds are validated here, not mid-handshake: the minimum must be
/// at least [`SEED_LENGTH`] (so the padding always carries a full PRNG seed)
/// and the maximum no more than [`OBFUSCATE_MAX_PADDING`].
#[derive(Clone)]
pub struct ObfuscatorConfig {
    keyword: String,
    padding_seed: Option<Seed>,
    min_padding: usize,
    max_padding: usize,
}

impl ObfuscatorConfig {
    pub fn new(
        keyword: impl Into<String>,
        min_padding: Option<usize>,
        max_padding: Option<usize>,
    ) -> Result<Self, ObfuscationError> {
        let min = min_padding.unwrap_or(SEED_LENGTH);
        let max = max_padding.unwrap_or(OBFUSCATE_MAX_PADDING);
        if min < SEED_LENGTH || min > OBFUSCATE_MAX_PADDING {
            return Err(ObfuscationError::InvalidPaddingRange { min, max });
        }
        if max > OBFUSCATE_MAX_PADDING || max < min {
            return Err(ObfuscationError::InvalidPaddingRange { min, max });
        }
        Ok(ObfuscatorConfig {
            keyword: keyword.into(),
            padding_seed: None,
            min_padding: min,
            max_padding: max,
        })
    }

    /// Set the padding PRNG seed. Required for client obfuscators; allows
    /// replay of the padding and of the protocol attributes the server
    /// derives from it.
    pub fn with_padding_seed(mut self, seed: Seed) -> Self {
        self.padding_seed = Some(seed);
        self
    }
}

/// The seed-message handshake and per-direction stream ciphers.
///
/// Limitation: RC4 is vulnerable to ciphertext malleability, and the 32-bit
/// magic value provides only weak authentication. The format is kept for
/// compatibility with deployed peers; new protocols should not adopt it.
#[derive(Debug)]
pub struct Obfuscator {
    seed_message: Option<Vec<u8>>,
    padding_length: Option<usize>,
    client_to_server: Rc4,
    server_to_client: Rc4,
    padding_prng_seed: Seed,
    // The padding prefix: the seed both ends share for derived PRNGs. On
    // the client this is a pure function of padding_prng_seed, so replaying
    // that seed replays the server's derived decisions too.
    derived_prng_seed: Seed,
}

impl Obfuscator {
    /// Create a client-side obfuscator, staging a seed message for the caller
    /// to send.
    ///
    /// The config must carry a padding seed; it drives the padding PRNG so a
    /// later attempt can replay the identical seed message.
    pub fn new_client(config: &ObfuscatorConfig) -> Result<Self, ObfuscationError> {
        let padding_seed = config
            .padding_seed
            .ok_or(ObfuscationError::MissingPaddingSeed)?;
        let mut padding_prng = SeededPrng::new(&padding_seed);

        let mut seed = [0u8; OBFUSCATE_SEED_LENGTH];
        ring::rand::SecureRandom::fill(&ring::rand::SystemRandom::new(), &mut seed)
            .map_err(|_| ObfuscationError::EntropyFailure)?;

        let (mut client_to_server, server_to_client) = init_ciphers(&seed, &config.keyword);

        let padding = padding_prng.padding(config.min_padding, config.max_padding);
        let padding_length = padding.len();
        // min_padding >= SEED_LENGTH, so the prefix is always whole.
        let derived_prng_seed = Seed::from_bytes(&padding[..SEED_LENGTH])
            .ok_or(ObfuscationError::MissingPaddingSeed)?;

        let mut message =
            Vec::with_capacity(OBFUSCATE_SEED_LENGTH + 8 + padding_length);
        message.extend_from_slice(&seed);
        message.extend_from_slice(&OBFUSCATE_MAGIC_VALUE.to_be_bytes());
        message.extend_from_slice(&(padding_length as u32).to_be_bytes());
        message.extend_from_slice(&padding);
        client_to_server.xor_keystream(&mut message[OBFUSCATE_SEED_LENGTH..]);

        Ok(Obfuscator {
            seed_message: Some(message),
            padding_length: Some(padding_length),
            client_to_server,
            server_to_client,
            padding_prng_seed: padding_seed,
            derived_prng_seed,
        })
    }

    /// Create a server-side obfuscator by reading and validating the client's
    /// seed message.
    ///
    /// The magic value is validated before the padding length is acted upon:
    /// length validation is vulnerable to a chosen-ciphertext probing attack
    /// (only a fixed number of byte values for each length position is
    /// valid), so accepting length first would hand an attacker an oracle.
    pub async fn new_server<R>(
        reader: &mut R,
        config: &ObfuscatorConfig,
    ) -> Result<Self, ObfuscationError>
    where
        R: AsyncRead + Unpin,
    {
        let mut seed = [0u8; OBFUSCATE_SEED_LENGTH];
        reader.read_exact(&mut seed).await?;

        let (mut client_to_server, server_to_client) = init_ciphers(&seed, &config.keyword);

        // 4 bytes each for the magic value and padding length.
        let mut fixed = [0u8; 8];
        reader.read_exact(&mut fixed).await?;
        client_to_server.xor_keystream(&mut fixed);

        let magic = u32::from_be_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
        let padding_length = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);

        if magic != OBFUSCATE_MAGIC_VALUE {
            return Err(ObfuscationError::InvalidMagic(magic));
        }
        if padding_length as usize > OBFUSCATE_MAX_PADDING {
            return Err(ObfuscationError::InvalidPaddingLength(padding_length));
        }

        let mut padding = vec![0u8; padding_length as usize];
        reader.read_exact(&mut padding).await?;
        client_to_server.xor_keystream(&mut padding);

        // The leading padding bytes seed subsequent server-side randomness.
        // Legacy clients may send fewer than SEED_LENGTH bytes; generate a
        // fresh seed in that case.
        let padding_prng_seed = match Seed::from_bytes(padding.get(..SEED_LENGTH).unwrap_or(&[]))
        {
            Some(seed) => seed,
            None => Seed::new()?,
        };

        Ok(Obfuscator {
            seed_message: None,
            padding_length: None,
            client_to_server,
            server_to_client,
            padding_prng_seed,
            derived_prng_seed: padding_prng_seed,
        })
    }

    /// Take the staged seed message for sending. Client side only; the
    /// message is handed out once.
    pub fn take_seed_message(&mut self) -> Option<Vec<u8>> {
        self.seed_message.take()
    }

    /// The padding length chosen for the client seed message.
    pub fn padding_length(&self) -> Option<usize> {
        self.padding_length
    }

    /// The padding PRNG seed: the configured seed on the client (persist
    /// this one to replay the attempt), the seed recovered from the
    /// client's padding on the server.
    pub fn padding_prng_seed(&self) -> &Seed {
        &self.padding_prng_seed
    }

    /// A PRNG derived from the shared padding-prefix seed, distinguished by
    /// `salt`. Client and server derivations with the same salt replay the
    /// same stream.
    pub fn derived_prng(&self, salt: &str) -> SeededPrng {
        SeededPrng::with_salt(&self.derived_prng_seed, salt)
    }

    /// Apply the client→server stream cipher in place.
    pub fn obfuscate_client_to_server(&mut self, buf: &mut [u8]) {
        self.client_to_server.xor_keystream(buf);
    }

    /// Apply the server→client stream cipher in place.
    pub fn obfuscate_server_to_client(&mut self, buf: &mut [u8]) {
        self.server_to_client.xor_keystream(buf);
    }
}

fn init_ciphers(seed: &[u8], keyword: &str) -> (Rc4, Rc4) {
    let client_key = derive_key(seed, keyword.as_bytes(), CLIENT_TO_SERVER_IV);
    let server_key = derive_key(seed, keyword.as_bytes(), SERVER_TO_CLIENT_IV);
    (Rc4::new(&client_key), Rc4::new(&server_key))
}

fn derive_key(seed: &[u8], keyword: &[u8], iv: &[u8]) -> [u8; OBFUSCATE_KEY_LENGTH] {
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(keyword);
    hasher.update(iv);
    let mut digest = hasher.finalize();
    for _ in 0..OBFUSCATE_HASH_ITERATIONS {
        let mut hasher = Sha1::new();
        hasher.update(digest);
        digest = hasher.finalize();
    }
    let mut key = [0u8; OBFUSCATE_KEY_LENGTH];
    key.copy_from_slice(&digest[..OBFUSCATE_KEY_LENGTH]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seed(byte: u8) -> Seed {
        Seed::from_bytes(&[byte; SEED_LENGTH]).unwrap()
    }

    fn client_config() -> ObfuscatorConfig {
        ObfuscatorConfig::new("test-keyword", None, None)
            .unwrap()
            .with_padding_seed(test_seed(1))
    }

    #[test]
    fn test_direction_keys_are_distinct() {
        let seed = [0x42u8; OBFUSCATE_SEED_LENGTH];
        let client_key = derive_key(&seed, b"kw", CLIENT_TO_SERVER_IV);
        let server_key = derive_key(&seed, b"kw", SERVER_TO_CLIENT_IV);
        assert_ne!(client_key, server_key);
    }

    #[test]
    fn test_keys_independent_of_padding_length() {
        // Keys are a function of (seed, keyword, direction) only: two clients
        // with different padding bounds but the same seed message prefix must
        // derive the same keys. Exercised by deriving directly.
        let seed = [7u8; OBFUSCATE_SEED_LENGTH];
        let a = derive_key(&seed, b"kw", CLIENT_TO_SERVER_IV);
        let b = derive_key(&seed, b"kw", CLIENT_TO_SERVER_IV);
        assert_eq!(a, b);
    }

    #[test]
    fn test_padding_range_validation() {
        // Boundaries accepted.
        assert!(ObfuscatorConfig::new("kw", Some(SEED_LENGTH), Some(OBFUSCATE_MAX_PADDING)).is_ok());
        // Below minimum, above maximum, inverted: all rejected.
        assert!(ObfuscatorConfig::new("kw", Some(SEED_LENGTH - 1), None).is_err());
        assert!(ObfuscatorConfig::new("kw", None, Some(OBFUSCATE_MAX_PADDING + 1)).is_err());
        assert!(ObfuscatorConfig::new("kw", Some(200), Some(100)).is_err());
    }

    #[test]
    fn test_client_requires_padding_seed() {
        let config = ObfuscatorConfig::new("kw", None, None).unwrap();
        assert!(matches!(
            Obfuscator::new_client(&config),
            Err(ObfuscationError::MissingPaddingSeed)
        ));
    }

    #[tokio::test]
    async fn test_client_server_handshake() {
        let mut client = Obfuscator::new_client(&client_config()).unwrap();
        let seed_message = client.take_seed_message().unwrap();
        assert!(client.take_seed_message().is_none());

        let server_cfg = ObfuscatorConfig::new("test-keyword", None, None).unwrap();
        let mut reader = &seed_message[..];
        let mut server = Obfuscator::new_server(&mut reader, &server_cfg).await.unwrap();

        // Keystreams agree in both directions.
        let plaintext = b"arbitrary tunnel bytes".to_vec();
        let mut upstream = plaintext.clone();
        client.obfuscate_client_to_server(&mut upstream);
        server.obfuscate_client_to_server(&mut upstream);
        assert_eq!(upstream, plaintext);

        let mut downstream = plaintext.clone();
        server.obfuscate_server_to_client(&mut downstream);
        client.obfuscate_server_to_client(&mut downstream);
        assert_eq!(downstream, plaintext);

        // Server recovered the padding PRNG seed from the padding prefix, so
        // salted derivations replay on both sides.
        let mut client_prng = client.derived_prng("test-salt");
        let mut server_prng = server.derived_prng("test-salt");
        for _ in 0..16 {
            assert_eq!(client_prng.intn(1 << 20), server_prng.intn(1 << 20));
        }
    }

    #[tokio::test]
    async fn test_seed_message_replay() {
        let mut a = Obfuscator::new_client(&client_config()).unwrap();
        let mut b = Obfuscator::new_client(&client_config()).unwrap();
        let msg_a = a.take_seed_message().unwrap();
        let msg_b = b.take_seed_message().unwrap();
        // The 16-byte seed prefix is fresh entropy; everything derived from
        // the padding PRNG (the padding length) replays.
        assert_eq!(a.padding_length(), b.padding_length());
        assert_eq!(msg_a.len(), msg_b.len());
    }

    #[tokio::test]
    async fn test_server_rejects_bad_keyword() {
        let mut client = Obfuscator::new_client(&client_config()).unwrap();
        let seed_message = client.take_seed_message().unwrap();

        let server_cfg = ObfuscatorConfig::new("wrong-keyword", None, None).unwrap();
        let mut reader = &seed_message[..];
        let err = Obfuscator::new_server(&mut reader, &server_cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, ObfuscationError::InvalidMagic(_)));
    }

    #[tokio::test]
    async fn test_magic_validated_before_padding_is_read() {
        // A message with a corrupted magic field and *no padding at all*:
        // the server must fail on the magic, never attempting to read
        // padding bytes that are not there.
        let mut client = Obfuscator::new_client(&client_config()).unwrap();
        let mut message = client.take_seed_message().unwrap();
        message[OBFUSCATE_SEED_LENGTH] ^= 0xFF;
        message.truncate(OBFUSCATE_SEED_LENGTH + 8);

        let server_cfg = ObfuscatorConfig::new("test-keyword", None, None).unwrap();
        let mut reader = &message[..];
        let err = Obfuscator::new_server(&mut reader, &server_cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, ObfuscationError::InvalidMagic(_)));
    }

    #[tokio::test]
    async fn test_server_rejects_oversize_padding_length() {
        let mut client = Obfuscator::new_client(&client_config()).unwrap();
        let mut message = client.take_seed_message().unwrap();

        // Rebuild the length field as MAX+1 under the real cipher.
        let seed: [u8; OBFUSCATE_SEED_LENGTH] =
            message[..OBFUSCATE_SEED_LENGTH].try_into().unwrap();
        let (mut cipher, _) = init_ciphers(&seed, "test-keyword");
        let mut fields = [0u8; 8];
        fields[..4].copy_from_slice(&OBFUSCATE_MAGIC_VALUE.to_be_bytes());
        fields[4..].copy_from_slice(&((OBFUSCATE_MAX_PADDING as u32 + 1).to_be_bytes()));
        cipher.xor_keystream(&mut fields);
        message[OBFUSCATE_SEED_LENGTH..OBFUSCATE_SEED_LENGTH + 8].copy_from_slice(&fields);
        message.truncate(OBFUSCATE_SEED_LENGTH + 8);

        let server_cfg = ObfuscatorConfig::new("test-keyword", None, None).unwrap();
        let mut reader = &message[..];
        let err = Obfuscator::new_server(&mut reader, &server_cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, ObfuscationError::InvalidPaddingLength(_)));
    }

    #[test]
    fn test_rc4_known_vector() {
        // RFC 6229 test vector: key 0x0102030405, first keystream bytes.
        let mut cipher = Rc4::new(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        let mut buf = [0u8; 16];
        cipher.xor_keystream(&mut buf);
        assert_eq!(
            buf,
            [
                0xb2, 0x39, 0x63, 0x05, 0xf0, 0x3d, 0xc0, 0x27, 0xcc, 0xc3, 0x52, 0x4a, 0x0a,
                0x11, 0x18, 0xa8
            ]
        );
    }
}
