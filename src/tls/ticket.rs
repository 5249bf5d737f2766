//! Obfuscated session tickets.
//!
//! A server that shares a 32-byte ticket key with its clients can accept a
//! fabricated session ticket and resume the fabricated session. To an
//! observer the exchange looks like ordinary session resumption, and under
//! resumption the server certificate is never sent in the clear, so the
//! most fingerprintable part of the exchange drops out of the wire image.
//! The ticket blob itself is AEAD ciphertext and therefore
//! indistinguishable from the random-looking tickets real servers mint.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use super::DialError;

/// Length of the shared obfuscated session ticket key.
pub const TICKET_KEY_LENGTH: usize = 32;

/// Fabricated ticket length, matching the common size real servers emit.
const TICKET_PLAINTEXT_LENGTH: usize = 176;

/// A fabricated session ready to attach to a ClientHello.
pub struct ObfuscatedSessionState {
    /// The ticket blob for the session_ticket extension.
    pub session_ticket: Vec<u8>,
    /// The fabricated master secret the server will recover from the ticket.
    pub master_secret: [u8; 48],
    /// Negotiated version the fabricated session claims (TLS 1.2).
    pub version: u16,
    /// Cipher suite the fabricated session claims.
    pub cipher_suite: u16,
}

/// Fabricate a session state under the shared ticket key.
///
/// The plaintext layout is (version, cipher suite, master secret, random
/// fill); the server decrypts with the same key and resumes. Each call draws
/// a fresh master secret, so two tickets never correlate on the wire.
///
/// The fabricated session always claims TLS 1.2: session tickets of this
/// form do not exist in TLS 1.3, and the dialer attaches the ticket only on
/// pre-1.3 profiles, where the claimed version matches the negotiation.
pub fn new_obfuscated_session_state(
    key: &[u8; TICKET_KEY_LENGTH],
) -> Result<ObfuscatedSessionState, DialError> {
    let rng = SystemRandom::new();

    let mut master_secret = [0u8; 48];
    rng.fill(&mut master_secret)
        .map_err(|_| DialError::Config("entropy source failed".to_string()))?;

    let version: u16 = 0x0303;
    let cipher_suite: u16 =
        super::profiles::cipher_suites::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256;

    let mut plaintext = Vec::with_capacity(TICKET_PLAINTEXT_LENGTH);
    plaintext.extend_from_slice(&version.to_be_bytes());
    plaintext.extend_from_slice(&cipher_suite.to_be_bytes());
    plaintext.extend_from_slice(&master_secret);
    let mut fill = vec![0u8; TICKET_PLAINTEXT_LENGTH - plaintext.len()];
    rng.fill(&mut fill)
        .map_err(|_| DialError::Config("entropy source failed".to_string()))?;
    plaintext.extend_from_slice(&fill);

    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| DialError::Config("invalid obfuscated session ticket key".to_string()))?;
    let sealing = LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; 12];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| DialError::Config("entropy source failed".to_string()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut sealed = plaintext;
    sealing
        .seal_in_place_append_tag(nonce, Aad::empty(), &mut sealed)
        .map_err(|_| DialError::Config("session ticket seal failed".to_string()))?;

    // Ticket = nonce ‖ ciphertext ‖ tag; uniformly random-looking.
    let mut session_ticket = nonce_bytes.to_vec();
    session_ticket.extend_from_slice(&sealed);

    Ok(ObfuscatedSessionState {
        session_ticket,
        master_secret,
        version,
        cipher_suite,
    })
}

/// Parse a hex-encoded ticket key. Keys of the wrong length are a
/// configuration error, fatal at load time.
pub fn decode_ticket_key(hex_key: &str) -> Result<[u8; TICKET_KEY_LENGTH], DialError> {
    let bytes = hex::decode(hex_key)
        .map_err(|err| DialError::Config(format!("invalid session ticket key: {err}")))?;
    let key: [u8; TICKET_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| DialError::Config("invalid session ticket key length".to_string()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_fabrication() {
        let key = [0x5Au8; TICKET_KEY_LENGTH];
        let state = new_obfuscated_session_state(&key).unwrap();

        // nonce + plaintext + GCM tag
        assert_eq!(
            state.session_ticket.len(),
            12 + TICKET_PLAINTEXT_LENGTH + 16
        );
        assert_eq!(state.version, 0x0303);

        // Fresh master secret each time; tickets never repeat.
        let again = new_obfuscated_session_state(&key).unwrap();
        assert_ne!(state.session_ticket, again.session_ticket);
        assert_ne!(state.master_secret, again.master_secret);
    }

    #[test]
    fn test_ticket_round_trips_under_key() {
        let key = [0x21u8; TICKET_KEY_LENGTH];
        let state = new_obfuscated_session_state(&key).unwrap();

        // A server holding the key recovers the fabricated session.
        let unbound = UnboundKey::new(&AES_256_GCM, &key).unwrap();
        let opening = LessSafeKey::new(unbound);
        let nonce_bytes: [u8; 12] = state.session_ticket[..12].try_into().unwrap();
        let mut ciphertext = state.session_ticket[12..].to_vec();
        let plaintext = opening
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut ciphertext,
            )
            .unwrap();

        assert_eq!(&plaintext[..2], &state.version.to_be_bytes());
        assert_eq!(&plaintext[2..4], &state.cipher_suite.to_be_bytes());
        assert_eq!(&plaintext[4..52], &state.master_secret);
    }

    #[test]
    fn test_decode_ticket_key() {
        let hex_key = "ab".repeat(TICKET_KEY_LENGTH);
        assert!(decode_ticket_key(&hex_key).is_ok());
        assert!(decode_ticket_key("ab").is_err());
        assert!(decode_ticket_key("not hex").is_err());
    }
}
