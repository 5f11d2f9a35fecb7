//! Symmetric link key for signaling payloads.
//!
//! Derived once per link from the pairing secret via HKDF-SHA256 and used
//! for ChaCha20-Poly1305 sealed boxes. Both ends of a link hold the same key,
//! so nonces are drawn at random rather than from a per-session counter.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::secret::LinkSecret;

/// HKDF info string for link key derivation.
const HKDF_INFO: &[u8] = b"peerlink-signaling-v1";

/// HKDF salt for domain separation (recommended by RFC 5869).
const HKDF_SALT: &[u8] = b"peerlink-hkdf-salt-v1";

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Derive a 32-byte key from a link secret via HKDF-SHA256.
///
/// The caller is responsible for zeroizing the returned bytes.
fn hkdf_derive(secret: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(key)
}

/// Immutable symmetric key shared by every negotiation of one link.
pub struct LinkKey {
    cipher: ChaCha20Poly1305,
}

impl LinkKey {
    /// Derive the link key from its pairing secret.
    pub fn derive(secret: &LinkSecret) -> Result<Self, CryptoError> {
        let mut key_bytes = hkdf_derive(secret.as_bytes())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        key_bytes.zeroize();
        Ok(Self { cipher })
    }

    /// Seal `plaintext` into `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::SealFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed box produced by [`LinkKey::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let minimum = NONCE_SIZE + TAG_SIZE;
        if sealed.len() < minimum {
            return Err(CryptoError::SealedBoxTooShort {
                minimum,
                actual: sealed.len(),
            });
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::OpenFailed(e.to_string()))
    }

    /// Seal and hex-encode, as carried in the relay envelope.
    pub fn seal_hex(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        self.seal(plaintext).map(hex::encode)
    }

    pub fn open_hex(&self, sealed_hex: &str) -> Result<Vec<u8>, CryptoError> {
        let sealed = hex::decode(sealed_hex).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        self.open(&sealed)
    }
}

impl std::fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LinkKey(<redacted>)")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(byte: u8) -> LinkKey {
        LinkKey::derive(&LinkSecret::from_bytes([byte; 32])).unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let k = key(42);
        let sealed = k.seal(b"offer sdp").unwrap();
        assert_eq!(k.open(&sealed).unwrap(), b"offer sdp");
    }

    #[test]
    fn both_ends_derive_the_same_key() {
        let wallet = key(9);
        let extension = key(9);
        let sealed = wallet.seal(b"hello").unwrap();
        assert_eq!(extension.open(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn open_with_other_link_key_fails() {
        let sealed = key(1).seal(b"secret").unwrap();
        assert!(matches!(key(2).open(&sealed), Err(CryptoError::OpenFailed(_))));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let k = key(3);
        let mut sealed = k.seal(b"candidate").unwrap();
        if let Some(last) = sealed.last_mut() {
            *last ^= 0xFF;
        }
        assert!(k.open(&sealed).is_err());
    }

    #[test]
    fn sealed_box_layout() {
        let sealed = key(4).seal(b"abc").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 3 + TAG_SIZE);
    }

    #[test]
    fn short_sealed_box_is_rejected() {
        let result = key(5).open(&[0u8; 10]);
        assert!(matches!(
            result,
            Err(CryptoError::SealedBoxTooShort {
                minimum: 28,
                actual: 10
            })
        ));
    }

    #[test]
    fn nonces_do_not_repeat() {
        let k = key(6);
        let mut nonces = std::collections::HashSet::new();
        for _ in 0..500 {
            let sealed = k.seal(b"x").unwrap();
            assert!(nonces.insert(sealed[..NONCE_SIZE].to_vec()));
        }
    }

    #[test]
    fn hex_helpers_roundtrip() {
        let k = key(7);
        let sealed = k.seal_hex(b"{\"sdp\":\"v=0\"}").unwrap();
        assert!(sealed.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(k.open_hex(&sealed).unwrap(), b"{\"sdp\":\"v=0\"}");
    }

    #[test]
    fn open_hex_rejects_non_hex() {
        assert!(matches!(
            key(8).open_hex("zz"),
            Err(CryptoError::InvalidHex(_))
        ));
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let k = key(10);
        let sealed = k.seal(b"").unwrap();
        assert!(k.open(&sealed).unwrap().is_empty());
    }
}
