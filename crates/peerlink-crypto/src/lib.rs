//! `peerlink` signaling cryptography
//!
//! Seals negotiation payloads so the signaling relay forwards them without
//! being able to read them.
//!
//! ## Crypto primitives
//!
//! - **Secret**: 32-byte pairing secret per link, zeroized on drop
//! - **Key**: HKDF-SHA256(secret) → 32-byte symmetric key, derived once per link
//! - **Sealed box**: ChaCha20-Poly1305 AEAD, `nonce(12) || ciphertext || tag(16)`

pub mod error;
pub mod key;
pub mod secret;

pub use error::CryptoError;
pub use key::{LinkKey, NONCE_SIZE, TAG_SIZE};
pub use secret::{LINK_SECRET_SIZE, LinkSecret};
