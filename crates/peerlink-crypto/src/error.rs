//! Crypto error types.

/// Errors from link-key cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Seal failed: {0}")]
    SealFailed(String),

    #[error("Open failed: {0}")]
    OpenFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Sealed box too short: need at least {minimum} bytes, got {actual}")]
    SealedBoxTooShort { minimum: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}
