//! Link pairing secrets.
//!
//! A link secret is the 32-byte password agreed when a wallet is paired with
//! a counterpart. The relay addresses the signaling channel by the SHA-256
//! of the secret, and the symmetric key is derived from it with HKDF.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Length of a link secret in bytes.
pub const LINK_SECRET_SIZE: usize = 32;

/// Shared pairing secret for one link.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LinkSecret([u8; LINK_SECRET_SIZE]);

impl LinkSecret {
    pub const fn from_bytes(bytes: [u8; LINK_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; LINK_SECRET_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: LINK_SECRET_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let mut bytes =
            hex::decode(hex_str.trim()).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        let secret = Self::from_slice(&bytes);
        bytes.zeroize();
        secret
    }

    pub const fn as_bytes(&self) -> &[u8; LINK_SECRET_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hex SHA-256 of the secret; the relay-visible channel identifier.
    pub fn channel_id(&self) -> String {
        hex::encode(Sha256::digest(self.0))
    }
}

impl PartialEq for LinkSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for LinkSecret {}

impl fmt::Debug for LinkSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LinkSecret").field(&"<redacted>").finish()
    }
}

impl Serialize for LinkSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for LinkSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
