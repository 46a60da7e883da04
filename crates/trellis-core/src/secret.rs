//! Private network secrets.
//!
//! Two nodes can only establish a transport session when they hold the
//! same 32-byte secret. The secret itself is never logged; use
//! [`Secret::fingerprint`] to identify it in diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a private network secret in bytes.
pub const SECRET_LEN: usize = 32;

/// Name hashed into [`Secret::default_network`].
pub const DEFAULT_NETWORK_NAME: &str = "/trellis/pnet/default/1.0.0";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Secret must be {SECRET_LEN} bytes, got {got}")]
    InvalidLength { got: usize },

    #[error("Secret hex invalid: {reason}")]
    InvalidHex { reason: String },
}

/// A shared private network key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn new(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// A fresh random secret. Share it out of band with every member.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// The secret used when none is configured, so nodes built from default
    /// options can reach each other.
    pub fn default_network() -> Self {
        Self::derive(DEFAULT_NETWORK_NAME)
    }

    /// Derive a secret from a network name.
    pub fn derive(name: &str) -> Self {
        Self(Sha256::digest(name.as_bytes()).into())
    }

    /// Parse 64 hex characters, with or without a `0x` prefix.
    pub fn from_hex(hex_str: &str) -> Result<Self, SecretError> {
        let hex_str = hex_str.trim();
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);

        let bytes = hex::decode(hex_str).map_err(|e| SecretError::InvalidHex {
            reason: e.to_string(),
        })?;
        let bytes: [u8; SECRET_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| SecretError::InvalidLength { got: b.len() })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// Short, non-reversible identifier that is safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }
}

impl Default for Secret {
    fn default() -> Self {
        Self::default_network()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_default_network_is_stable() {
        assert_eq!(Secret::default_network(), Secret::default_network());
        assert_eq!(Secret::default(), Secret::derive(DEFAULT_NETWORK_NAME));
        assert_ne!(Secret::default_network(), Secret::derive("/other"));
    }

    #[test]
    fn test_generate_is_random() {
        assert_ne!(Secret::generate(), Secret::generate());
    }

    #[test]
    fn test_from_hex() {
        let s = Secret::from_hex(
            "0x0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20",
        )
        .unwrap();
        assert_eq!(
            s.as_bytes(),
            &hex!("0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20")
        );
        assert_eq!(Secret::from_hex(&s.to_hex()).unwrap(), s);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(matches!(
            Secret::from_hex("aabb"),
            Err(SecretError::InvalidLength { got: 2 })
        ));
        assert!(matches!(
            Secret::from_hex("zz"),
            Err(SecretError::InvalidHex { .. })
        ));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let s = Secret::new([0xAB; SECRET_LEN]);
        let dbg = format!("{:?}", s);
        assert!(!dbg.contains(&s.to_hex()));
        assert!(dbg.contains(&s.fingerprint()));
        assert_eq!(s.fingerprint().len(), 8);
    }
}
