//! Error type shared by every layer of the vault.
//!
//! Messages identify the failing stage only. Key material, credentials and
//! plaintexts never end up in an error message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    /// Caller supplied an empty or malformed credential, salt, key or name.
    #[error("validation failed: {0}")]
    Validation(String),

    /// AEAD tag mismatch, OAEP decoding failure, or otherwise tampered data.
    #[error("integrity check failed: {0}")]
    IntegrityFailed(&'static str),

    /// CBC decryption produced invalid padding.
    #[error("cbc decryption failed: {0}")]
    PaddingFailed(&'static str),

    /// Opening a key pair bundle failed at the named stage.
    #[error("key recovery failed while {stage}")]
    KeyRecoveryFailed {
        stage: &'static str,
        #[source]
        source: Box<VaultError>,
    },

    /// Length-prefixed framing of a token or blob is malformed.
    #[error("malformed data: {0}")]
    Format(String),

    /// The asymmetric key does not have the modulus size the cipher expects.
    #[error("unsupported key size: expected {expected} bytes, got {actual} bytes")]
    UnsupportedKeySize { expected: usize, actual: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The one-time credential does not match its stored verifier.
    #[error("credential verification failed")]
    Unauthorized,
}

impl VaultError {
    /// Wrap `self` as the cause of a failed bundle-opening stage.
    pub(crate) fn during(self, stage: &'static str) -> Self {
        VaultError::KeyRecoveryFailed {
            stage,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_key_recovery_keeps_cause() {
        let err = VaultError::IntegrityFailed("gcm tag mismatch").during("opening private key");
        assert_eq!(err.to_string(), "key recovery failed while opening private key");
        let source = err.source().expect("cause should be attached");
        assert!(source.to_string().contains("gcm tag mismatch"));
    }

    #[test]
    fn test_key_size_message() {
        let err = VaultError::UnsupportedKeySize {
            expected: 512,
            actual: 256,
        };
        assert_eq!(
            err.to_string(),
            "unsupported key size: expected 512 bytes, got 256 bytes"
        );
    }
}
