//! Encrypted flat-file secret store.
//!
//! Secrets are sealed with a hybrid RSA-OAEP/AES-GCM scheme under a key pair
//! that is itself sealed with a key derived from a one-time credential. The
//! [`kv::EnvStore`] ties the pieces together over a `KEY=VALUE` file, and
//! [`vault::TinyEnv`] gates that store behind a self-decrypting token.

pub mod cipher;
pub mod config;
pub mod crypt;
pub mod error;
pub mod hybrid;
pub mod keypair;
pub mod kv;
pub mod scramble;
pub mod secret;
pub mod token;
pub mod vault;

#[cfg(test)]
mod testutil;

pub use config::VaultConfig;
pub use error::{Result, VaultError};
pub use hybrid::HybridCipher;
pub use keypair::{KeyHalf, KeyPairBundle, KeyPairVault};
pub use kv::{EnvRecords, EnvStore};
pub use secret::{Credential, Salt, VaultSession};
pub use token::SecureBlobCodec;
pub use vault::TinyEnv;
