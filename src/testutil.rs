//! Fixtures shared by unit tests. RSA key generation is the slow part, so a
//! single sealed key pair is generated per test binary and reused.

use std::sync::OnceLock;

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::config::VaultConfig;
use crate::keypair::{KeyPairBundle, KeyPairVault};
use crate::secret::VaultSession;

pub fn fast_config() -> VaultConfig {
    VaultConfig::default()
        .with_kdf_iterations(64)
        .with_modulus_bits(2048)
}

pub fn shared_bundle() -> &'static (KeyPairVault, VaultSession, KeyPairBundle) {
    static BUNDLE: OnceLock<(KeyPairVault, VaultSession, KeyPairBundle)> = OnceLock::new();
    BUNDLE.get_or_init(|| {
        let vault = KeyPairVault::new(&fast_config());
        let session = VaultSession::generate();
        let bundle = vault.generate(&session).expect("key pair generation failed");
        (vault, session, bundle)
    })
}

pub struct TestKeys {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
    pub public_pem: String,
    pub private_pem: String,
}

/// A plain 2048-bit key pair for cipher tests.
pub fn shared_keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let (vault, session, bundle) = shared_bundle();
        let private = vault
            .open_private_key(bundle, session)
            .expect("opening shared private key failed");
        let public = private.to_public_key();
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .expect("encoding public key failed");
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encoding private key failed")
            .to_string();
        TestKeys {
            private,
            public,
            public_pem,
            private_pem,
        }
    })
}
