//! RSA-OAEP + AES-256-GCM hybrid encryption of arbitrary-length values.
//!
//! Token layout before scrambling:
//! `oaep(iv) ‖ oaep(tag) ‖ oaep(session_key) ‖ gcm_ciphertext`, each OAEP
//! block exactly one modulus long.

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::cipher::{GCM_IV_LEN, TAG_LEN, aead_decrypt, aead_encrypt, random_gcm_iv};
use crate::config::{SUPPORTED_MODULUS_BITS, VaultConfig};
use crate::crypt::SessionKey;
use crate::error::{Result, VaultError};
use crate::scramble::{scramble_bytes, unscramble_bytes};
use crate::secret::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridCipher {
    block_len: usize,
}

impl HybridCipher {
    /// Build a cipher framing OAEP blocks for a `bits`-bit modulus.
    pub fn for_modulus_bits(bits: usize) -> Result<Self> {
        if !SUPPORTED_MODULUS_BITS.contains(&bits) {
            return Err(VaultError::Config(format!(
                "modulus of {bits} bits is not one of {SUPPORTED_MODULUS_BITS:?}"
            )));
        }
        Ok(Self {
            block_len: bits / 8,
        })
    }

    pub fn new(config: &VaultConfig) -> Result<Self> {
        Self::for_modulus_bits(config.modulus_bits)
    }

    /// Size in bytes of each wrapped session parameter.
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    fn check_size(&self, actual: usize) -> Result<()> {
        if actual != self.block_len {
            return Err(VaultError::UnsupportedKeySize {
                expected: self.block_len,
                actual,
            });
        }
        Ok(())
    }

    /// Encrypt under a PEM (SPKI) public key.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        public_pem: &str,
        credential: &Credential,
    ) -> Result<String> {
        let public = RsaPublicKey::from_public_key_pem(public_pem).map_err(|_| {
            VaultError::Validation("public key is not a PEM encoded RSA public key".to_string())
        })?;
        self.encrypt_with_key(plaintext, &public, credential)
    }

    #[instrument(level = "debug", skip_all, fields(len = plaintext.len()))]
    pub fn encrypt_with_key(
        &self,
        plaintext: &[u8],
        public: &RsaPublicKey,
        credential: &Credential,
    ) -> Result<String> {
        credential.ensure_usable()?;
        self.check_size(public.size())?;

        let session_key = SessionKey::generate();
        let iv = random_gcm_iv();
        let (ciphertext, tag) = aead_encrypt(plaintext, session_key.as_bytes(), &iv)?;

        let mut payload = Vec::with_capacity(3 * self.block_len + ciphertext.len());
        for part in [&iv[..], &tag[..], session_key.as_bytes()] {
            let block = public
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), part)
                .map_err(|e| VaultError::Validation(format!("oaep wrap failed: {e}")))?;
            self.check_size(block.len())?;
            payload.extend_from_slice(&block);
        }
        payload.extend_from_slice(&ciphertext);

        debug!(token_len = payload.len(), "Hybrid encryption complete");
        scramble_bytes(&payload, credential.expose())
    }

    /// Decrypt under a PKCS#8 PEM private key.
    pub fn decrypt(
        &self,
        token: &str,
        private_pem: &str,
        credential: &Credential,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem).map_err(|_| {
            VaultError::Validation("private key is not a PKCS#8 PEM RSA private key".to_string())
        })?;
        self.decrypt_with_key(token, &private, credential)
    }

    #[instrument(level = "debug", skip_all)]
    pub fn decrypt_with_key(
        &self,
        token: &str,
        private: &RsaPrivateKey,
        credential: &Credential,
    ) -> Result<Zeroizing<Vec<u8>>> {
        credential.ensure_usable()?;
        self.check_size(private.size())?;

        let payload = unscramble_bytes(token, credential.expose())?;
        let header = 3 * self.block_len;
        if payload.len() < header {
            return Err(VaultError::Format(format!(
                "hybrid token is {} bytes, shorter than its {header} byte key header",
                payload.len()
            )));
        }

        let (blocks, ciphertext) = payload.split_at(header);
        let unwrap = |block: &[u8]| -> Result<Zeroizing<Vec<u8>>> {
            private
                .decrypt(Oaep::new::<Sha256>(), block)
                .map(Zeroizing::new)
                .map_err(|_| VaultError::IntegrityFailed("oaep unwrap failed"))
        };
        let iv = unwrap(&blocks[..self.block_len])?;
        let tag = unwrap(&blocks[self.block_len..2 * self.block_len])?;
        let session_key = SessionKey::from_slice(&unwrap(&blocks[2 * self.block_len..])?)?;

        if iv.len() != GCM_IV_LEN || tag.len() != TAG_LEN {
            return Err(VaultError::IntegrityFailed(
                "unwrapped session parameters have the wrong length",
            ));
        }

        aead_decrypt(ciphertext, session_key.as_bytes(), &iv, &tag)
    }
}
