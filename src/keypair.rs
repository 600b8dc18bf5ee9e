//! Key pair generation and tag vaulting.
//!
//! A generated RSA key pair is stored as two AES-256-GCM ciphertexts under a
//! key derived from the session credential. The GCM tags and nonces needed
//! to open them live only in the scrambled `hashes` blob:
//!
//! ```text
//! combined = enc_pu_tag ‖ enc_pv_tag ‖ tag_iv(16) ‖ pu_iv(12) ‖ pv_iv(12)
//!            ‖ be32(len enc_pu_tag) ‖ be32(len enc_pv_tag)
//! hashes   = scramble(base64(cbc(combined, blob_iv) ‖ blob_iv), credential)
//! ```
//!
//! Both key ciphertexts use their own nonce, and the outer CBC layer has its
//! own IV.

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::cipher::{
    CBC_IV_LEN, GCM_IV_LEN, aead_decrypt, aead_encrypt, cbc_decrypt, cbc_encrypt, random_cbc_iv,
    random_gcm_iv,
};
use crate::config::VaultConfig;
use crate::crypt::DerivedKey;
use crate::error::{Result, VaultError};
use crate::scramble::{scramble_bytes, unscramble_bytes};
use crate::secret::VaultSession;

const LEN_FIELD: usize = 4;

/// Which half of the key pair to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHalf {
    Public,
    Private,
}

/// A sealed key pair. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairBundle {
    /// GCM ciphertext of the PEM-encoded public key, without nonce or tag.
    pub public_ciphertext: Vec<u8>,
    /// GCM ciphertext of the PKCS#8 PEM private key, without nonce or tag.
    pub private_ciphertext: Vec<u8>,
    /// Scrambled base64 blob holding the wrapped tags and nonces.
    pub hashes: String,
}

/// Wrapped tags plus every IV needed to open a bundle.
struct SealedTags {
    enc_pu_tag: Vec<u8>,
    enc_pv_tag: Vec<u8>,
    tag_iv: [u8; CBC_IV_LEN],
    pu_iv: [u8; GCM_IV_LEN],
    pv_iv: [u8; GCM_IV_LEN],
}

impl SealedTags {
    fn to_combined(&self) -> Result<Vec<u8>> {
        let pu_len = u32::try_from(self.enc_pu_tag.len())
            .map_err(|_| VaultError::Format("wrapped tag too long".to_string()))?;
        let pv_len = u32::try_from(self.enc_pv_tag.len())
            .map_err(|_| VaultError::Format("wrapped tag too long".to_string()))?;

        let mut out = Vec::with_capacity(
            self.enc_pu_tag.len()
                + self.enc_pv_tag.len()
                + CBC_IV_LEN
                + 2 * GCM_IV_LEN
                + 2 * LEN_FIELD,
        );
        out.extend_from_slice(&self.enc_pu_tag);
        out.extend_from_slice(&self.enc_pv_tag);
        out.extend_from_slice(&self.tag_iv);
        out.extend_from_slice(&self.pu_iv);
        out.extend_from_slice(&self.pv_iv);
        out.extend_from_slice(&pu_len.to_be_bytes());
        out.extend_from_slice(&pv_len.to_be_bytes());
        Ok(out)
    }

    fn from_combined(combined: &[u8]) -> Result<Self> {
        let fixed = CBC_IV_LEN + 2 * GCM_IV_LEN + 2 * LEN_FIELD;
        if combined.len() < fixed {
            return Err(VaultError::Format(format!(
                "tag blob is {} bytes, expected at least {fixed}",
                combined.len()
            )));
        }
        let n = combined.len();
        let pu_len = read_be32(&combined[n - 2 * LEN_FIELD..n - LEN_FIELD])?;
        let pv_len = read_be32(&combined[n - LEN_FIELD..])?;

        let tags_len = pu_len
            .checked_add(pv_len)
            .ok_or_else(|| VaultError::Format("tag lengths overflow".to_string()))?;
        if tags_len + fixed != n {
            return Err(VaultError::Format(format!(
                "tag lengths {pu_len}+{pv_len} do not fit a {n} byte blob"
            )));
        }

        let (enc_pu_tag, rest) = combined.split_at(pu_len);
        let (enc_pv_tag, rest) = rest.split_at(pv_len);
        let (tag_iv, rest) = rest.split_at(CBC_IV_LEN);
        let (pu_iv, rest) = rest.split_at(GCM_IV_LEN);
        let (pv_iv, _) = rest.split_at(GCM_IV_LEN);

        Ok(Self {
            enc_pu_tag: enc_pu_tag.to_vec(),
            enc_pv_tag: enc_pv_tag.to_vec(),
            tag_iv: tag_iv
                .try_into()
                .map_err(|_| VaultError::Format("bad tag iv".to_string()))?,
            pu_iv: pu_iv
                .try_into()
                .map_err(|_| VaultError::Format("bad public iv".to_string()))?,
            pv_iv: pv_iv
                .try_into()
                .map_err(|_| VaultError::Format("bad private iv".to_string()))?,
        })
    }
}

fn read_be32(bytes: &[u8]) -> Result<usize> {
    let field: [u8; LEN_FIELD] = bytes
        .try_into()
        .map_err(|_| VaultError::Format("truncated length field".to_string()))?;
    Ok(u32::from_be_bytes(field) as usize)
}

/// Generates and opens sealed key pairs.
#[derive(Debug, Clone)]
pub struct KeyPairVault {
    kdf_iterations: u32,
    modulus_bits: usize,
}

impl KeyPairVault {
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            kdf_iterations: config.kdf_iterations,
            modulus_bits: config.modulus_bits,
        }
    }

    /// Generate a fresh RSA key pair and seal it under the session.
    #[instrument(level = "debug", skip_all, fields(bits = self.modulus_bits))]
    pub fn generate(&self, session: &VaultSession) -> Result<KeyPairBundle> {
        session.ensure_usable()?;

        info!("Generating {}-bit RSA key pair", self.modulus_bits);
        let private = RsaPrivateKey::new(&mut OsRng, self.modulus_bits)
            .map_err(|e| VaultError::KeyGeneration(e.to_string()))?;
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| VaultError::KeyGeneration(format!("encoding private key: {e}")))?;
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| VaultError::KeyGeneration(format!("encoding public key: {e}")))?;
        drop(private);

        let derived_key = DerivedKey::derive(
            session.credential().expose(),
            session.salt().expose(),
            self.kdf_iterations,
        )?;
        let key = derived_key.as_bytes();

        let pu_iv = random_gcm_iv();
        let pv_iv = random_gcm_iv();
        let tag_iv = random_cbc_iv();
        let blob_iv = random_cbc_iv();

        let (public_ciphertext, pu_tag) = aead_encrypt(public_pem.as_bytes(), key, &pu_iv)?;
        let (private_ciphertext, pv_tag) = aead_encrypt(private_pem.as_bytes(), key, &pv_iv)?;

        let tags = SealedTags {
            enc_pu_tag: cbc_encrypt(&pu_tag, key, &tag_iv)?,
            enc_pv_tag: cbc_encrypt(&pv_tag, key, &tag_iv)?,
            tag_iv,
            pu_iv,
            pv_iv,
        };
        let combined = Zeroizing::new(tags.to_combined()?);

        let mut blob = cbc_encrypt(&combined, key, &blob_iv)?;
        blob.extend_from_slice(&blob_iv);
        let hashes = scramble_bytes(&blob, session.credential().expose())?;

        debug!(
            public_len = public_ciphertext.len(),
            private_len = private_ciphertext.len(),
            "Sealed key pair"
        );

        Ok(KeyPairBundle {
            public_ciphertext,
            private_ciphertext,
            hashes,
        })
    }

    fn derive(&self, session: &VaultSession) -> Result<DerivedKey> {
        DerivedKey::derive(
            session.credential().expose(),
            session.salt().expose(),
            self.kdf_iterations,
        )
        .map_err(|e| e.during("deriving the vault key"))
    }

    /// Recover one half of a sealed key pair as PEM text.
    ///
    /// Every failure after input validation is reported as
    /// `KeyRecoveryFailed` naming the stage; no key material is returned on
    /// error.
    #[instrument(level = "debug", skip(self, bundle, session))]
    pub fn open(
        &self,
        bundle: &KeyPairBundle,
        session: &VaultSession,
        which: KeyHalf,
    ) -> Result<Zeroizing<String>> {
        session.ensure_usable()?;
        let derived_key = self.derive(session)?;
        recover(bundle, session, &derived_key, which)
    }

    /// Open both halves with a single key derivation.
    #[instrument(level = "debug", skip_all)]
    pub fn open_pair(
        &self,
        bundle: &KeyPairBundle,
        session: &VaultSession,
    ) -> Result<(RsaPublicKey, RsaPrivateKey)> {
        session.ensure_usable()?;
        let derived_key = self.derive(session)?;
        let public = recover(bundle, session, &derived_key, KeyHalf::Public)?;
        let private = recover(bundle, session, &derived_key, KeyHalf::Private)?;
        Ok((parse_public(&public)?, parse_private(&private)?))
    }

    pub fn open_public_key(
        &self,
        bundle: &KeyPairBundle,
        session: &VaultSession,
    ) -> Result<RsaPublicKey> {
        parse_public(&self.open(bundle, session, KeyHalf::Public)?)
    }

    pub fn open_private_key(
        &self,
        bundle: &KeyPairBundle,
        session: &VaultSession,
    ) -> Result<RsaPrivateKey> {
        parse_private(&self.open(bundle, session, KeyHalf::Private)?)
    }
}

fn recover(
    bundle: &KeyPairBundle,
    session: &VaultSession,
    derived_key: &DerivedKey,
    which: KeyHalf,
) -> Result<Zeroizing<String>> {
    let key = derived_key.as_bytes();

    let blob = unscramble_bytes(&bundle.hashes, session.credential().expose())
        .map_err(|e| e.during("unscrambling the tag blob"))?;
    if blob.len() <= CBC_IV_LEN {
        return Err(
            VaultError::Format("tag blob too short".to_string()).during("splitting the tag blob")
        );
    }
    let (wrapped, blob_iv) = blob.split_at(blob.len() - CBC_IV_LEN);

    let combined =
        cbc_decrypt(wrapped, key, blob_iv).map_err(|e| e.during("unwrapping the tag blob"))?;
    let tags =
        SealedTags::from_combined(&combined).map_err(|e| e.during("parsing the tag blob"))?;

    let (enc_tag, iv, ciphertext) = match which {
        KeyHalf::Public => (&tags.enc_pu_tag, &tags.pu_iv, &bundle.public_ciphertext),
        KeyHalf::Private => (&tags.enc_pv_tag, &tags.pv_iv, &bundle.private_ciphertext),
    };

    let tag =
        cbc_decrypt(enc_tag, key, &tags.tag_iv).map_err(|e| e.during("unwrapping the key tag"))?;
    let plain =
        aead_decrypt(ciphertext, key, iv, &tag).map_err(|e| e.during("decrypting the key"))?;

    let pem = String::from_utf8(plain.to_vec())
        .map_err(|_| VaultError::Format("key is not utf-8".to_string()).during("decoding the key"))?;
    Ok(Zeroizing::new(pem))
}

fn parse_public(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|_| {
        VaultError::Format("public key pem".to_string()).during("parsing the public key")
    })
}

fn parse_private(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|_| {
        VaultError::Format("private key pem".to_string()).during("parsing the private key")
    })
}
