//! AES-256 primitives.
//!
//! GCM is the authenticated mode used for every envelope. CBC is only used
//! to wrap GCM tags that are already authenticated by their own ciphertext,
//! never on data handed in from outside.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use zeroize::Zeroizing;

use crate::crypt::{KEY_LEN, random_bytes};
use crate::error::{Result, VaultError};

/// GCM nonce length.
pub const GCM_IV_LEN: usize = 12;
/// CBC initialisation vector length (one AES block).
pub const CBC_IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Output of an AEAD encryption: nonce, detached tag and ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub iv: [u8; GCM_IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serialise as `iv ‖ tag ‖ ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(GCM_IV_LEN + TAG_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GCM_IV_LEN + TAG_LEN {
            return Err(VaultError::Format(format!(
                "envelope is {} bytes, shorter than its {} byte header",
                bytes.len(),
                GCM_IV_LEN + TAG_LEN
            )));
        }
        let (iv, rest) = bytes.split_at(GCM_IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        Ok(Self {
            iv: iv.try_into().map_err(|_| VaultError::Format("bad iv".into()))?,
            tag: tag
                .try_into()
                .map_err(|_| VaultError::Format("bad tag".into()))?,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Encrypt under a freshly drawn nonce.
    pub fn seal(plaintext: &[u8], key: &[u8]) -> Result<Self> {
        let iv = random_gcm_iv();
        let (ciphertext, tag) = aead_encrypt(plaintext, key, &iv)?;
        Ok(Self {
            iv,
            tag,
            ciphertext,
        })
    }

    pub fn open(&self, key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        aead_decrypt(&self.ciphertext, key, &self.iv, &self.tag)
    }
}

pub fn random_gcm_iv() -> [u8; GCM_IV_LEN] {
    let mut iv = [0u8; GCM_IV_LEN];
    iv.copy_from_slice(&random_bytes(GCM_IV_LEN));
    iv
}

pub fn random_cbc_iv() -> [u8; CBC_IV_LEN] {
    let mut iv = [0u8; CBC_IV_LEN];
    iv.copy_from_slice(&random_bytes(CBC_IV_LEN));
    iv
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LEN {
        return Err(VaultError::Validation(format!(
            "symmetric key must be {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Ok(())
}

fn check_iv(iv: &[u8], expected: usize) -> Result<()> {
    if iv.len() != expected {
        return Err(VaultError::Validation(format!(
            "iv must be {expected} bytes, got {}",
            iv.len()
        )));
    }
    Ok(())
}

/// AES-256-GCM encryption with a detached tag.
///
/// The caller owns nonce freshness: never reuse `iv` under the same `key`.
pub fn aead_encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<(Vec<u8>, [u8; TAG_LEN])> {
    check_key(key)?;
    check_iv(iv, GCM_IV_LEN)?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| VaultError::Validation("invalid gcm key".to_string()))?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(iv), b"", &mut buffer)
        .map_err(|_| VaultError::Validation("plaintext too long for gcm".to_string()))?;
    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok((buffer, tag_bytes))
}

/// AES-256-GCM decryption. Any tag mismatch yields `IntegrityFailed` and no
/// plaintext.
pub fn aead_decrypt(
    ciphertext: &[u8],
    key: &[u8],
    iv: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    check_key(key)?;
    check_iv(iv, GCM_IV_LEN)?;
    if tag.len() != TAG_LEN {
        return Err(VaultError::IntegrityFailed("gcm tag has the wrong length"));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| VaultError::Validation("invalid gcm key".to_string()))?;
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(iv),
            b"",
            buffer.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| VaultError::IntegrityFailed("gcm tag mismatch"))?;
    Ok(buffer)
}

/// AES-256-CBC with PKCS#7 padding. Unauthenticated.
pub fn cbc_encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    check_key(key)?;
    check_iv(iv, CBC_IV_LEN)?;
    let encryptor = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| VaultError::Validation("invalid cbc key or iv".to_string()))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

pub fn cbc_decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    check_key(key)?;
    check_iv(iv, CBC_IV_LEN)?;
    if ciphertext.is_empty() || ciphertext.len() % CBC_IV_LEN != 0 {
        return Err(VaultError::PaddingFailed(
            "ciphertext is not a whole number of blocks",
        ));
    }
    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| VaultError::Validation("invalid cbc key or iv".to_string()))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::PaddingFailed("invalid pkcs7 padding"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [0x42; KEY_LEN];

    #[test]
    fn test_aead_roundtrip() {
        let iv = random_gcm_iv();
        for plaintext in [&b""[..], &b"a"[..], &b"hello-secret"[..], &[0xABu8; 1000][..]] {
            let (ciphertext, tag) = aead_encrypt(plaintext, &KEY, &iv).unwrap();
            assert_eq!(ciphertext.len(), plaintext.len());
            let decrypted = aead_decrypt(&ciphertext, &KEY, &iv, &tag).unwrap();
            assert_eq!(decrypted.as_slice(), plaintext);
        }
    }

    #[test]
    fn test_aead_bit_flips_fail_closed() {
        let iv = random_gcm_iv();
        let (ciphertext, tag) = aead_encrypt(b"tamper with me", &KEY, &iv).unwrap();

        for byte in 0..ciphertext.len() {
            for bit in 0..8 {
                let mut flipped = ciphertext.clone();
                flipped[byte] ^= 1 << bit;
                assert!(matches!(
                    aead_decrypt(&flipped, &KEY, &iv, &tag),
                    Err(VaultError::IntegrityFailed(_))
                ));
            }
        }
        for byte in 0..TAG_LEN {
            let mut flipped = tag;
            flipped[byte] ^= 0x01;
            assert!(matches!(
                aead_decrypt(&ciphertext, &KEY, &iv, &flipped),
                Err(VaultError::IntegrityFailed(_))
            ));
        }
    }

    #[test]
    fn test_aead_wrong_key() {
        let iv = random_gcm_iv();
        let (ciphertext, tag) = aead_encrypt(b"payload", &KEY, &iv).unwrap();
        let other = [0x43; KEY_LEN];
        assert!(matches!(
            aead_decrypt(&ciphertext, &other, &iv, &tag),
            Err(VaultError::IntegrityFailed(_))
        ));
    }

    #[test]
    fn test_rejects_bad_lengths() {
        assert!(matches!(
            aead_encrypt(b"x", &[0u8; 16], &[0u8; GCM_IV_LEN]),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            aead_encrypt(b"x", &KEY, &[0u8; CBC_IV_LEN]),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            cbc_encrypt(b"x", &KEY, &[0u8; GCM_IV_LEN]),
            Err(VaultError::Validation(_))
        ));
    }

    #[test]
    fn test_cbc_roundtrip_and_padding() {
        let iv = random_cbc_iv();
        let tag = [7u8; TAG_LEN];
        let wrapped = cbc_encrypt(&tag, &KEY, &iv).unwrap();
        // A full block of plaintext gains a full block of padding.
        assert_eq!(wrapped.len(), 32);
        assert_eq!(cbc_decrypt(&wrapped, &KEY, &iv).unwrap().as_slice(), &tag);

        assert!(matches!(
            cbc_decrypt(&wrapped[..31], &KEY, &iv),
            Err(VaultError::PaddingFailed(_))
        ));
    }

    #[test]
    fn test_envelope_bytes() {
        let envelope = Envelope::seal(b"value", &KEY).unwrap();
        let parsed = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.open(&KEY).unwrap().as_slice(), b"value");
        assert!(matches!(
            Envelope::from_bytes(&[0u8; 10]),
            Err(VaultError::Format(_))
        ));
    }
}
