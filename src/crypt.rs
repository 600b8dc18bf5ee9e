use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use sha2::Sha256;
use tracing::instrument;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, VaultError};

/// Length of every symmetric key used by the vault (AES-256).
pub const KEY_LEN: usize = 32;
/// Salt length for vault sessions.
pub const SALT_LEN: usize = 16;
/// Bounds for the random length of generated pads (credentials, data keys).
pub const PAD_MIN_LEN: usize = 90;
pub const PAD_MAX_LEN: usize = 150;

/// Fill a fresh buffer with `len` bytes from the thread-local CSPRNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// Random bytes of a random length in `PAD_MIN_LEN..=PAD_MAX_LEN`.
pub fn random_pad() -> Zeroizing<Vec<u8>> {
    let len = rand::random_range(PAD_MIN_LEN..=PAD_MAX_LEN);
    Zeroizing::new(random_bytes(len))
}

/// Run PBKDF2-HMAC-SHA256 and return `output_len` bytes.
///
/// An empty credential or salt is accepted here; callers that hold a
/// `Credential` reject empty ones before reaching the KDF.
#[instrument(level = "debug", skip(credential, salt))]
pub fn derive_bytes(
    credential: &[u8],
    salt: &[u8],
    iterations: u32,
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if iterations == 0 {
        return Err(VaultError::Validation(
            "kdf iteration count must be non-zero".to_string(),
        ));
    }
    if output_len == 0 {
        return Err(VaultError::Validation(
            "kdf output length must be non-zero".to_string(),
        ));
    }
    let mut out = Zeroizing::new(vec![0u8; output_len]);
    pbkdf2_hmac::<Sha256>(credential, salt, iterations, &mut out);
    Ok(out)
}

/// A 256-bit key derived from a credential and salt.
///
/// Derived on demand for every operation and never persisted.
pub struct DerivedKey {
    key: SecretSlice<u8>,
}

impl DerivedKey {
    pub fn derive(credential: &[u8], salt: &[u8], iterations: u32) -> Result<Self> {
        let key = derive_bytes(credential, salt, iterations, KEY_LEN)?;
        Ok(Self {
            key: SecretSlice::new(key.to_vec().into()),
        })
    }

    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.key.expose_secret()
    }
}

impl Zeroize for DerivedKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for DerivedKey {}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// A one-shot symmetric key for a single hybrid encryption.
#[derive(Clone, Debug)]
pub struct SessionKey {
    key: SecretSlice<u8>,
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = random_bytes(KEY_LEN);
        let session_key = Self {
            key: SecretSlice::new(key.clone().into()),
        };
        key.zeroize();
        session_key
    }

    /// Rebuild a session key unwrapped from a hybrid ciphertext.
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(VaultError::IntegrityFailed(
                "unwrapped session key has the wrong length",
            ));
        }
        Ok(Self {
            key: SecretSlice::new(key.to_vec().into()),
        })
    }

    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.key.expose_secret()
    }
}

impl Zeroize for SessionKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for SessionKey {}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}
