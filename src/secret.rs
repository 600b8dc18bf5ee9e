use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretSlice};
use tracing::{debug, instrument};
use zeroize::{Zeroize, Zeroizing};

use crate::crypt::{SALT_LEN, random_bytes, random_pad};
use crate::error::{Result, VaultError};

/// The one-time credential (OTP) gating a vault.
///
/// It derives the key that seals the vault's key pair and doubles as the
/// XOR pad over every envelope. Zeroized when dropped.
#[derive(Clone)]
pub struct Credential(SecretSlice<u8>);

impl Credential {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(SecretSlice::from(bytes))
    }

    /// Draw a credential of random length (90 to 150 bytes).
    pub fn generate() -> Self {
        let mut pad = random_pad();
        let credential = Self::new(pad.to_vec());
        pad.zeroize();
        credential
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        BASE64
            .decode(encoded)
            .map(Self::new)
            .map_err(|_| VaultError::Validation("credential is not valid base64".to_string()))
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.0.expose_secret()))
    }

    pub fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    /// Reject empty credentials before they reach the KDF or the scrambler.
    pub fn ensure_usable(&self) -> Result<()> {
        if self.is_empty() {
            return Err(VaultError::Validation(
                "credential must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Salt paired with a credential for key derivation.
#[derive(Clone)]
pub struct Salt(SecretSlice<u8>);

impl Salt {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(SecretSlice::from(bytes))
    }

    pub fn generate() -> Self {
        Self::new(random_bytes(SALT_LEN))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        BASE64
            .decode(encoded)
            .map(Self::new)
            .map_err(|_| VaultError::Validation("salt is not valid base64".to_string()))
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.0.expose_secret()))
    }

    pub fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }

    pub fn ensure_usable(&self) -> Result<()> {
        if self.0.expose_secret().is_empty() {
            return Err(VaultError::Validation("salt must not be empty".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Salt([REDACTED])")
    }
}

/// Credential and salt for one vault session.
///
/// Created once by the caller and passed to every operation. Independent
/// sessions can coexist, and tests can inject fixed values with
/// [`VaultSession::new`]. Both halves are wiped when the session drops.
#[derive(Clone, Debug)]
pub struct VaultSession {
    credential: Credential,
    salt: Salt,
}

impl VaultSession {
    pub fn new(credential: Credential, salt: Salt) -> Self {
        Self { credential, salt }
    }

    pub fn generate() -> Self {
        Self {
            credential: Credential::generate(),
            salt: Salt::generate(),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    pub fn ensure_usable(&self) -> Result<()> {
        self.credential.ensure_usable()?;
        self.salt.ensure_usable()
    }
}

/// Hash a credential into an Argon2 PHC string for later verification.
#[instrument(level = "debug", skip_all)]
pub fn hash_credential(credential: &Credential) -> Result<String> {
    credential.ensure_usable()?;
    let salt = SaltString::encode_b64(&random_bytes(SALT_LEN))
        .map_err(|e| VaultError::Validation(format!("verifier salt: {e}")))?;
    let hash = Argon2::default()
        .hash_password(credential.expose(), &salt)
        .map_err(|e| VaultError::Validation(format!("hashing credential: {e}")))?;
    Ok(hash.to_string())
}

/// Check a credential against a verifier from [`hash_credential`].
///
/// A malformed verifier counts as a mismatch.
#[instrument(level = "debug", skip_all)]
pub fn verify_credential(credential: &Credential, verifier: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(verifier) else {
        debug!("credential verifier is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(credential.expose(), &parsed)
        .is_ok()
}
