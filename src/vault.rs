//! Token-gated access to a store.
//!
//! [`TinyEnv::start`] creates a fresh session, seals an `INIT` key pair with
//! it, and hands the session back to the caller packed in a secure token
//! alongside an Argon2 verifier of the credential. Later calls present the
//! token instead of the raw credential.

use std::path::PathBuf;

use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::kv::EnvStore;
use crate::secret::{Credential, Salt, VaultSession, hash_credential, verify_credential};
use crate::token::{SecureBlobCodec, SecureMap};

/// Key pair name used for token-gated stores.
pub const INIT_NAME: &str = "INIT";

const OTP_FIELD: &str = "otp";
const SALT_FIELD: &str = "salt";
const VERIFIER_FIELD: &str = "verifier";

#[derive(Debug, Clone, Default)]
pub struct TinyEnv {
    config: VaultConfig,
}

impl TinyEnv {
    pub fn new(config: VaultConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    fn codec(&self) -> SecureBlobCodec {
        SecureBlobCodec::new(&self.config)
    }

    fn store_at(&self, dir: impl Into<PathBuf>) -> Result<EnvStore> {
        EnvStore::open(dir, self.config.clone())
    }

    /// Initialise the `INIT` key pair in `dir` and return the access token.
    ///
    /// Other records in the file are kept. Values previously stored under an
    /// older `INIT` key pair can no longer be opened.
    #[instrument(level = "debug", skip_all)]
    pub fn start(&self, dir: impl Into<PathBuf>) -> Result<String> {
        let store = self.store_at(dir)?;
        let session = VaultSession::generate();
        let verifier = hash_credential(session.credential())?;

        store.init(INIT_NAME, &session, false)?;

        let otp = session.credential().to_base64();
        let salt = session.salt().to_base64();
        let token = self.codec().store([
            (OTP_FIELD, otp.as_str()),
            (SALT_FIELD, salt.as_str()),
            (VERIFIER_FIELD, verifier.as_str()),
        ])?;
        info!(path = ?store.path(), "Started token-gated store");
        Ok(token)
    }

    /// Encrypt `fields` into the store at `dir` using the session in `token`.
    #[instrument(level = "debug", skip_all)]
    pub fn store<I, K, V>(&self, token: &str, dir: impl Into<PathBuf>, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let session = self.session_from(token)?;
        self.store_at(dir)?.put(INIT_NAME, fields, &session)
    }

    /// Read one value from the store at `dir` using the session in `token`.
    #[instrument(level = "debug", skip(self, token, dir))]
    pub fn get(
        &self,
        token: &str,
        dir: impl Into<PathBuf>,
        key: &str,
    ) -> Result<Option<Zeroizing<String>>> {
        let session = self.session_from(token)?;
        self.store_at(dir)?.get(INIT_NAME, key, &session)
    }

    fn session_from(&self, token: &str) -> Result<VaultSession> {
        let values = self.codec().recall(token)?;
        let session = session_from_values(&values)?;
        let verifier = field(&values, VERIFIER_FIELD)?;
        if !verify_credential(session.credential(), verifier) {
            warn!("Token credential does not match its verifier");
            return Err(VaultError::Unauthorized);
        }
        Ok(session)
    }
}

fn field<'a>(values: &'a SecureMap, name: &str) -> Result<&'a str> {
    values
        .get(name)
        .map(|v| v.as_str())
        .ok_or_else(|| VaultError::Format(format!("token has no {name} field")))
}

fn session_from_values(values: &SecureMap) -> Result<VaultSession> {
    let credential = Credential::from_base64(field(values, OTP_FIELD)?)?;
    let salt = Salt::from_base64(field(values, SALT_FIELD)?)?;
    let session = VaultSession::new(credential, salt);
    session.ensure_usable()?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fast_config;
    use serial_test::serial;
    use tempfile::TempDir;

    fn tinyenv() -> TinyEnv {
        TinyEnv::new(fast_config())
    }

    #[test]
    #[serial]
    fn test_start_store_get() {
        let dir = TempDir::new().unwrap();
        let env = tinyenv();
        let token = env.start(dir.path()).unwrap();

        env.store(&token, dir.path(), [("SECRET", "value-123")])
            .unwrap();
        let value = env.get(&token, dir.path(), "SECRET").unwrap().unwrap();
        assert_eq!(value.as_str(), "value-123");
        assert!(env.get(&token, dir.path(), "OTHER").unwrap().is_none());
    }

    #[test]
    #[serial]
    fn test_swapped_credential_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        let env = tinyenv();
        let token = env.start(dir.path()).unwrap();

        let values = env.codec().recall(&token).unwrap();
        let other = Credential::generate().to_base64();
        let forged = env
            .codec()
            .store([
                (OTP_FIELD, other.as_str()),
                (SALT_FIELD, values[SALT_FIELD].as_str()),
                (VERIFIER_FIELD, values[VERIFIER_FIELD].as_str()),
            ])
            .unwrap();

        assert!(matches!(
            env.get(&forged, dir.path(), "SECRET"),
            Err(VaultError::Unauthorized)
        ));
        assert!(matches!(
            env.store(&forged, dir.path(), [("SECRET", "x")]),
            Err(VaultError::Unauthorized)
        ));
    }

    #[test]
    fn test_token_missing_fields() {
        let dir = TempDir::new().unwrap();
        let env = tinyenv();
        let token = env.codec().store([(OTP_FIELD, "b3Rw")]).unwrap();
        assert!(matches!(
            env.get(&token, dir.path(), "SECRET"),
            Err(VaultError::Format(_))
        ));
        assert!(env.get("not a token", dir.path(), "SECRET").is_err());
    }
}
