//! Flat `KEY=VALUE` secret store.
//!
//! A store is a single file inside a vault directory. Each named key pair
//! occupies four records, and every secret sits under its own bare key:
//!
//! ```text
//! <NAME>_PU_KEY=<base64 public key ciphertext>
//! <NAME>_PV_KEY=<base64 private key ciphertext>
//! <NAME>_HASH=<scrambled tag blob>
//! <NAME>_SCRAM=<hex hybrid token of the data key>
//! <KEY>=<hex(scramble(base64(hybrid token), data key))>
//! ```

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::crypt::random_pad;
use crate::error::{Result, VaultError};
use crate::hybrid::HybridCipher;
use crate::keypair::{KeyPairBundle, KeyPairVault};
use crate::scramble::{scramble_bytes, unscramble_bytes};
use crate::secret::VaultSession;

pub const PU_KEY_SUFFIX: &str = "_PU_KEY";
pub const PV_KEY_SUFFIX: &str = "_PV_KEY";
pub const HASH_SUFFIX: &str = "_HASH";
pub const SCRAM_SUFFIX: &str = "_SCRAM";

const BUNDLE_SUFFIXES: [&str; 4] = [PU_KEY_SUFFIX, PV_KEY_SUFFIX, HASH_SUFFIX, SCRAM_SUFFIX];

/// Records of a store file in file order. Later duplicates replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvRecords {
    entries: Vec<(String, String)>,
}

impl EnvRecords {
    pub fn parse(content: &str) -> Self {
        let mut records = Self::default();
        for (n, line) in content.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => records.insert(key, value),
                None => warn!(line = n + 1, "Skipping store line without '='"),
            }
        }
        records
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the value in place, or append a new record.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// Read and parse a store file.
pub fn load(path: impl AsRef<Path>) -> Result<EnvRecords> {
    let content = fs::read_to_string(path.as_ref())?;
    Ok(EnvRecords::parse(&content))
}

fn bundle_key(name: &str, suffix: &str) -> String {
    format!("{name}{suffix}")
}

fn validate_record_key(what: &str, key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['=', '\n', '\r']) || key.trim() != key {
        return Err(VaultError::Validation(format!(
            "{what} {key:?} must be non-empty, unpadded, and free of '=' and newlines"
        )));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r']) {
        return Err(VaultError::Validation(format!(
            "value for {key:?} must not contain newlines"
        )));
    }
    Ok(())
}

/// Exclusive advisory lock on `<env file>.lock`, held for the lifetime of a
/// write. The OS releases it if the holder dies. The file is never removed.
struct WriteLock {
    file: File,
}

impl WriteLock {
    fn acquire(path: &Path, retries: u32, delay: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        set_owner_only(path)?;

        for attempt in 0..=retries {
            match file.try_lock() {
                Ok(()) => return Ok(Self { file }),
                Err(TryLockError::WouldBlock) => {
                    debug!(attempt, "Store is locked, retrying");
                    thread::sleep(delay);
                }
                Err(TryLockError::Error(e)) => return Err(e.into()),
            }
        }
        Err(VaultError::Io(io::Error::new(
            ErrorKind::WouldBlock,
            format!("store lock {} is held by another writer", path.display()),
        )))
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release store lock: {}", e);
        }
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

/// Handle on one store file. Cheap to clone; clones share the in-process
/// write guard.
#[derive(Clone)]
pub struct EnvStore {
    dir: PathBuf,
    config: VaultConfig,
    vault: KeyPairVault,
    hybrid: HybridCipher,
    write_guard: Arc<Mutex<()>>,
}

impl EnvStore {
    /// Open the store living in `dir`. The file itself need not exist yet.
    pub fn open(dir: impl Into<PathBuf>, config: VaultConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();
        let metadata = fs::metadata(&dir).map_err(|e| {
            VaultError::Config(format!("vault directory {}: {e}", dir.display()))
        })?;
        if !metadata.is_dir() {
            return Err(VaultError::Config(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        if metadata.permissions().readonly() {
            return Err(VaultError::Config(format!(
                "vault directory {} is read-only",
                dir.display()
            )));
        }

        Ok(Self {
            vault: KeyPairVault::new(&config),
            hybrid: HybridCipher::new(&config)?,
            dir,
            config,
            write_guard: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.config.env_file_name)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.config.env_file_name))
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn load(&self) -> Result<EnvRecords> {
        load(self.path())
    }

    fn load_or_empty(&self) -> Result<EnvRecords> {
        match self.load() {
            Ok(records) => Ok(records),
            Err(VaultError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(EnvRecords::default()),
            Err(e) => Err(e),
        }
    }

    /// Whether the store holds a complete key pair under `name`.
    pub fn has_bundle(&self, name: &str) -> Result<bool> {
        Ok(bundle_from(&self.load_or_empty()?, name)?.is_some())
    }

    /// Generate the key pair and data key for `name` and write them.
    ///
    /// With `overwrite` the file is replaced outright; otherwise the bundle
    /// records are merged into whatever the file already holds.
    #[instrument(level = "debug", skip(self, session))]
    pub fn init(&self, name: &str, session: &VaultSession, overwrite: bool) -> Result<()> {
        validate_record_key("bundle name", name)?;
        session.ensure_usable()?;

        self.write_locked(|| {
            let mut records = if overwrite {
                EnvRecords::default()
            } else {
                self.load_or_empty()?
            };
            self.seal_bundle(name, session, &mut records)?;
            Ok(records)
        })?;
        info!(name, "Initialised key pair records");
        Ok(())
    }

    /// Encrypt each field and merge it into the store in a single write.
    #[instrument(level = "debug", skip(self, fields, session))]
    pub fn put<I, K, V>(&self, name: &str, fields: I, session: &VaultSession) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        validate_record_key("bundle name", name)?;
        session.ensure_usable()?;

        let fields: Vec<(K, V)> = fields.into_iter().collect();
        for (key, value) in &fields {
            let key = key.as_ref();
            validate_record_key("record key", key)?;
            validate_value(key, value.as_ref())?;
            // Any bundle's records, not only this name's, are immutable.
            if BUNDLE_SUFFIXES.iter().any(|suffix| key.ends_with(suffix)) {
                return Err(VaultError::Validation(format!(
                    "record key {key:?} is reserved for key pair records"
                )));
            }
        }

        self.write_locked(|| {
            let mut records = self.load_or_empty()?;
            let bundle = match bundle_from(&records, name)? {
                Some(bundle) => bundle,
                None => {
                    info!(name, "No key pair records yet, initialising");
                    self.seal_bundle(name, session, &mut records)?
                }
            };

            let (public, private) = self.vault.open_pair(&bundle, session)?;
            let data_key = self.open_data_key(&records, name, &private, session)?;

            for (key, value) in &fields {
                let record = self.seal_value(value.as_ref(), &public, &data_key, session)?;
                records.insert(key.as_ref(), record);
            }
            debug!(count = fields.len(), "Sealed store values");
            Ok(records)
        })
    }

    /// Decrypt the value stored under `key`, if any.
    ///
    /// The caller is authenticated by opening the key pair before the key is
    /// looked up, so a wrong credential fails even for absent keys.
    #[instrument(level = "debug", skip(self, session))]
    pub fn get(
        &self,
        name: &str,
        key: &str,
        session: &VaultSession,
    ) -> Result<Option<Zeroizing<String>>> {
        validate_record_key("bundle name", name)?;
        session.ensure_usable()?;

        let records = self.load()?;
        let bundle = bundle_from(&records, name)?.ok_or_else(|| {
            VaultError::Validation(format!("store has no key pair named {name:?}"))
        })?;
        let (_, private) = self.vault.open_pair(&bundle, session)?;
        let data_key = self.open_data_key(&records, name, &private, session)?;

        let Some(record) = records.get(key) else {
            debug!("Key not present in store");
            return Ok(None);
        };

        let scrambled = hex::decode(record)
            .map_err(|_| VaultError::Format(format!("record {key:?} is not hex")))?;
        let scrambled = String::from_utf8(scrambled)
            .map_err(|_| VaultError::Format(format!("record {key:?} is not utf-8")))?;
        let token = unscramble_bytes(&scrambled, &data_key)?;
        let token = std::str::from_utf8(&token)
            .map_err(|_| VaultError::Format(format!("record {key:?} token is not utf-8")))?;

        let plain = self
            .hybrid
            .decrypt_with_key(token, &private, session.credential())?;
        let value = String::from_utf8(plain.to_vec())
            .map_err(|_| VaultError::Format(format!("value for {key:?} is not utf-8")))?;
        Ok(Some(Zeroizing::new(value)))
    }

    fn seal_bundle(
        &self,
        name: &str,
        session: &VaultSession,
        records: &mut EnvRecords,
    ) -> Result<KeyPairBundle> {
        let bundle = self.vault.generate(session)?;
        let public = self.vault.open_public_key(&bundle, session)?;

        let data_key = random_pad();
        let scram = self
            .hybrid
            .encrypt_with_key(&data_key, &public, session.credential())?;

        records.insert(
            bundle_key(name, PU_KEY_SUFFIX),
            BASE64.encode(&bundle.public_ciphertext),
        );
        records.insert(
            bundle_key(name, PV_KEY_SUFFIX),
            BASE64.encode(&bundle.private_ciphertext),
        );
        records.insert(bundle_key(name, HASH_SUFFIX), bundle.hashes.clone());
        records.insert(bundle_key(name, SCRAM_SUFFIX), hex::encode(scram.as_bytes()));
        Ok(bundle)
    }

    fn open_data_key(
        &self,
        records: &EnvRecords,
        name: &str,
        private: &RsaPrivateKey,
        session: &VaultSession,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let scram_key = bundle_key(name, SCRAM_SUFFIX);
        let scram = records
            .get(&scram_key)
            .ok_or_else(|| VaultError::Format(format!("missing {scram_key} record")))?;
        let token = hex::decode(scram)
            .map_err(|_| VaultError::Format(format!("{scram_key} is not hex")))?;
        let token = String::from_utf8(token)
            .map_err(|_| VaultError::Format(format!("{scram_key} is not utf-8")))?;
        let data_key = self
            .hybrid
            .decrypt_with_key(&token, private, session.credential())?;
        if data_key.is_empty() {
            return Err(VaultError::IntegrityFailed("empty data key"));
        }
        Ok(data_key)
    }

    fn seal_value(
        &self,
        value: &str,
        public: &RsaPublicKey,
        data_key: &[u8],
        session: &VaultSession,
    ) -> Result<String> {
        let token = self
            .hybrid
            .encrypt_with_key(value.as_bytes(), public, session.credential())?;
        let scrambled = scramble_bytes(token.as_bytes(), data_key)?;
        Ok(hex::encode(scrambled.as_bytes()))
    }

    /// Run `build` under both write locks and atomically replace the file
    /// with the records it returns.
    fn write_locked<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce() -> Result<EnvRecords>,
    {
        // A poisoned guard protects no data, so it is safe to reuse.
        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _lock = WriteLock::acquire(
            &self.lock_path(),
            self.config.lock_retries,
            Duration::from_millis(self.config.lock_retry_delay_ms),
        )?;

        let records = build()?;
        self.replace_file(&records)
    }

    fn replace_file(&self, records: &EnvRecords) -> Result<()> {
        let path = self.path();
        let mut tmp = tempfile::Builder::new()
            .prefix(".tinyenv-")
            .tempfile_in(&self.dir)?;
        tmp.write_all(records.render().as_bytes())?;
        tmp.as_file().sync_all()?;
        set_owner_only(tmp.path())?;
        tmp.persist(&path).map_err(|e| VaultError::Io(e.error))?;
        set_owner_only(&path)?;
        debug!(records = records.len(), path = ?path, "Wrote store file");
        Ok(())
    }
}

fn bundle_from(records: &EnvRecords, name: &str) -> Result<Option<KeyPairBundle>> {
    let field = |suffix: &str| records.get(&bundle_key(name, suffix));
    let (Some(public), Some(private), Some(hashes)) = (
        field(PU_KEY_SUFFIX),
        field(PV_KEY_SUFFIX),
        field(HASH_SUFFIX),
    ) else {
        return Ok(None);
    };

    let decode = |what: &str, value: &str| {
        BASE64
            .decode(value)
            .map_err(|_| VaultError::Format(format!("{name}{what} is not base64")))
    };
    Ok(Some(KeyPairBundle {
        public_ciphertext: decode(PU_KEY_SUFFIX, public)?,
        private_ciphertext: decode(PV_KEY_SUFFIX, private)?,
        hashes: hashes.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::{Credential, Salt};
    use crate::testutil::fast_config;
    use serial_test::serial;
    use tempfile::TempDir;

    fn store() -> (TempDir, EnvStore) {
        let dir = TempDir::new().unwrap();
        let store = EnvStore::open(dir.path(), fast_config()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_parse_records() {
        let records = EnvRecords::parse("A=1\n\n# note\nB=x=y==\nbroken\nA=2\r\nC=\n");
        assert_eq!(records.get("A"), Some("2"));
        assert_eq!(records.get("B"), Some("x=y=="));
        assert_eq!(records.get("C"), Some(""));
        assert_eq!(records.get("broken"), None);
        let keys: Vec<&str> = records.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["A", "B", "C"]);
    }

    #[test]
    fn test_render_roundtrip() {
        let mut records = EnvRecords::default();
        records.insert("B", "2");
        records.insert("A", "a=b");
        records.insert("B", "3");
        assert_eq!(records.render(), "B=3\nA=a=b\n");
        assert_eq!(EnvRecords::parse(&records.render()), records);
    }

    #[test]
    fn test_open_rejects_bad_dirs() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            EnvStore::open(dir.path().join("missing"), fast_config()),
            Err(VaultError::Config(_))
        ));

        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            EnvStore::open(&file, fast_config()),
            Err(VaultError::Config(_))
        ));

        assert!(matches!(
            EnvStore::open(dir.path(), fast_config().with_modulus_bits(1024)),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_get_without_file() {
        let (_dir, store) = store();
        let session = VaultSession::generate();
        assert!(matches!(
            store.get("APP", "SECRET", &session),
            Err(VaultError::Io(_))
        ));
    }

    #[test]
    #[serial]
    fn test_put_get_roundtrip() {
        let (_dir, store) = store();
        let session = VaultSession::generate();
        store
            .put("APP", [("SECRET", "value-123"), ("DSN", "a=b;c")], &session)
            .unwrap();

        let value = store.get("APP", "SECRET", &session).unwrap().unwrap();
        assert_eq!(value.as_str(), "value-123");
        let value = store.get("APP", "DSN", &session).unwrap().unwrap();
        assert_eq!(value.as_str(), "a=b;c");
        assert!(store.get("APP", "MISSING", &session).unwrap().is_none());

        let records = store.load().unwrap();
        for suffix in BUNDLE_SUFFIXES {
            assert!(records.get(&format!("APP{suffix}")).is_some());
        }
        assert_ne!(records.get("SECRET"), Some("value-123"));
        assert!(store.has_bundle("APP").unwrap());
    }

    #[test]
    #[serial]
    fn test_put_merges_and_replaces() {
        let (_dir, store) = store();
        let session = VaultSession::generate();
        store.put("APP", [("A", "1"), ("B", "2")], &session).unwrap();
        let hash_before = store.load().unwrap().get("APP_HASH").map(str::to_string);

        store.put("APP", [("B", "two"), ("C", "3")], &session).unwrap();

        let records = store.load().unwrap();
        assert_eq!(records.get("APP_HASH").map(str::to_string), hash_before);
        for (key, expected) in [("A", "1"), ("B", "two"), ("C", "3")] {
            let value = store.get("APP", key, &session).unwrap().unwrap();
            assert_eq!(value.as_str(), expected);
        }
    }

    #[test]
    #[serial]
    fn test_wrong_credential_fails() {
        let (_dir, store) = store();
        let session = VaultSession::generate();
        store.put("APP", [("SECRET", "value-123")], &session).unwrap();

        let wrong = VaultSession::new(Credential::generate(), session.salt().clone());
        assert!(matches!(
            store.get("APP", "SECRET", &wrong),
            Err(VaultError::KeyRecoveryFailed { .. })
        ));
        let wrong = VaultSession::new(session.credential().clone(), Salt::generate());
        assert!(matches!(
            store.get("APP", "MISSING", &wrong),
            Err(VaultError::KeyRecoveryFailed { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_init_overwrite() {
        let (_dir, store) = store();
        let session = VaultSession::generate();
        store.put("APP", [("A", "1")], &session).unwrap();

        store.init("OTHER", &session, false).unwrap();
        let records = store.load().unwrap();
        assert!(records.get("A").is_some());
        assert!(records.get("APP_PU_KEY").is_some());
        assert!(records.get("OTHER_SCRAM").is_some());

        store.init("OTHER", &session, true).unwrap();
        let records = store.load().unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.get("A").is_none());
        assert!(!store.has_bundle("APP").unwrap());
    }

    #[test]
    fn test_rejects_bad_keys() {
        let (_dir, store) = store();
        let session = VaultSession::generate();
        for key in ["", "A=B", "A\nB", " A", "APP_PU_KEY", "APP_SCRAM", "OTHER_HASH", "X_PV_KEY"] {
            assert!(matches!(
                store.put("APP", [(key, "v")], &session),
                Err(VaultError::Validation(_))
            ));
        }
        assert!(matches!(
            store.put("APP", [("A", "line\nbreak")], &session),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            store.put("", [("A", "v")], &session),
            Err(VaultError::Validation(_))
        ));
        assert!(!store.path().exists());
    }

    /// Files in `dir` other than the store and its lock file.
    fn stray_files(dir: &Path) -> Vec<std::ffi::OsString> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .filter(|name| name != ".env" && name != ".env.lock")
            .collect()
    }

    #[test]
    fn test_held_lock_blocks_writers() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config();
        config.lock_retries = 2;
        config.lock_retry_delay_ms = 1;
        let store = EnvStore::open(dir.path(), config).unwrap();

        let holder = File::create(store.lock_path()).unwrap();
        holder.lock().unwrap();

        let err = store
            .put("APP", [("A", "1")], &VaultSession::generate())
            .unwrap_err();
        assert!(matches!(err, VaultError::Io(ref e) if e.kind() == ErrorKind::WouldBlock));
        assert!(!store.path().exists());
    }

    #[test]
    #[serial]
    fn test_leftover_lock_file_does_not_block() {
        let (_dir, store) = store();
        // A writer that died leaves the file but no OS lock behind.
        fs::write(store.lock_path(), "").unwrap();

        let session = VaultSession::generate();
        store.put("APP", [("A", "1")], &session).unwrap();
        let value = store.get("APP", "A", &session).unwrap().unwrap();
        assert_eq!(value.as_str(), "1");
    }

    #[test]
    #[serial]
    fn test_concurrent_writers_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let session = VaultSession::generate();
        let mut config = fast_config();
        config.lock_retries = 1000;
        config.lock_retry_delay_ms = 5;
        let first = EnvStore::open(dir.path(), config.clone()).unwrap();
        let second = EnvStore::open(dir.path(), config).unwrap();
        first.init("APP", &session, false).unwrap();

        thread::scope(|scope| {
            for (store, prefix) in [(&first, "FIRST"), (&second, "SECOND")] {
                let session = &session;
                scope.spawn(move || {
                    for i in 0..5 {
                        let key = format!("{prefix}_{i}");
                        store.put("APP", [(key.as_str(), key.as_str())], session).unwrap();
                    }
                });
            }
        });

        let records = first.load().unwrap();
        assert_eq!(records.len(), 4 + 10);
        for prefix in ["FIRST", "SECOND"] {
            for i in 0..5 {
                let key = format!("{prefix}_{i}");
                let value = second.get("APP", &key, &session).unwrap().unwrap();
                assert_eq!(value.as_str(), key);
            }
        }
        assert!(stray_files(dir.path()).is_empty());
        // Nobody is left holding the lock.
        File::open(first.lock_path()).unwrap().try_lock().unwrap();
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, store) = store();
        store
            .put("APP", [("A", "1")], &VaultSession::generate())
            .unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(stray_files(dir.path()).is_empty());
    }
}
