//! Self-decrypting tokens for handing ephemeral credentials between steps.
//!
//! A token carries everything needed to reverse it, so it can travel through
//! a caller without any of its contents touching durable storage:
//!
//! ```text
//! inner = "{len key}|{len seed}|{len salt}|name:env;name:env;...{seed}{salt}"
//! outer = hex(scramble(base64(inner), key)) ‖ key ‖ "|{len key}"
//! token = base64(outer)
//! ```
//!
//! `key` and `seed` are hex strings of 90 to 150 random bytes, `salt` is the
//! hex of 16 random bytes, and each `env` is `base64(iv ‖ tag ‖ ciphertext)`
//! under `PBKDF2(seed, salt)`.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::cipher::Envelope;
use crate::config::VaultConfig;
use crate::crypt::{DerivedKey, SALT_LEN, random_bytes, random_pad};
use crate::error::{Result, VaultError};
use crate::scramble::{scramble_bytes, unscramble_bytes};

const FIELD_SEP: char = '|';
const ENTRY_SEP: char = ';';
const NAME_SEP: char = ':';

/// Values recovered from a token.
pub type SecureMap = BTreeMap<String, Zeroizing<String>>;

fn format_err(what: &str) -> VaultError {
    VaultError::Format(format!("secure token: {what}"))
}

fn parse_len(field: &str) -> Result<usize> {
    field
        .parse::<usize>()
        .map_err(|_| format_err("length field is not a number"))
}

#[derive(Debug, Clone)]
pub struct SecureBlobCodec {
    kdf_iterations: u32,
}

impl SecureBlobCodec {
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            kdf_iterations: config.kdf_iterations,
        }
    }

    /// Pack named values into an opaque, self-describing token.
    #[instrument(level = "debug", skip_all)]
    pub fn store<I, K, V>(&self, values: I) -> Result<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let obfuscation_key = Zeroizing::new(hex::encode(random_pad().as_slice()));
        let seed = Zeroizing::new(hex::encode(random_pad().as_slice()));
        let salt = hex::encode(random_bytes(SALT_LEN));
        let derived_key =
            DerivedKey::derive(seed.as_bytes(), salt.as_bytes(), self.kdf_iterations)?;

        let mut entries = Zeroizing::new(String::new());
        let mut count = 0usize;
        for (name, value) in values {
            let name = name.as_ref();
            if name.is_empty() || name.contains([FIELD_SEP, ENTRY_SEP, NAME_SEP]) {
                return Err(VaultError::Validation(format!(
                    "token entry name {name:?} is empty or contains a delimiter"
                )));
            }
            let envelope = Envelope::seal(value.as_ref().as_bytes(), derived_key.as_bytes())?;
            entries.push_str(name);
            entries.push(NAME_SEP);
            entries.push_str(&BASE64.encode(envelope.to_bytes()));
            entries.push(ENTRY_SEP);
            count += 1;
        }

        let inner = Zeroizing::new(format!(
            "{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}{}{}",
            obfuscation_key.len(),
            seed.len(),
            salt.len(),
            entries.as_str(),
            seed.as_str(),
            salt,
        ));
        let scrambled = scramble_bytes(inner.as_bytes(), obfuscation_key.as_bytes())?;

        let outer = Zeroizing::new(format!(
            "{}{}{FIELD_SEP}{}",
            hex::encode(scrambled.as_bytes()),
            obfuscation_key.as_str(),
            obfuscation_key.len()
        ));
        debug!(entries = count, "Packed secure token");
        Ok(BASE64.encode(outer.as_bytes()))
    }

    /// Reverse [`SecureBlobCodec::store`].
    #[instrument(level = "debug", skip_all)]
    pub fn recall(&self, token: &str) -> Result<SecureMap> {
        let outer = Zeroizing::new(
            BASE64
                .decode(token.trim())
                .map_err(|_| format_err("not base64"))?,
        );
        let outer = std::str::from_utf8(&outer).map_err(|_| format_err("not utf-8"))?;
        if !outer.is_ascii() {
            return Err(format_err("unexpected non-ascii framing"));
        }

        let (body, key_len) = outer
            .rsplit_once(FIELD_SEP)
            .ok_or_else(|| format_err("missing key length"))?;
        let key_len = parse_len(key_len)?;
        if key_len == 0 || key_len > body.len() {
            return Err(format_err("key length out of range"));
        }
        let (scrambled_hex, obfuscation_key) = body.split_at(body.len() - key_len);

        let scrambled = hex::decode(scrambled_hex).map_err(|_| format_err("body is not hex"))?;
        let scrambled =
            String::from_utf8(scrambled).map_err(|_| format_err("scrambled body not utf-8"))?;
        let inner = unscramble_bytes(&scrambled, obfuscation_key.as_bytes())?;
        let inner = std::str::from_utf8(&inner).map_err(|_| format_err("payload not utf-8"))?;

        let mut fields = inner.splitn(4, FIELD_SEP);
        let mut next_len = || -> Result<usize> {
            parse_len(fields.next().ok_or_else(|| format_err("missing header field"))?)
        };
        let inner_key_len = next_len()?;
        let seed_len = next_len()?;
        let salt_len = next_len()?;
        let combined = fields
            .next()
            .ok_or_else(|| format_err("missing payload"))?;
        if inner_key_len != key_len {
            return Err(format_err("key length mismatch"));
        }

        let trailer = seed_len
            .checked_add(salt_len)
            .filter(|t| *t <= combined.len() && *t > 0)
            .ok_or_else(|| format_err("seed and salt lengths out of range"))?;
        let split = combined.len() - trailer;
        if !combined.is_char_boundary(split) {
            return Err(format_err("seed and salt lengths out of range"));
        }
        let (entries, trailer) = combined.split_at(split);
        if !trailer.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format_err("seed and salt must be hex"));
        }
        let (seed, salt) = trailer.split_at(seed_len);

        let derived_key = DerivedKey::derive(seed.as_bytes(), salt.as_bytes(), self.kdf_iterations)?;

        let mut values = SecureMap::new();
        if entries.is_empty() {
            return Ok(values);
        }
        let entries = entries
            .strip_suffix(ENTRY_SEP)
            .ok_or_else(|| format_err("unterminated entry"))?;
        for entry in entries.split(ENTRY_SEP) {
            let (name, encoded) = entry
                .split_once(NAME_SEP)
                .ok_or_else(|| format_err("entry without name delimiter"))?;
            if name.is_empty() {
                return Err(format_err("entry with empty name"));
            }
            let raw = BASE64
                .decode(encoded)
                .map_err(|_| format_err("entry value is not base64"))?;
            let plain = Envelope::from_bytes(&raw)?.open(derived_key.as_bytes())?;
            let value = String::from_utf8(plain.to_vec())
                .map_err(|_| format_err("entry value is not utf-8"))?;
            values.insert(name.to_string(), Zeroizing::new(value));
        }
        debug!(entries = values.len(), "Recalled secure token");
        Ok(values)
    }
}
