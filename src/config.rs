use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Iteration count for PBKDF2-HMAC-SHA256. Deliberately slow.
pub const DEFAULT_KDF_ITERATIONS: u32 = 1_000_000;
/// RSA modulus size used for generated key pairs.
pub const DEFAULT_MODULUS_BITS: usize = 4096;
/// Modulus sizes the hybrid cipher knows how to frame.
pub const SUPPORTED_MODULUS_BITS: [usize; 3] = [2048, 3072, 4096];

/// Tunables for a vault instance.
///
/// Every component receives the values it needs from here explicitly;
/// nothing reads process-wide state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct VaultConfig {
    pub kdf_iterations: u32,
    pub modulus_bits: usize,
    /// File name of the flat store inside the vault directory.
    pub env_file_name: String,
    /// How many times a writer retries taking the store lock.
    pub lock_retries: u32,
    pub lock_retry_delay_ms: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            modulus_bits: DEFAULT_MODULUS_BITS,
            env_file_name: ".env".to_string(),
            lock_retries: 50,
            lock_retry_delay_ms: 20,
        }
    }
}

impl VaultConfig {
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations;
        self
    }

    pub fn with_modulus_bits(mut self, bits: usize) -> Self {
        self.modulus_bits = bits;
        self
    }

    pub fn with_env_file_name(mut self, name: impl Into<String>) -> Self {
        self.env_file_name = name.into();
        self
    }

    /// Modulus length in bytes, i.e. the size of one OAEP block.
    pub fn modulus_len(&self) -> usize {
        self.modulus_bits / 8
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations == 0 {
            return Err(VaultError::Config(
                "kdf_iterations must be at least 1".to_string(),
            ));
        }
        if !SUPPORTED_MODULUS_BITS.contains(&self.modulus_bits) {
            return Err(VaultError::Config(format!(
                "modulus_bits must be one of {:?}, got {}",
                SUPPORTED_MODULUS_BITS, self.modulus_bits
            )));
        }
        if self.env_file_name.is_empty()
            || self.env_file_name.contains(['/', '\\'])
            || self.env_file_name == "."
            || self.env_file_name == ".."
        {
            return Err(VaultError::Config(format!(
                "invalid env file name: {:?}",
                self.env_file_name
            )));
        }
        Ok(())
    }
}
