//! Key derivation: Argon2id passphrase + salt → symmetric key

use argon2::{Algorithm, Argon2, Params, Version};
use bktool_core::config::CryptoConfig;
use bktool_core::{BkError, BkResult};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Length of a freshly generated salt
pub const SALT_SIZE: usize = 64;

/// Shortest salt Argon2 accepts
pub const MIN_SALT_SIZE: usize = 8;

/// Longest key `derive_key` will produce
pub const MAX_KEY_SIZE: usize = 64;

/// Upper bound on the Argon2id memory cost (4 GiB)
pub const MAX_MEM_COST_KIB: u32 = 4 * 1024 * 1024;

/// Upper bound on Argon2id passes
pub const MAX_TIME_COST: u32 = 64;

/// Upper bound on Argon2id lanes
pub const MAX_PARALLELISM: u32 = 64;

/// Key material derived from a passphrase.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: Vec<u8>,
}

impl DerivedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id cost parameters. Persisted in the backup metadata so a restore
/// uses exactly what the backup used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 32768 = 32 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 32 * 1024,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Check the costs against the accepted ranges. Metadata read from disk
    /// must pass this before any key is derived from it.
    pub fn check(&self) -> Result<(), String> {
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(format!(
                "parallelism {} out of range (1..={MAX_PARALLELISM})",
                self.parallelism
            ));
        }
        if self.time_cost == 0 || self.time_cost > MAX_TIME_COST {
            return Err(format!(
                "time cost {} out of range (1..={MAX_TIME_COST})",
                self.time_cost
            ));
        }
        // Argon2 needs at least 8 KiB per lane
        let min_mem = 8 * self.parallelism;
        if self.mem_cost_kib < min_mem || self.mem_cost_kib > MAX_MEM_COST_KIB {
            return Err(format!(
                "memory cost {} KiB out of range ({min_mem}..={MAX_MEM_COST_KIB})",
                self.mem_cost_kib
            ));
        }
        Ok(())
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(cfg: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// Fill a new salt from the OS random source.
pub fn generate_salt() -> BkResult<Vec<u8>> {
    let mut salt = vec![0u8; SALT_SIZE];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| BkError::Entropy(e.to_string()))?;
    Ok(salt)
}

/// Derive a `key_len`-byte key from a passphrase.
///
/// With `salt = None` a fresh random salt is generated (backup path); with
/// `Some(salt)` the given salt is used unchanged (restore path). The salt
/// actually used is returned next to the key so the caller can persist it.
pub fn derive_key(
    passphrase: &SecretString,
    salt: Option<&[u8]>,
    key_len: usize,
    params: &KdfParams,
) -> BkResult<(DerivedKey, Vec<u8>)> {
    if key_len == 0 || key_len > MAX_KEY_SIZE {
        return Err(BkError::KeyDerivation(format!(
            "key length {key_len} out of range (1..={MAX_KEY_SIZE})"
        )));
    }

    let salt = match salt {
        Some(s) => s.to_vec(),
        None => generate_salt()?,
    };
    if salt.len() < MIN_SALT_SIZE {
        return Err(BkError::KeyDerivation(format!(
            "salt too short: {} bytes (minimum {MIN_SALT_SIZE})",
            salt.len()
        )));
    }

    params.check().map_err(BkError::KeyDerivation)?;

    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(key_len),
    )
    .map_err(|e| BkError::KeyDerivation(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = vec![0u8; key_len];
    if let Err(e) =
        argon2.hash_password_into(passphrase.expose_secret().as_bytes(), &salt, &mut key)
    {
        key.zeroize();
        return Err(BkError::KeyDerivation(format!("Argon2id KDF failed: {e}")));
    }

    tracing::debug!(
        key_len,
        salt_len = salt.len(),
        mem_cost_kib = params.mem_cost_kib,
        time_cost = params.time_cost,
        "derived key"
    );

    Ok((DerivedKey::from_bytes(key), salt))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Use fast params for testing
    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from("test-passphrase-123");
        let salt = [1u8; 16];

        let (key1, salt1) = derive_key(&passphrase, Some(&salt), 32, &fast_params()).unwrap();
        let (key2, salt2) = derive_key(&passphrase, Some(&salt), 32, &fast_params()).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
        assert_eq!(salt1, salt.to_vec(), "a supplied salt is used unchanged");
        assert_eq!(salt1, salt2);
    }

    #[test]
    fn test_kdf_fresh_salt() {
        let passphrase = SecretString::from("same-passphrase");

        let (key1, salt1) = derive_key(&passphrase, None, 32, &fast_params()).unwrap();
        let (key2, salt2) = derive_key(&passphrase, None, 32, &fast_params()).unwrap();

        assert_eq!(salt1.len(), SALT_SIZE);
        assert_ne!(salt1, salt2, "every run gets its own salt");
        assert_ne!(key1.as_bytes(), key2.as_bytes());

        // Feeding the returned salt back reproduces the key
        let (again, _) = derive_key(&passphrase, Some(&salt1), 32, &fast_params()).unwrap();
        assert_eq!(again.as_bytes(), key1.as_bytes());
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let salt = [1u8; 16];

        let (key1, _) =
            derive_key(&SecretString::from("passphrase-a"), Some(&salt), 32, &fast_params())
                .unwrap();
        let (key2, _) =
            derive_key(&SecretString::from("passphrase-b"), Some(&salt), 32, &fast_params())
                .unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different passphrases must produce different keys"
        );
    }

    #[test]
    fn test_kdf_different_salts() {
        let passphrase = SecretString::from("same-passphrase");

        let (key1, _) = derive_key(&passphrase, Some(&[1u8; 16]), 32, &fast_params()).unwrap();
        let (key2, _) = derive_key(&passphrase, Some(&[2u8; 16]), 32, &fast_params()).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different salts must produce different keys"
        );
    }

    #[test]
    fn test_kdf_params_affect_key() {
        let passphrase = SecretString::from("pw");
        let salt = [9u8; 16];
        let heavier = KdfParams {
            time_cost: 2,
            ..fast_params()
        };

        let (key1, _) = derive_key(&passphrase, Some(&salt), 32, &fast_params()).unwrap();
        let (key2, _) = derive_key(&passphrase, Some(&salt), 32, &heavier).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_invalid_key_length() {
        let passphrase = SecretString::from("pw");
        for len in [0, MAX_KEY_SIZE + 1] {
            let err = derive_key(&passphrase, Some(&[0u8; 16]), len, &fast_params()).unwrap_err();
            assert_eq!(err.kind(), "key_derivation", "length {len}");
        }
    }

    #[test]
    fn test_kdf_short_salt() {
        let err = derive_key(&SecretString::from("pw"), Some(&[0u8; 4]), 32, &fast_params())
            .unwrap_err();
        assert!(matches!(err, BkError::KeyDerivation(_)));
    }

    #[test]
    fn test_kdf_params_bounds() {
        assert!(KdfParams::default().check().is_ok());
        assert!(fast_params().check().is_ok());

        let oversized = [
            KdfParams {
                mem_cost_kib: MAX_MEM_COST_KIB + 1,
                ..fast_params()
            },
            KdfParams {
                time_cost: MAX_TIME_COST + 1,
                ..fast_params()
            },
            KdfParams {
                parallelism: MAX_PARALLELISM + 1,
                ..fast_params()
            },
            KdfParams {
                time_cost: 0,
                ..fast_params()
            },
            KdfParams {
                mem_cost_kib: 4_000_000_000,
                time_cost: u32::MAX,
                parallelism: 16_777_215,
            },
        ];
        for params in oversized {
            assert!(params.check().is_err(), "{params:?}");
            let err = derive_key(&SecretString::from("pw"), Some(&[0u8; 16]), 32, &params)
                .unwrap_err();
            assert_eq!(err.kind(), "key_derivation");
        }
    }

    #[test]
    fn test_key_debug_redacted() {
        let key = DerivedKey::from_bytes(vec![0x41; 32]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("65"));
    }
}
