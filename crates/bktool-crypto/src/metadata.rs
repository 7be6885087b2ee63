//! Backup metadata file
//!
//! One `bktool-backup.info` JSON record sits at the root of every backup run,
//! next to the replicated source trees. It carries everything beyond the
//! passphrase that a restore needs to rebuild the key:
//! - the Argon2id salt (base64) and cost parameters
//! - the cipher framing (algorithm, chunk size)
//! - the names of the replicated source directories
//!
//! The record is written once with `create_new` and never modified.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bktool_core::{BkError, BkResult};
use serde::{Deserialize, Serialize};

use crate::kdf::{KdfParams, MIN_SALT_SIZE};
use crate::stream::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Well-known file name at the backup root
pub const METADATA_FILE: &str = "bktool-backup.info";

pub const METADATA_VERSION: u32 = 1;
pub const KDF_ALGORITHM: &str = "argon2id";
pub const CIPHER_ALGORITHM: &str = "xchacha20poly1305-chunked";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfRecord {
    pub algorithm: String,
    #[serde(flatten)]
    pub params: KdfParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherRecord {
    pub algorithm: String,
    /// Plaintext bytes per chunk used when the backup was written
    pub chunk_size: u32,
}

/// Metadata of one backup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Metadata format version
    pub version: u32,
    /// Argon2id salt (base64)
    pub salt: String,
    pub kdf: KdfRecord,
    pub cipher: CipherRecord,
    /// RFC 3339 creation time
    pub created_at: String,
    /// Directory names of the replicated sources, relative to the backup root
    #[serde(default)]
    pub sources: Vec<String>,
}

impl BackupMetadata {
    pub fn new(salt: &[u8], kdf: KdfParams, chunk_size: u32, sources: Vec<String>) -> Self {
        Self {
            version: METADATA_VERSION,
            salt: STANDARD.encode(salt),
            kdf: KdfRecord {
                algorithm: KDF_ALGORITHM.into(),
                params: kdf,
            },
            cipher: CipherRecord {
                algorithm: CIPHER_ALGORITHM.into(),
                chunk_size,
            },
            created_at: chrono::Utc::now().to_rfc3339(),
            sources,
        }
    }

    /// Path of the metadata file inside a backup root.
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(METADATA_FILE)
    }

    /// Decoded salt bytes.
    pub fn salt(&self) -> BkResult<Vec<u8>> {
        STANDARD
            .decode(&self.salt)
            .map_err(|e| BkError::Parse {
                path: PathBuf::from(METADATA_FILE),
                message: format!("salt is not valid base64: {e}"),
            })
    }

    pub fn kdf_params(&self) -> KdfParams {
        self.kdf.params
    }

    /// Write the record to `<root>/bktool-backup.info`. Fails with
    /// `AlreadyExists` rather than replacing another run's record.
    pub fn write(&self, root: &Path) -> BkResult<PathBuf> {
        let path = Self::path_in(root);
        let json = serde_json::to_vec_pretty(self).map_err(|e| BkError::Parse {
            path: path.clone(),
            message: format!("metadata serialization: {e}"),
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    BkError::AlreadyExists(path.clone())
                } else {
                    BkError::io(&path, e)
                }
            })?;
        file.write_all(&json)
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all())
            .map_err(|e| BkError::io(&path, e))?;

        tracing::debug!(path = %path.display(), "wrote backup metadata");
        Ok(path)
    }

    /// Read and validate the record at `<root>/bktool-backup.info`.
    pub fn read(root: &Path) -> BkResult<Self> {
        let path = Self::path_in(root);
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BkError::NotFound(path.clone())
            } else {
                BkError::io(&path, e)
            }
        })?;

        let parse_err = |message: String| BkError::Parse {
            path: path.clone(),
            message,
        };

        let meta: BackupMetadata = serde_json::from_slice(&data)
            .map_err(|e| parse_err(format!("metadata deserialization: {e}")))?;

        if meta.version != METADATA_VERSION {
            return Err(parse_err(format!("unsupported version {}", meta.version)));
        }
        if meta.kdf.algorithm != KDF_ALGORITHM {
            return Err(parse_err(format!("unknown KDF {:?}", meta.kdf.algorithm)));
        }
        meta.kdf
            .params
            .check()
            .map_err(|e| parse_err(format!("KDF parameters rejected: {e}")))?;
        if meta.cipher.algorithm != CIPHER_ALGORITHM {
            return Err(parse_err(format!("unknown cipher {:?}", meta.cipher.algorithm)));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&meta.cipher.chunk_size) {
            return Err(parse_err(format!("invalid chunk size {}", meta.cipher.chunk_size)));
        }
        let salt = STANDARD
            .decode(&meta.salt)
            .map_err(|e| parse_err(format!("salt is not valid base64: {e}")))?;
        if salt.len() < MIN_SALT_SIZE {
            return Err(parse_err(format!("salt too short: {} bytes", salt.len())));
        }
        for name in &meta.sources {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(parse_err(format!("invalid source name {name:?}")));
            }
        }

        Ok(meta)
    }
}
