//! bktool-crypto: encryption layer for bktool backups
//!
//! Key flow:
//! ```text
//! passphrase + salt ──Argon2id──▶ DerivedKey (256-bit, zeroized on drop)
//!                                    └── StreamCipher: XChaCha20-Poly1305, one frame per file
//! salt + KDF params ──▶ bktool-backup.info (BackupMetadata, at the backup root)
//! ```
//!
//! Every regular file becomes one frame: a 25-byte header carrying a fresh
//! random nonce prefix, followed by fixed-size chunks that are each sealed
//! under `prefix || chunk_index`. See [`stream`] for the exact layout.

pub mod kdf;
pub mod metadata;
pub mod stream;

pub use kdf::{derive_key, generate_salt, DerivedKey, KdfParams};
pub use metadata::{BackupMetadata, METADATA_FILE};
pub use stream::{frame_overhead, DecryptReader, EncryptReader, StreamCipher};

/// Size of the stream cipher key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
