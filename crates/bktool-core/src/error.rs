use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::Mode;

pub type BkResult<T> = Result<T, BkError>;

#[derive(Debug, Error)]
pub enum BkError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("random source unavailable: {0}")]
    Entropy(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("cipher mode mismatch: operation needs {expected} but cipher was built for {actual}")]
    ModeMismatch { expected: Mode, actual: Mode },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("I/O error on {}: {source}", .path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("malformed {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("refusing to overwrite existing {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("config error: {0}")]
    Config(String),

    #[error("{}: {source}", .path.display())]
    Entry {
        path: PathBuf,
        #[source]
        source: Box<BkError>,
    },
}

impl BkError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        BkError::IoAt {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Attach the offending tree entry to any error.
    pub fn entry(path: impl AsRef<Path>, source: BkError) -> Self {
        BkError::Entry {
            path: path.as_ref().to_path_buf(),
            source: Box::new(source),
        }
    }

    /// Stable short name of the error class, used in run reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BkError::KeyDerivation(_) | BkError::Entropy(_) => "key_derivation",
            BkError::InvalidParameter(_) => "invalid_parameter",
            BkError::ModeMismatch { .. } => "mode_mismatch",
            BkError::Authentication(_) => "authentication",
            BkError::IoAt { .. } | BkError::Io(_) => "io",
            BkError::NotFound(_) => "not_found",
            BkError::Parse { .. } => "parse",
            BkError::AlreadyExists(_) => "already_exists",
            BkError::Config(_) => "config",
            BkError::Entry { source, .. } => source.kind(),
        }
    }

    /// Re-tag an untyped I/O error with a path. Typed errors that travelled
    /// through an `io::Error` (e.g. out of a cipher reader) are kept as is.
    pub fn with_path(self, path: impl AsRef<Path>) -> Self {
        match self {
            BkError::Io(source) => BkError::io(path, source),
            other => other,
        }
    }
}

/// Cipher readers hand typed errors back through `io::Read`; unwrap them here
/// so callers see `Authentication` rather than an opaque I/O failure.
impl From<io::Error> for BkError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<BkError>()) {
            let kind = err.kind();
            if let Some(Ok(typed)) = err.into_inner().map(|inner| inner.downcast::<BkError>()) {
                return *typed;
            }
            return BkError::Io(kind.into());
        }
        BkError::Io(err)
    }
}

impl From<BkError> for io::Error {
    fn from(err: BkError) -> Self {
        match err {
            BkError::Io(source) => source,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_error_survives_io_carrier() {
        let carried: io::Error = BkError::Authentication("chunk 3".into()).into();
        assert_eq!(carried.kind(), io::ErrorKind::InvalidData);

        let back = BkError::from(carried);
        assert!(matches!(back, BkError::Authentication(ref m) if m == "chunk 3"));
    }

    #[test]
    fn plain_io_error_stays_io() {
        let err = BkError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), "io");
        let tagged = err.with_path("/tmp/x");
        assert!(tagged.to_string().contains("/tmp/x"));
    }

    #[test]
    fn entry_reports_inner_kind() {
        let err = BkError::entry("a/b.txt", BkError::Authentication("tag mismatch".into()));
        assert_eq!(err.kind(), "authentication");
        assert!(err.to_string().starts_with("a/b.txt: "));
    }
}
