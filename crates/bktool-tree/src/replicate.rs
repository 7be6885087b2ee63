//! Tree replication: mirror a directory tree through a `StreamCipher`
//!
//! Walks depth-first with siblings in name order and never follows symlinks:
//!   - directories are created (an existing one is opened up for its owner),
//!     walked, then get their attributes, so read-only directories can still
//!     be filled on every run
//!   - symlinks are recreated with the same target, content untouched
//!   - regular files stream through the cipher into `.<name>.bktool-partial`,
//!     are synced, then renamed into place before attributes are set
//!
//! Reported byte counts are plaintext sizes in both directions.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use bktool_core::{BkError, BkResult, EntryKind, FailurePolicy, Mode};
use bktool_crypto::StreamCipher;
use tracing::{debug, warn};

use crate::attrs::{self, Attributes};

/// Progress callback type (path of the file just processed, its plaintext bytes)
pub type ProgressFn = Box<dyn Fn(&Path, u64) + Send + Sync>;

const PARTIAL_SUFFIX: &str = ".bktool-partial";

/// One entry that could not be replicated
#[derive(Debug, Clone)]
pub struct EntryFailure {
    pub path: PathBuf,
    /// Short error class, see `BkError::kind`
    pub kind: &'static str,
    pub message: String,
}

/// Outcome of replicating (or verifying) one tree
#[derive(Debug, Clone, Default)]
pub struct ReplicateReport {
    /// Plaintext bytes of all successfully processed regular files
    pub bytes: u64,
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    /// Sockets, FIFOs and device nodes, which are not copied
    pub skipped: u64,
    pub failures: Vec<EntryFailure>,
}

impl ReplicateReport {
    /// True if any entry failed and was skipped.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Replicates trees through one cipher. The cipher's mode decides whether
/// file content is encrypted or decrypted on the way.
pub struct Replicator<'a> {
    cipher: &'a StreamCipher,
    policy: FailurePolicy,
    ownership: bool,
    progress: Option<&'a ProgressFn>,
}

impl<'a> Replicator<'a> {
    pub fn new(cipher: &'a StreamCipher) -> Self {
        Self {
            cipher,
            policy: FailurePolicy::default(),
            ownership: true,
            progress: None,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether uid/gid are copied (permission bits always are).
    pub fn with_ownership(mut self, ownership: bool) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn with_progress(mut self, progress: Option<&'a ProgressFn>) -> Self {
        self.progress = progress;
        self
    }

    /// Mirror the children of `source_root` into `dest_root` (created if
    /// absent). Under `FailFast` the first failing entry is returned as
    /// `BkError::Entry`; under `BestEffort` failures land in the report.
    pub fn replicate(&self, source_root: &Path, dest_root: &Path) -> BkResult<ReplicateReport> {
        let meta = fs::metadata(source_root).map_err(|e| BkError::io(source_root, e))?;
        if !meta.is_dir() {
            return Err(BkError::InvalidParameter(format!(
                "not a directory: {}",
                source_root.display()
            )));
        }
        ensure_dir(dest_root)?;
        open_for_writing(dest_root)?;

        let mut report = ReplicateReport::default();
        self.replicate_dir(source_root, dest_root, &mut report)?;
        Ok(report)
    }

    /// Authenticate every regular file under `root` without writing anything.
    /// Needs a decryption cipher.
    pub fn verify(&self, root: &Path) -> BkResult<ReplicateReport> {
        if self.cipher.mode() != Mode::Decrypt {
            return Err(BkError::ModeMismatch {
                expected: Mode::Decrypt,
                actual: self.cipher.mode(),
            });
        }
        let mut report = ReplicateReport::default();
        self.verify_dir(root, &mut report)?;
        Ok(report)
    }

    fn replicate_dir(&self, src_dir: &Path, dst_dir: &Path, report: &mut ReplicateReport) -> BkResult<()> {
        for name in sorted_children(src_dir)? {
            let src = src_dir.join(&name);
            let dst = dst_dir.join(&name);
            if let Err(e) = self.replicate_entry(&src, &dst, report) {
                self.handle_failure(&src, e, report)?;
            }
        }
        Ok(())
    }

    fn replicate_entry(&self, src: &Path, dst: &Path, report: &mut ReplicateReport) -> BkResult<()> {
        let meta = fs::symlink_metadata(src).map_err(|e| BkError::io(src, e))?;
        let kind = EntryKind::from_file_type(meta.file_type());

        match kind {
            EntryKind::Directory => {
                ensure_dir(dst)?;
                open_for_writing(dst)?;
                self.replicate_dir(src, dst, report)?;
                report.dirs += 1;
            }
            EntryKind::Symlink => {
                copy_symlink(src, dst)?;
                report.symlinks += 1;
            }
            EntryKind::File => {
                let bytes = self.copy_file(src, dst)?;
                report.bytes += bytes;
                report.files += 1;
                debug!(path = %src.display(), bytes, "copied file");
                if let Some(cb) = self.progress {
                    cb(src, bytes);
                }
            }
            EntryKind::Other => {
                warn!(path = %src.display(), "skipping special file");
                report.skipped += 1;
                return Ok(());
            }
        }

        attrs::apply(dst, &Attributes::of(&meta), kind, self.ownership)
    }

    /// Stream one file through the cipher. Nothing appears under `dst` unless
    /// the whole stream succeeded; a failed attempt leaves no file behind.
    fn copy_file(&self, src: &Path, dst: &Path) -> BkResult<u64> {
        let input = File::open(src).map_err(|e| BkError::io(src, e))?;
        let partial = partial_path(dst);

        let result = self.write_through(input, src, &partial).and_then(|bytes| {
            fs::rename(&partial, dst).map_err(|e| BkError::io(dst, e))?;
            Ok(bytes)
        });
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }

    fn write_through(&self, input: File, src: &Path, partial: &Path) -> BkResult<u64> {
        let out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(partial)
            .map_err(|e| BkError::io(partial, e))?;
        let mut writer = BufWriter::new(out);

        let bytes = match self.cipher.mode() {
            Mode::Encrypt => self.cipher.encrypt_to(input, &mut writer),
            Mode::Decrypt => self.cipher.decrypt_to(input, &mut writer),
        }
        .map_err(|e| e.with_path(src))?;

        writer.flush().map_err(|e| BkError::io(partial, e))?;
        let out = writer
            .into_inner()
            .map_err(|e| BkError::io(partial, e.into_error()))?;
        out.sync_all().map_err(|e| BkError::io(partial, e))?;
        Ok(bytes)
    }

    fn verify_dir(&self, dir: &Path, report: &mut ReplicateReport) -> BkResult<()> {
        for name in sorted_children(dir)? {
            let path = dir.join(&name);
            if let Err(e) = self.verify_entry(&path, report) {
                self.handle_failure(&path, e, report)?;
            }
        }
        Ok(())
    }

    fn verify_entry(&self, path: &Path, report: &mut ReplicateReport) -> BkResult<()> {
        let meta = fs::symlink_metadata(path).map_err(|e| BkError::io(path, e))?;
        match EntryKind::from_file_type(meta.file_type()) {
            EntryKind::Directory => {
                self.verify_dir(path, report)?;
                report.dirs += 1;
            }
            EntryKind::Symlink => report.symlinks += 1,
            EntryKind::File => {
                let input = File::open(path).map_err(|e| BkError::io(path, e))?;
                let bytes = self
                    .cipher
                    .decrypt_to(input, &mut std::io::sink())
                    .map_err(|e| e.with_path(path))?;
                report.bytes += bytes;
                report.files += 1;
                debug!(path = %path.display(), bytes, "verified file");
                if let Some(cb) = self.progress {
                    cb(path, bytes);
                }
            }
            EntryKind::Other => report.skipped += 1,
        }
        Ok(())
    }

    fn handle_failure(&self, path: &Path, err: BkError, report: &mut ReplicateReport) -> BkResult<()> {
        match self.policy {
            FailurePolicy::FailFast => match err {
                BkError::Entry { .. } => Err(err),
                other => Err(BkError::entry(path, other)),
            },
            FailurePolicy::BestEffort => {
                warn!(
                    path = %path.display(),
                    kind = err.kind(),
                    error = %err,
                    "skipping entry"
                );
                report.failures.push(EntryFailure {
                    path: path.to_path_buf(),
                    kind: err.kind(),
                    message: err.to_string(),
                });
                Ok(())
            }
        }
    }
}

/// Child names of `dir` in byte order.
fn sorted_children(dir: &Path) -> BkResult<Vec<std::ffi::OsString>> {
    let mut names = fs::read_dir(dir)
        .map_err(|e| BkError::io(dir, e))?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BkError::io(dir, e))?;
    names.sort();
    Ok(names)
}

/// Create `dir` if it does not exist yet. Fresh directories start owner-only
/// until their final mode is applied.
pub fn ensure_dir(dir: &Path) -> BkResult<()> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(BkError::AlreadyExists(dir.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| BkError::io(dir, e)),
        Err(e) => Err(BkError::io(dir, e)),
    }
}

/// Give the owner full access to an existing replica directory so a rerun
/// can fill it. Its recorded mode is put back after the walk.
fn open_for_writing(dir: &Path) -> BkResult<()> {
    let mode = fs::metadata(dir).map_err(|e| BkError::io(dir, e))?.mode() & 0o7777;
    if mode & 0o700 == 0o700 {
        return Ok(());
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o700))
        .map_err(|e| BkError::io(dir, e))
}

/// Recreate the symlink at `src` under `dst` without following it. An
/// existing link is kept if it points at the same target, replaced otherwise.
fn copy_symlink(src: &Path, dst: &Path) -> BkResult<()> {
    let target = fs::read_link(src).map_err(|e| BkError::io(src, e))?;

    match fs::symlink_metadata(dst) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let existing = fs::read_link(dst).map_err(|e| BkError::io(dst, e))?;
            if existing == target {
                return Ok(());
            }
            fs::remove_file(dst).map_err(|e| BkError::io(dst, e))?;
        }
        Ok(_) => return Err(BkError::AlreadyExists(dst.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(BkError::io(dst, e)),
    }

    std::os::unix::fs::symlink(&target, dst).map_err(|e| BkError::io(dst, e))
}

fn partial_path(dst: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(dst.file_name().unwrap_or_default());
    name.push(PARTIAL_SUFFIX);
    dst.with_file_name(name)
}
